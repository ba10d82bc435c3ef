//! Logging interface handed to rules.
//!
//! Rules log through the [`Logger`] trait so hosts can route engine
//! messages wherever they like. Messages are printf-style templates; the
//! default [`LogLogger`] renders them with [`sprintf`] and forwards the
//! result to the `log` facade.

use log::Level;
use serde_json::{Map, Value};

const LOG_TARGET: &str = "request_guard";

fn render_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_number(value: &Value, truncate: bool) -> Option<String> {
    let number = value.as_f64()?;
    if truncate || number.fract() == 0.0 {
        if let Some(int) = value.as_i64() {
            return Some(int.to_string());
        }
        return Some(format!("{}", number.trunc()));
    }
    Some(number.to_string())
}

/// Substitute `%s %d %i %j %o %O` placeholders with `args`
///
/// `%%` yields a single `%`. A placeholder without a matching argument,
/// or a numeric placeholder given a non-number, is kept verbatim.
pub fn sprintf(template: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(&spec) = chars.peek() else {
            out.push('%');
            break;
        };
        match spec {
            '%' => {
                chars.next();
                out.push('%');
            }
            's' | 'd' | 'i' | 'j' | 'o' | 'O' => {
                chars.next();
                let rendered = args.next().and_then(|arg| match spec {
                    's' => Some(render_string(arg)),
                    'd' => render_number(arg, false),
                    'i' => render_number(arg, true),
                    _ => Some(arg.to_string()),
                });
                match rendered {
                    Some(text) => out.push_str(&text),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            _ => out.push('%'),
        }
    }

    out
}

/// Logging capability passed to rules through the context
pub trait Logger: Send + Sync {
    /// Emit one message with optional structured fields merged in
    fn log(&self, level: Level, fields: Option<&Map<String, Value>>, message: &str, args: &[Value]);

    fn debug(&self, message: &str, args: &[Value]) {
        self.log(Level::Debug, None, message, args);
    }

    fn info(&self, message: &str, args: &[Value]) {
        self.log(Level::Info, None, message, args);
    }

    fn warn(&self, message: &str, args: &[Value]) {
        self.log(Level::Warn, None, message, args);
    }

    fn error(&self, message: &str, args: &[Value]) {
        self.log(Level::Error, None, message, args);
    }
}

/// Default logger forwarding to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLogger;

impl LogLogger {
    fn render(fields: Option<&Map<String, Value>>, message: &str, args: &[Value]) -> String {
        let mut line = sprintf(message, args);
        if let Some(fields) = fields {
            for (key, value) in fields {
                line.push(' ');
                line.push_str(key);
                line.push('=');
                line.push_str(&render_string(value));
            }
        }
        line
    }
}

impl Logger for LogLogger {
    fn log(
        &self,
        level: Level,
        fields: Option<&Map<String, Value>>,
        message: &str,
        args: &[Value],
    ) {
        if log::log_enabled!(target: LOG_TARGET, level) {
            log::log!(target: LOG_TARGET, level, "{}", Self::render(fields, message, args));
        }
    }
}

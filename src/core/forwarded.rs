//! RFC 7239 `Forwarded` header parsing.
//!
//! The header is tokenized by a small state machine rather than a pattern so
//! that quoted-string escapes are handled exactly. Parsing is lazy: each
//! comma separated element is produced on demand as a [`ForwardedElement`].
//! Parsing the same input again always yields the same sequence.

use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

/// Errors raised for malformed `Forwarded` header values
///
/// Each variant covers one class of malformation and carries the byte
/// offset of the offending input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardedError {
    #[error("unexpected leading whitespace at {0}")]
    LeadingWhitespace(usize),
    #[error(
        "unexpected character {found:?} before field name at {at}: \
         expected a token character"
    )]
    BeforeName { found: char, at: usize },
    #[error("unexpected {found} in field name at {at}: expected a token character or `=`")]
    InName { found: Found, at: usize },
    #[error("unexpected {found} before quoted value at {at}: expected `=` or an escape")]
    BeforeValue { found: Found, at: usize },
    #[error(
        "unexpected character {found:?} in quoted value at {at}: \
         expected tab, space or visible ASCII"
    )]
    InQuotedValue { found: char, at: usize },
    #[error("unterminated quoted string at {0}: expected a closing `\"` or an escaped character")]
    UnterminatedQuote(usize),
    #[error(
        "unexpected character {found:?} after field at {at}: \
         expected `\"` or a token character"
    )]
    AfterField { found: char, at: usize },
    #[error(
        "unexpected character {found:?} in unquoted value at {at}: \
         expected a token character or `=` (values containing `:` such as \
         ports or IPv6 addresses must be quoted)"
    )]
    InUnquotedValue { found: char, at: usize },
}

/// What the tokenizer found where something else was expected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    Char(char),
    EndOfInput,
}

impl std::fmt::Display for Found {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Found::Char(c) => write!(f, "character {:?}", c),
            Found::EndOfInput => f.write_str("end of input"),
        }
    }
}

/// One forwarded element: the ordered `name=value` pairs between commas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedElement {
    fields: Vec<(String, String)>,
}

impl ForwardedElement {
    /// Look up a field; names are case-insensitive
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Fields in the order they appeared, names lower-cased
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn insert(&mut self, name: String, value: String) {
        self.fields.push((name, value));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeforeName,
    Name,
    BeforeValue,
    QuotedValue,
    QuotedEscape,
    UnquotedValue,
    AfterField,
}

/// Lazy iterator over the elements of a `Forwarded` header
///
/// Stops after the first error.
#[derive(Debug, Clone)]
pub struct ForwardedElements<'a> {
    chars: Peekable<CharIndices<'a>>,
    input_len: usize,
    started: bool,
    done: bool,
}

/// Parse a `Forwarded` header value
pub fn parse_forwarded(input: &str) -> ForwardedElements<'_> {
    ForwardedElements {
        chars: input.char_indices().peekable(),
        input_len: input.len(),
        started: false,
        done: false,
    }
}

/// RFC 7230 `tchar`
pub(crate) fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

fn is_quoted_text(c: char) -> bool {
    c == '\t'
        || c == ' '
        || ('\u{21}'..='\u{7e}').contains(&c)
        || ('\u{80}'..='\u{ff}').contains(&c)
}

impl<'a> ForwardedElements<'a> {
    fn skip_list_whitespace(&mut self) {
        while let Some((_, c)) = self.chars.peek() {
            if *c == ' ' || *c == '\t' {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn next_element(&mut self) -> Result<Option<ForwardedElement>, ForwardedError> {
        if !self.started {
            self.started = true;
            if let Some(&(at, c)) = self.chars.peek() {
                if c == ' ' || c == '\t' {
                    return Err(ForwardedError::LeadingWhitespace(at));
                }
            }
        }

        if self.chars.peek().is_none() {
            return Ok(None);
        }

        let mut element = ForwardedElement::default();
        let mut state = State::BeforeName;
        let mut name = String::new();
        let mut value = String::new();

        loop {
            let next = self.chars.next();
            match (state, next) {
                (State::BeforeName, None) => return Ok(Some(element)),
                (State::BeforeName, Some((_, ';'))) => {}
                (State::BeforeName, Some((_, ','))) => {
                    self.skip_list_whitespace();
                    return Ok(Some(element));
                }
                (State::BeforeName, Some((_, c))) if is_token_char(c) => {
                    name.push(c.to_ascii_lowercase());
                    state = State::Name;
                }
                (State::BeforeName, Some((at, c))) => {
                    return Err(ForwardedError::BeforeName { found: c, at });
                }

                (State::Name, Some((_, '='))) => state = State::BeforeValue,
                (State::Name, Some((_, c))) if is_token_char(c) => {
                    name.push(c.to_ascii_lowercase())
                }
                (State::Name, Some((at, c))) => {
                    return Err(ForwardedError::InName { found: Found::Char(c), at });
                }
                (State::Name, None) => {
                    return Err(ForwardedError::InName {
                        found: Found::EndOfInput,
                        at: self.input_len,
                    });
                }

                (State::BeforeValue, Some((_, '"'))) => state = State::QuotedValue,
                (State::BeforeValue, Some((_, c))) if is_token_char(c) => {
                    value.push(c);
                    state = State::UnquotedValue;
                }
                (State::BeforeValue, Some((at, c))) => {
                    return Err(ForwardedError::BeforeValue { found: Found::Char(c), at });
                }
                (State::BeforeValue, None) => {
                    return Err(ForwardedError::BeforeValue {
                        found: Found::EndOfInput,
                        at: self.input_len,
                    });
                }

                (State::QuotedValue, Some((_, '"'))) => {
                    element.insert(std::mem::take(&mut name), std::mem::take(&mut value));
                    state = State::AfterField;
                }
                (State::QuotedValue, Some((_, '\\'))) => state = State::QuotedEscape,
                (State::QuotedValue, Some((_, c))) if is_quoted_text(c) => value.push(c),
                (State::QuotedValue, Some((at, c))) => {
                    return Err(ForwardedError::InQuotedValue { found: c, at });
                }
                (State::QuotedValue, None) | (State::QuotedEscape, None) => {
                    return Err(ForwardedError::UnterminatedQuote(self.input_len));
                }
                (State::QuotedEscape, Some((_, c))) => {
                    value.push(c);
                    state = State::QuotedValue;
                }

                (State::UnquotedValue, Some((_, c))) if is_token_char(c) || c == '=' => {
                    value.push(c)
                }
                (State::UnquotedValue, Some((_, ';'))) => {
                    element.insert(std::mem::take(&mut name), std::mem::take(&mut value));
                    state = State::BeforeName;
                }
                (State::UnquotedValue, Some((_, ','))) => {
                    element.insert(std::mem::take(&mut name), std::mem::take(&mut value));
                    self.skip_list_whitespace();
                    return Ok(Some(element));
                }
                (State::UnquotedValue, Some((at, c))) => {
                    return Err(ForwardedError::InUnquotedValue { found: c, at });
                }
                (State::UnquotedValue, None) => {
                    element.insert(std::mem::take(&mut name), std::mem::take(&mut value));
                    return Ok(Some(element));
                }

                (State::AfterField, None) => return Ok(Some(element)),
                (State::AfterField, Some((_, ';'))) => state = State::BeforeName,
                (State::AfterField, Some((_, ','))) => {
                    self.skip_list_whitespace();
                    return Ok(Some(element));
                }
                (State::AfterField, Some((at, c))) => {
                    return Err(ForwardedError::AfterField { found: c, at });
                }
            }
        }
    }
}

impl<'a> Iterator for ForwardedElements<'a> {
    type Item = Result<ForwardedElement, ForwardedError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_element() {
            Ok(Some(element)) => Some(Ok(element)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> std::iter::FusedIterator for ForwardedElements<'a> {}

/// The `for` values of every element, in header order
///
/// Any malformation makes the whole header unusable.
pub fn forwarded_for(input: &str) -> Result<Vec<String>, ForwardedError> {
    let mut values = Vec::new();
    for element in parse_forwarded(input) {
        if let Some(value) = element?.get("for") {
            values.push(value.to_string());
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(input: &str) -> Result<Vec<ForwardedElement>, ForwardedError> {
        parse_forwarded(input).collect()
    }

    #[test]
    fn test_simple_element() {
        let elements = collect("for=192.0.2.60;proto=http;by=203.0.113.43").unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].get("for"), Some("192.0.2.60"));
        assert_eq!(elements[0].get("proto"), Some("http"));
        assert_eq!(elements[0].get("BY"), Some("203.0.113.43"));
    }

    #[test]
    fn test_multiple_elements() {
        let header = "for=192.0.2.43, for=198.51.100.17,for=\"[2001:db8:cafe::17]:4711\"";
        let elements = collect(header).unwrap();
        let values: Vec<_> = elements.iter().map(|e| e.get("for").unwrap()).collect();
        assert_eq!(values, vec!["192.0.2.43", "198.51.100.17", "[2001:db8:cafe::17]:4711"]);
    }

    #[test]
    fn test_escape_yields_literal_character() {
        let elements = collect("a=\"b\\c\"").unwrap();
        assert_eq!(elements[0].fields(), &[("a".to_string(), "bc".to_string())]);

        let elements = collect(r#"a="x\"y""#).unwrap();
        assert_eq!(elements[0].get("a"), Some("x\"y"));
    }

    #[test]
    fn test_names_are_lowercased() {
        let elements = collect("For=\"_gazonk\"").unwrap();
        assert_eq!(elements[0].fields()[0].0, "for");
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(collect("").unwrap().is_empty());
    }

    #[test]
    fn test_restartable() {
        let input = "for=1.1.1.1;proto=https, for=8.8.8.8";
        let first = collect(input).unwrap();
        let second = collect(input).unwrap();
        assert_eq!(first, second);

        let parser = parse_forwarded(input);
        let cloned: Vec<_> = parser.clone().collect();
        let original: Vec<_> = parser.collect();
        assert_eq!(cloned, original);
    }

    #[test]
    fn test_leading_whitespace() {
        assert_eq!(collect(" for=1.1.1.1"), Err(ForwardedError::LeadingWhitespace(0)));
    }

    #[test]
    fn test_whitespace_before_name() {
        assert_eq!(
            collect("for=1.1.1.1; proto=http"),
            Err(ForwardedError::BeforeName { found: ' ', at: 12 })
        );
    }

    #[test]
    fn test_bad_name_character() {
        assert!(matches!(
            collect("fo@r=1.1.1.1"),
            Err(ForwardedError::InName { found: Found::Char('@'), .. })
        ));
        assert!(matches!(
            collect("for"),
            Err(ForwardedError::InName { found: Found::EndOfInput, .. })
        ));
    }

    #[test]
    fn test_bad_value_start() {
        assert!(matches!(
            collect("for= 1.1.1.1"),
            Err(ForwardedError::BeforeValue { found: Found::Char(' '), .. })
        ));
        assert!(matches!(
            collect("for="),
            Err(ForwardedError::BeforeValue { found: Found::EndOfInput, .. })
        ));
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(collect("a=\"b"), Err(ForwardedError::UnterminatedQuote(4)));
        assert_eq!(collect("a=\"b\\"), Err(ForwardedError::UnterminatedQuote(5)));
    }

    #[test]
    fn test_trailing_quote_after_field() {
        assert_eq!(
            collect("a=\"b\"\""),
            Err(ForwardedError::AfterField { found: '"', at: 5 })
        );
    }

    #[test]
    fn test_error_messages_name_the_expected_input() {
        let before_value = collect("for= 1.1.1.1").unwrap_err().to_string();
        assert_eq!(
            before_value,
            "unexpected character ' ' before quoted value at 4: expected `=` or an escape"
        );

        let after_field = collect("a=\"b\" ").unwrap_err().to_string();
        assert_eq!(
            after_field,
            "unexpected character ' ' after field at 5: expected `\"` or a token character"
        );
    }

    #[test]
    fn test_control_character_in_quoted_value() {
        assert!(matches!(
            collect("a=\"b\u{7}\""),
            Err(ForwardedError::InQuotedValue { found: '\u{7}', .. })
        ));
    }

    #[test]
    fn test_unquoted_colon_requires_quoting() {
        let err = collect("for=[2001:db8::1]").unwrap_err();
        assert!(matches!(err, ForwardedError::BeforeValue { found: Found::Char('['), .. }));

        let err = collect("for=1.2.3.4:8080").unwrap_err();
        assert!(matches!(err, ForwardedError::InUnquotedValue { found: ':', .. }));
        assert!(err.to_string().contains("must be quoted"));
    }

    #[test]
    fn test_error_stops_iteration() {
        let mut parser = parse_forwarded("for=1.1.1.1, for=@");
        assert!(parser.next().unwrap().is_ok());
        assert!(parser.next().unwrap().is_err());
        assert!(parser.next().is_none());
    }

    #[test]
    fn test_forwarded_for_values() {
        let values = forwarded_for("for=1.1.1.1;proto=http, by=2.2.2.2, for=\"[::1]\"").unwrap();
        assert_eq!(values, vec!["1.1.1.1", "[::1]"]);
    }
}

//! Request analysis capability.
//!
//! Local rules delegate classification to an [`AnalysisEngine`]. The
//! [`BasicAnalyzer`] shipped here works from small fixed tables; hosts with a
//! richer engine plug it in through the same trait.

use std::collections::BTreeSet;
use std::net::IpAddr;
use async_trait::async_trait;
use thiserror::Error;
use crate::core::rules::{BotConfig, CustomDetector, EmailOptions, SensitiveInfoOptions};
use crate::models::{EmailType, EntityType, Request, SensitiveEntity};

/// Errors that can occur during analysis
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("analysis not supported: {0}")]
    Unsupported(String),
    #[error("analysis failed: {0}")]
    Failed(String),
}

/// Bots seen on a request, split by the rule's allow/deny configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotResult {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    pub verified: bool,
    pub spoofed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailValidity {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailResult {
    pub validity: EmailValidity,
    /// Detected types the rule's options block
    pub blocked: Vec<EmailType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensitiveInfoResult {
    pub allowed: Vec<SensitiveEntity>,
    pub denied: Vec<SensitiveEntity>,
}

/// Classification capability used by local rules
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn detect_bot(
        &self,
        request: &Request,
        config: &BotConfig,
    ) -> Result<BotResult, AnalysisError>;

    async fn is_valid_email(
        &self,
        candidate: &str,
        options: &EmailOptions,
    ) -> Result<EmailResult, AnalysisError>;

    async fn detect_sensitive_info(
        &self,
        content: &str,
        options: &SensitiveInfoOptions,
        detector: Option<&CustomDetector>,
    ) -> Result<SensitiveInfoResult, AnalysisError>;

    /// Fingerprint `request` from the given characteristic names
    async fn generate_fingerprint(
        &self,
        request: &Request,
        characteristics: &[String],
    ) -> Result<String, AnalysisError>;
}

struct BotSignature {
    name: &'static str,
    category: &'static str,
    /// Lower-cased user-agent substring
    pattern: &'static str,
}

const fn bot(name: &'static str, category: &'static str, pattern: &'static str) -> BotSignature {
    BotSignature { name, category, pattern }
}

const BOT_SIGNATURES: &[BotSignature] = &[
    bot("CURL", "CATEGORY:TOOL", "curl/"),
    bot("WGET", "CATEGORY:TOOL", "wget/"),
    bot("HTTPIE", "CATEGORY:TOOL", "httpie/"),
    bot("POSTMAN", "CATEGORY:TOOL", "postmanruntime/"),
    bot("PYTHON_REQUESTS", "CATEGORY:PROGRAMMATIC", "python-requests/"),
    bot("PYTHON_URLLIB", "CATEGORY:PROGRAMMATIC", "python-urllib/"),
    bot("PYTHON_AIOHTTP", "CATEGORY:PROGRAMMATIC", "aiohttp/"),
    bot("GO_HTTP", "CATEGORY:PROGRAMMATIC", "go-http-client/"),
    bot("JAVA_HTTP", "CATEGORY:PROGRAMMATIC", "java/"),
    bot("AXIOS", "CATEGORY:PROGRAMMATIC", "axios/"),
    bot("NODE_FETCH", "CATEGORY:PROGRAMMATIC", "node-fetch/"),
    bot("RUST_REQWEST", "CATEGORY:PROGRAMMATIC", "reqwest/"),
    bot("GOOGLE_CRAWLER", "CATEGORY:SEARCH_ENGINE", "googlebot"),
    bot("BING_CRAWLER", "CATEGORY:SEARCH_ENGINE", "bingbot"),
    bot("DUCKDUCKGO_CRAWLER", "CATEGORY:SEARCH_ENGINE", "duckduckbot"),
    bot("YANDEX_CRAWLER", "CATEGORY:SEARCH_ENGINE", "yandexbot"),
    bot("BAIDU_CRAWLER", "CATEGORY:SEARCH_ENGINE", "baiduspider"),
    bot("FACEBOOK_CRAWLER", "CATEGORY:SOCIAL", "facebookexternalhit"),
    bot("TWITTER_CRAWLER", "CATEGORY:SOCIAL", "twitterbot"),
    bot("SLACK_CRAWLER", "CATEGORY:SOCIAL", "slackbot"),
    bot("UPTIMEROBOT", "CATEGORY:MONITOR", "uptimerobot"),
    bot("PINGDOM", "CATEGORY:MONITOR", "pingdom"),
];

const FREE_PROVIDERS: &[&str] = &[
    "aol.com",
    "gmail.com",
    "gmx.com",
    "googlemail.com",
    "hotmail.com",
    "icloud.com",
    "live.com",
    "mail.com",
    "outlook.com",
    "proton.me",
    "protonmail.com",
    "yahoo.com",
    "yandex.com",
    "zoho.com",
];

const DISPOSABLE_PROVIDERS: &[&str] = &[
    "10minutemail.com",
    "dispostable.com",
    "getnada.com",
    "guerrillamail.com",
    "mailinator.com",
    "maildrop.cc",
    "sharklasers.com",
    "temp-mail.org",
    "tempmail.com",
    "throwawaymail.com",
    "trashmail.com",
    "yopmail.com",
];

const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 253;
const MAX_LABEL: usize = 63;

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn valid_local_part(local: &str) -> bool {
    !local.is_empty()
        && local.len() <= MAX_LOCAL_PART
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..")
        && local.chars().all(|c| {
            !c.is_whitespace()
                && !c.is_control()
                && !matches!(
                    c,
                    '@' | '"' | '(' | ')' | ',' | ':' | ';' | '<' | '>' | '[' | '\\' | ']'
                )
        })
}

fn valid_domain(domain: &str, options: &EmailOptions) -> bool {
    if let Some(literal) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        let literal = literal.strip_prefix("IPv6:").unwrap_or(literal);
        return options.allow_domain_literal && literal.parse::<IpAddr>().is_ok();
    }
    if domain.is_empty() || domain.len() > MAX_DOMAIN {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if !labels.iter().all(|label| valid_label(label)) {
        return false;
    }
    if options.require_top_level_domain {
        let tld = labels.last().copied().unwrap_or_default();
        return labels.len() >= 2 && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());
    }
    true
}

/// Syntax check for an email address
pub fn is_email_syntax_valid(candidate: &str, options: &EmailOptions) -> bool {
    match candidate.rsplit_once('@') {
        Some((local, domain)) => valid_local_part(local) && valid_domain(domain, options),
        None => false,
    }
}

/// Luhn checksum over the digits of `number`
fn luhn(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn digits_of(token: &str) -> Vec<u32> {
    token.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn builtin_entity(token: &str) -> Option<EntityType> {
    let strict = EmailOptions::deny(Vec::new());
    if token.contains('@') && is_email_syntax_valid(token, &strict) {
        return Some(EntityType::Email);
    }
    if token.parse::<IpAddr>().is_ok() {
        return Some(EntityType::IpAddress);
    }

    let digits = digits_of(token);
    let card_shaped = token.chars().all(|c| c.is_ascii_digit() || c == '-');
    if card_shaped && (13..=19).contains(&digits.len()) && luhn(&digits) {
        return Some(EntityType::CreditCardNumber);
    }
    let phone_shaped = token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.'));
    if phone_shaped && (10..=15).contains(&digits.len()) {
        return Some(EntityType::PhoneNumber);
    }
    None
}

/// A whitespace-separated token with character offsets
#[derive(Debug, Clone, PartialEq, Eq)]
struct Token<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

const TRIM: &[char] = &['.', ',', ';', ':', '!', '?', '"', '\'', '<', '>', '[', ']', '{', '}'];

fn tokenize(content: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start: Option<(usize, usize)> = None;
    let mut char_index = 0;

    let mut push = |byte_start: usize, byte_end: usize, char_start: usize| {
        let raw = &content[byte_start..byte_end];
        let leading = raw.len() - raw.trim_start_matches(TRIM).len();
        let text = raw.trim_start_matches(TRIM).trim_end_matches(TRIM);
        if text.is_empty() {
            return;
        }
        let start = char_start + raw[..leading].chars().count();
        tokens.push(Token {
            text,
            start,
            end: start + text.chars().count(),
        });
    };

    for (byte, c) in content.char_indices() {
        if c.is_whitespace() {
            if let Some((byte_start, char_start)) = start.take() {
                push(byte_start, byte, char_start);
            }
        } else if start.is_none() {
            start = Some((byte, char_index));
        }
        char_index += 1;
    }
    if let Some((byte_start, char_start)) = start {
        push(byte_start, content.len(), char_start);
    }
    tokens
}

/// Table-driven analysis engine
#[derive(Debug, Clone, Default)]
pub struct BasicAnalyzer;

impl BasicAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnalysisEngine for BasicAnalyzer {
    async fn detect_bot(
        &self,
        request: &Request,
        config: &BotConfig,
    ) -> Result<BotResult, AnalysisError> {
        let user_agent = request
            .headers()
            .get("user-agent")
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut result = BotResult::default();
        let mut seen = BTreeSet::new();

        for signature in BOT_SIGNATURES.iter().filter(|s| user_agent.contains(s.pattern)) {
            if !seen.insert(signature.name) {
                continue;
            }
            let denied =
                config.denies_by(|entry| entry == signature.name || entry == signature.category);
            if denied {
                result.denied.push(signature.name.to_string());
            } else {
                result.allowed.push(signature.name.to_string());
            }
        }
        Ok(result)
    }

    async fn is_valid_email(
        &self,
        candidate: &str,
        options: &EmailOptions,
    ) -> Result<EmailResult, AnalysisError> {
        let mut detected = Vec::new();
        let validity = if is_email_syntax_valid(candidate, options) {
            let domain = candidate
                .rsplit_once('@')
                .map(|(_, domain)| domain.to_ascii_lowercase())
                .unwrap_or_default();
            if FREE_PROVIDERS.contains(&domain.as_str()) {
                detected.push(EmailType::Free);
            }
            if DISPOSABLE_PROVIDERS.contains(&domain.as_str()) {
                detected.push(EmailType::Disposable);
            }
            EmailValidity::Valid
        } else {
            detected.push(EmailType::Invalid);
            EmailValidity::Invalid
        };

        let blocked = detected.into_iter().filter(|t| options.filter.denies(t)).collect();
        Ok(EmailResult { validity, blocked })
    }

    async fn detect_sensitive_info(
        &self,
        content: &str,
        options: &SensitiveInfoOptions,
        detector: Option<&CustomDetector>,
    ) -> Result<SensitiveInfoResult, AnalysisError> {
        let tokens = tokenize(content);
        let mut labels: Vec<Option<EntityType>> = vec![None; tokens.len()];

        if let Some(detector) = detector {
            let window = options.context_window_size.max(1);
            for (chunk_index, chunk) in tokens.chunks(window).enumerate() {
                let texts: Vec<&str> = chunk.iter().map(|t| t.text).collect();
                for (offset, label) in detector(&texts).into_iter().take(chunk.len()).enumerate() {
                    labels[chunk_index * window + offset] = label;
                }
            }
        }

        let mut result = SensitiveInfoResult::default();
        for (token, label) in tokens.iter().zip(labels) {
            let Some(identified_type) = label.or_else(|| builtin_entity(token.text)) else {
                continue;
            };
            let denied = options.filter.denies(&identified_type);
            let entity = SensitiveEntity {
                start: token.start,
                end: token.end,
                identified_type,
            };
            if denied {
                result.denied.push(entity);
            } else {
                result.allowed.push(entity);
            }
        }
        Ok(result)
    }

    async fn generate_fingerprint(
        &self,
        _request: &Request,
        _characteristics: &[String],
    ) -> Result<String, AnalysisError> {
        Err(AnalysisError::Unsupported("fingerprint generation".to_string()))
    }
}

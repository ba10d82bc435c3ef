//! Protection rules.
//!
//! A rule inspects one request and produces a [`RuleResult`]. Local rules
//! (bots, email, sensitive info) decide on their own through the analysis
//! engine; remote rules (rate limits, shield) return a `NOT_RUN` placeholder
//! that the engine fills in from the decision service.

pub mod bot;
pub mod email;
pub mod rate_limit;
pub mod sensitive_info;
pub mod shield;

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::core::context::Context;
use crate::core::duration::DurationError;
use crate::core::fingerprint::FingerprintError;
use crate::models::{Mode, Request, RuleResult};

pub use bot::{detect_bot, BotConfig, DetectBot};
pub use email::{validate_email, EmailOptions, ValidateEmail};
pub use rate_limit::{
    fixed_window, sliding_window, token_bucket, FixedWindowOptions, RateLimit, RateLimitAlgorithm,
    SlidingWindowOptions, TokenBucketOptions,
};
pub use sensitive_info::{sensitive_info, CustomDetector, SensitiveInfo, SensitiveInfoOptions};
pub use shield::{shield, Shield};

pub const PRIORITY_SENSITIVE_INFO: u32 = 1;
pub const PRIORITY_SHIELD: u32 = 2;
pub const PRIORITY_RATE_LIMIT: u32 = 3;
pub const PRIORITY_BOT_DETECTION: u32 = 4;
pub const PRIORITY_EMAIL: u32 = 5;

/// Errors raised while configuring or validating a rule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("{rule} rule requires {requirement}")]
    MissingInput { rule: &'static str, requirement: String },
    #[error("invalid duration: {0}")]
    Duration(#[from] DurationError),
    #[error("invalid characteristic: {0}")]
    Characteristic(#[from] FingerprintError),
    #[error("invalid rule options: {0}")]
    InvalidOptions(String),
}

/// Allow-list or deny-list over some kind of item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter<T> {
    /// Everything outside the list is denied
    Allow(Vec<T>),
    /// Everything in the list is denied
    Deny(Vec<T>),
}

impl<T: PartialEq> Filter<T> {
    /// Whether an item matched by `covers` is denied
    pub fn denies_by(&self, covers: impl Fn(&T) -> bool) -> bool {
        match self {
            Filter::Allow(list) => !list.iter().any(covers),
            Filter::Deny(list) => list.iter().any(covers),
        }
    }

    pub fn denies(&self, item: &T) -> bool {
        self.denies_by(|candidate| candidate == item)
    }
}

/// A pluggable protection rule
#[async_trait]
pub trait Rule: Send + Sync + fmt::Debug {
    /// Type tag, e.g. `"BOT"`
    fn rule_type(&self) -> &'static str;

    fn mode(&self) -> Mode;

    /// Rules run in ascending priority bands
    fn priority(&self) -> u32;

    fn version(&self) -> u32 {
        0
    }

    /// Rule-specific options; stable for a given configuration
    fn options(&self) -> serde_json::Value;

    /// Whether the decision service evaluates this rule
    fn is_remote(&self) -> bool {
        false
    }

    /// Check that the request carries what this rule needs
    fn validate(&self, _context: &Context, _request: &Request) -> Result<(), RuleError> {
        Ok(())
    }

    async fn protect(&self, context: &Context, request: &Request) -> anyhow::Result<RuleResult>;
}

/// Anything that can be added to an engine: a rule or a group of rules
pub trait IntoRules {
    fn into_rules(self) -> Vec<Arc<dyn Rule>>;
}

impl<R: Rule + 'static> IntoRules for R {
    fn into_rules(self) -> Vec<Arc<dyn Rule>> {
        vec![Arc::new(self)]
    }
}

impl IntoRules for Arc<dyn Rule> {
    fn into_rules(self) -> Vec<Arc<dyn Rule>> {
        vec![self]
    }
}

impl IntoRules for Vec<Arc<dyn Rule>> {
    fn into_rules(self) -> Vec<Arc<dyn Rule>> {
        self
    }
}

/// Signup form protection: bot detection, a rate limit and email validation
pub fn protect_signup(
    bots: DetectBot,
    rate_limit: RateLimit,
    email: ValidateEmail,
) -> Vec<Arc<dyn Rule>> {
    vec![Arc::new(bots), Arc::new(rate_limit), Arc::new(email)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailType;

    #[test]
    fn test_filter_semantics() {
        let deny = Filter::Deny(vec![EmailType::Disposable]);
        assert!(deny.denies(&EmailType::Disposable));
        assert!(!deny.denies(&EmailType::Free));

        let allow = Filter::Allow(vec![EmailType::Free]);
        assert!(!allow.denies(&EmailType::Free));
        assert!(allow.denies(&EmailType::Disposable));
    }

    #[test]
    fn test_filter_wire_format() {
        let filter: Filter<String> = Filter::Deny(vec!["CURL".to_string()]);
        assert_eq!(serde_json::to_value(&filter).unwrap(), serde_json::json!({"deny": ["CURL"]}));
    }

    #[test]
    fn test_protect_signup_groups_three_rules() {
        let rules = protect_signup(
            detect_bot(Mode::Live, Filter::Allow(vec![])),
            fixed_window(Mode::Live, FixedWindowOptions::new(5, "10m")).unwrap(),
            validate_email(Mode::Live, EmailOptions::deny(vec![EmailType::Disposable])),
        );
        let types: Vec<_> = rules.iter().map(|r| r.rule_type()).collect();
        assert_eq!(types, vec!["BOT", "RATE_LIMIT", "EMAIL"]);
    }
}

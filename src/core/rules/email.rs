//! Email validation rule.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use crate::core::context::Context;
use crate::core::rules::{Filter, Rule, RuleError, PRIORITY_EMAIL};
use crate::models::{EmailReason, EmailType, Mode, Reason, Request, RuleResult};

/// Options for [`ValidateEmail`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailOptions {
    /// Which email types are blocked
    pub filter: Filter<EmailType>,
    /// Reject addresses whose domain has no top-level domain
    pub require_top_level_domain: bool,
    /// Accept `user@[192.0.2.1]` style domains
    pub allow_domain_literal: bool,
}

impl EmailOptions {
    /// Block the given email types
    pub fn deny(types: Vec<EmailType>) -> Self {
        Self {
            filter: Filter::Deny(types),
            require_top_level_domain: true,
            allow_domain_literal: false,
        }
    }

    /// Block every email type except the given ones
    pub fn allow(types: Vec<EmailType>) -> Self {
        Self {
            filter: Filter::Allow(types),
            ..Self::deny(Vec::new())
        }
    }

    pub fn require_top_level_domain(mut self, required: bool) -> Self {
        self.require_top_level_domain = required;
        self
    }

    pub fn allow_domain_literal(mut self, allowed: bool) -> Self {
        self.allow_domain_literal = allowed;
        self
    }
}

/// Validates the email address supplied with the request
#[derive(Debug, Clone)]
pub struct ValidateEmail {
    mode: Mode,
    options: EmailOptions,
}

/// Create an email validation rule
pub fn validate_email(mode: Mode, options: EmailOptions) -> ValidateEmail {
    ValidateEmail { mode, options }
}

#[async_trait]
impl Rule for ValidateEmail {
    fn rule_type(&self) -> &'static str {
        "EMAIL"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn priority(&self) -> u32 {
        PRIORITY_EMAIL
    }

    fn options(&self) -> serde_json::Value {
        json!(self.options)
    }

    fn validate(&self, _context: &Context, request: &Request) -> Result<(), RuleError> {
        match request.email() {
            Some(email) if !email.is_empty() => Ok(()),
            _ => Err(RuleError::MissingInput {
                rule: "EMAIL",
                requirement: "an email address".to_string(),
            }),
        }
    }

    async fn protect(&self, context: &Context, request: &Request) -> anyhow::Result<RuleResult> {
        let Some(analysis) = context.analysis.as_ref() else {
            context.logger.warn("Email validation skipped: no analysis engine is configured", &[]);
            return Ok(RuleResult::not_run(Reason::Email(EmailReason::default())));
        };

        let email = request.email().unwrap_or_default();
        let outcome = analysis.is_valid_email(email, &self.options).await?;
        let denied = !outcome.blocked.is_empty();
        let reason = Reason::Email(EmailReason {
            email_types: outcome.blocked,
        });

        if denied {
            Ok(RuleResult::deny(reason))
        } else {
            Ok(RuleResult::allow(reason))
        }
    }
}

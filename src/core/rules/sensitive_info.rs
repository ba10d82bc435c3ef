//! Sensitive information detection rule.
//!
//! Scans the request body for entities such as email addresses, phone
//! numbers and card numbers. A custom detector can label tokens the built-in
//! detection does not know about.

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use crate::core::context::Context;
use crate::core::rules::{Filter, Rule, PRIORITY_SENSITIVE_INFO};
use crate::models::{EntityType, Mode, Reason, Request, RuleResult, SensitiveInfoReason};

/// Labels a window of tokens; one entry per token, `None` for "not sensitive"
pub type CustomDetector = Arc<dyn Fn(&[&str]) -> Vec<Option<EntityType>> + Send + Sync>;

/// Options for [`SensitiveInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveInfoOptions {
    /// Which entity types are blocked
    pub filter: Filter<EntityType>,
    /// Number of tokens handed to the custom detector at once
    pub context_window_size: usize,
}

impl SensitiveInfoOptions {
    pub fn deny(types: Vec<EntityType>) -> Self {
        Self {
            filter: Filter::Deny(types),
            context_window_size: 1,
        }
    }

    pub fn allow(types: Vec<EntityType>) -> Self {
        Self {
            filter: Filter::Allow(types),
            context_window_size: 1,
        }
    }

    pub fn context_window_size(mut self, size: usize) -> Self {
        self.context_window_size = size;
        self
    }
}

/// Detects sensitive information in the request body
#[derive(Clone)]
pub struct SensitiveInfo {
    mode: Mode,
    options: SensitiveInfoOptions,
    detector: Option<CustomDetector>,
}

/// Create a sensitive information rule
pub fn sensitive_info(mode: Mode, options: SensitiveInfoOptions) -> SensitiveInfo {
    SensitiveInfo {
        mode,
        options,
        detector: None,
    }
}

impl SensitiveInfo {
    /// Attach a custom entity detector
    pub fn with_detector<F>(mut self, detector: F) -> Self
    where
        F: Fn(&[&str]) -> Vec<Option<EntityType>> + Send + Sync + 'static,
    {
        self.detector = Some(Arc::new(detector));
        self
    }
}

impl fmt::Debug for SensitiveInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensitiveInfo")
            .field("mode", &self.mode)
            .field("options", &self.options)
            .field("detector", &self.detector.is_some())
            .finish()
    }
}

#[async_trait]
impl Rule for SensitiveInfo {
    fn rule_type(&self) -> &'static str {
        "SENSITIVE_INFO"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn priority(&self) -> u32 {
        PRIORITY_SENSITIVE_INFO
    }

    fn options(&self) -> serde_json::Value {
        json!({
            "filter": self.options.filter,
            "contextWindowSize": self.options.context_window_size,
            "customDetector": self.detector.is_some(),
        })
    }

    async fn protect(&self, context: &Context, _request: &Request) -> anyhow::Result<RuleResult> {
        let Some(analysis) = context.analysis.as_ref() else {
            context.logger.warn(
                "Sensitive info detection skipped: no analysis engine is configured",
                &[],
            );
            let reason = Reason::SensitiveInfo(SensitiveInfoReason::default());
            return Ok(RuleResult::not_run(reason));
        };

        let body = match context.body().await {
            Ok(body) => body,
            Err(err) => {
                context.logger.error("failed to get request body: %s", &[json!(err.to_string())]);
                return Ok(RuleResult::error(
                    "Couldn't read the body of the request to perform sensitive info \
                     identification.",
                ));
            }
        };

        let detected = analysis
            .detect_sensitive_info(&body, &self.options, self.detector.as_ref())
            .await?;
        let denied = !detected.denied.is_empty();
        let reason = Reason::SensitiveInfo(SensitiveInfoReason {
            allowed: detected.allowed,
            denied: detected.denied,
        });

        if denied {
            Ok(RuleResult::deny(reason))
        } else {
            Ok(RuleResult::allow(reason))
        }
    }
}

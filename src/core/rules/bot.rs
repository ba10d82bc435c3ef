//! Bot detection rule.

use async_trait::async_trait;
use serde_json::json;
use crate::core::context::Context;
use crate::core::rules::{Filter, Rule, RuleError, PRIORITY_BOT_DETECTION};
use crate::models::{BotReason, Mode, Reason, Request, RuleResult};

/// Seconds a bot denial stays cached
pub const BOT_DENY_TTL: u32 = 60;

/// Bot names or `CATEGORY:` labels to allow or deny
pub type BotConfig = Filter<String>;

/// Detects automated clients from the request's user agent
#[derive(Debug, Clone)]
pub struct DetectBot {
    mode: Mode,
    config: BotConfig,
}

/// Create a bot detection rule
pub fn detect_bot(mode: Mode, config: BotConfig) -> DetectBot {
    DetectBot { mode, config }
}

impl DetectBot {
    pub fn config(&self) -> &BotConfig {
        &self.config
    }
}

#[async_trait]
impl Rule for DetectBot {
    fn rule_type(&self) -> &'static str {
        "BOT"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn priority(&self) -> u32 {
        PRIORITY_BOT_DETECTION
    }

    fn options(&self) -> serde_json::Value {
        json!(self.config)
    }

    fn validate(&self, _context: &Context, request: &Request) -> Result<(), RuleError> {
        if request.headers().contains("user-agent") {
            Ok(())
        } else {
            Err(RuleError::MissingInput {
                rule: "BOT",
                requirement: "a user-agent header".to_string(),
            })
        }
    }

    async fn protect(&self, context: &Context, request: &Request) -> anyhow::Result<RuleResult> {
        let Some(analysis) = context.analysis.as_ref() else {
            context.logger.warn("Bot detection skipped: no analysis engine is configured", &[]);
            return Ok(RuleResult::not_run(Reason::Bot(BotReason::default())));
        };

        let detected = analysis.detect_bot(request, &self.config).await?;
        let denied = !detected.denied.is_empty();
        let reason = Reason::Bot(BotReason {
            allowed: detected.allowed,
            denied: detected.denied,
            verified: detected.verified,
            spoofed: detected.spoofed,
        });

        if denied {
            Ok(RuleResult::deny(reason).with_ttl(BOT_DENY_TTL))
        } else {
            Ok(RuleResult::allow(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::core::analysis::BasicAnalyzer;
    use crate::core::cache::MemoryCache;
    use crate::core::logger::testing::RecordingLogger;
    use crate::models::{Conclusion, RuleState};

    fn context(with_analysis: bool, logger: Arc<RecordingLogger>) -> Context {
        Context {
            key: "test-key".to_string(),
            fingerprint: "fp::2::test".to_string(),
            characteristics: vec!["ip.src".to_string()],
            runtime: "rust".to_string(),
            cache: Arc::new(MemoryCache::new()),
            logger,
            analysis: if with_analysis { Some(Arc::new(BasicAnalyzer::new())) } else { None },
            body: None,
        }
    }

    fn curl() -> Request {
        Request::builder().ip("8.8.8.8").header("User-Agent", "curl/8.1.2").build()
    }

    #[test]
    fn test_validate_requires_user_agent() {
        let rule = detect_bot(Mode::Live, Filter::Allow(vec![]));
        let ctx = context(true, Arc::default());
        assert!(rule.validate(&ctx, &curl()).is_ok());

        let err = rule.validate(&ctx, &Request::builder().ip("8.8.8.8").build()).unwrap_err();
        assert!(err.to_string().contains("user-agent"));
    }

    #[tokio::test]
    async fn test_curl_is_denied_when_nothing_is_allowed() {
        let rule = detect_bot(Mode::Live, Filter::Allow(vec![]));
        let result = rule.protect(&context(true, Arc::default()), &curl()).await.unwrap();

        assert_eq!(result.conclusion, Conclusion::Deny);
        assert_eq!(result.ttl, BOT_DENY_TTL);
        assert_eq!(
            result.reason,
            Reason::Bot(BotReason {
                allowed: vec![],
                denied: vec!["CURL".to_string()],
                verified: false,
                spoofed: false,
            })
        );
    }

    #[tokio::test]
    async fn test_allowed_category_passes() {
        let rule = detect_bot(Mode::Live, Filter::Allow(vec!["CATEGORY:TOOL".to_string()]));
        let result = rule.protect(&context(true, Arc::default()), &curl()).await.unwrap();
        assert_eq!(result.conclusion, Conclusion::Allow);
        assert!(matches!(
            result.reason,
            Reason::Bot(ref r) if r.allowed == vec!["CURL".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_missing_analysis_is_not_run() {
        let logger = Arc::new(RecordingLogger::default());
        let rule = detect_bot(Mode::Live, Filter::Allow(vec![]));
        let result = rule.protect(&context(false, logger.clone()), &curl()).await.unwrap();
        assert_eq!(result.state, RuleState::NotRun);
        assert_eq!(result.conclusion, Conclusion::Allow);
        assert!(logger.contains(log::Level::Warn, "no analysis engine"));
    }

    #[test]
    fn test_options_are_stable() {
        let rule = detect_bot(Mode::Live, Filter::Deny(vec!["CURL".to_string()]));
        assert_eq!(rule.options(), json!({"deny": ["CURL"]}));
        assert_eq!(rule.priority(), PRIORITY_BOT_DETECTION);
        assert!(!rule.is_remote());
    }
}

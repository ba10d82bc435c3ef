//! Rate limiting rules.
//!
//! Counters live in the decision service, so these rules only describe the
//! limit; the engine sends them through `decide` and stores the answer.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use crate::core::context::Context;
use crate::core::duration::{self, DurationInput};
use crate::core::fingerprint::parse_characteristics;
use crate::core::rules::{Rule, RuleError, PRIORITY_RATE_LIMIT};
use crate::models::{Mode, RateLimitReason, Reason, Request, RuleResult};

/// The limiting algorithm with its parsed parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "algorithm", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitAlgorithm {
    #[serde(rename_all = "camelCase")]
    FixedWindow { max: u32, window: u32 },
    #[serde(rename_all = "camelCase")]
    SlidingWindow { max: u32, interval: u32 },
    #[serde(rename_all = "camelCase")]
    TokenBucket { refill_rate: u32, interval: u32, capacity: u32 },
}

impl RateLimitAlgorithm {
    fn placeholder_reason(&self) -> RateLimitReason {
        let (max, window) = match *self {
            RateLimitAlgorithm::FixedWindow { max, window } => (max, window),
            RateLimitAlgorithm::SlidingWindow { max, interval } => (max, interval),
            RateLimitAlgorithm::TokenBucket { capacity, interval, .. } => (capacity, interval),
        };
        RateLimitReason {
            max,
            remaining: max,
            reset_in_seconds: 0,
            window_in_seconds: window,
        }
    }
}

/// Options for [`fixed_window`]
#[derive(Debug, Clone)]
pub struct FixedWindowOptions {
    pub max: u32,
    pub window: DurationInput,
    /// Overrides the engine's characteristics for this limit
    pub characteristics: Vec<String>,
}

impl FixedWindowOptions {
    pub fn new(max: u32, window: impl Into<DurationInput>) -> Self {
        Self {
            max,
            window: window.into(),
            characteristics: Vec::new(),
        }
    }
}

/// Options for [`sliding_window`]
#[derive(Debug, Clone)]
pub struct SlidingWindowOptions {
    pub max: u32,
    pub interval: DurationInput,
    pub characteristics: Vec<String>,
}

impl SlidingWindowOptions {
    pub fn new(max: u32, interval: impl Into<DurationInput>) -> Self {
        Self {
            max,
            interval: interval.into(),
            characteristics: Vec::new(),
        }
    }
}

/// Options for [`token_bucket`]
#[derive(Debug, Clone)]
pub struct TokenBucketOptions {
    pub refill_rate: u32,
    pub interval: DurationInput,
    pub capacity: u32,
    pub characteristics: Vec<String>,
}

impl TokenBucketOptions {
    pub fn new(refill_rate: u32, interval: impl Into<DurationInput>, capacity: u32) -> Self {
        Self {
            refill_rate,
            interval: interval.into(),
            capacity,
            characteristics: Vec::new(),
        }
    }
}

/// A rate limit evaluated by the decision service
#[derive(Debug, Clone)]
pub struct RateLimit {
    mode: Mode,
    algorithm: RateLimitAlgorithm,
    characteristics: Vec<String>,
}

impl RateLimit {
    fn new(
        mode: Mode,
        algorithm: RateLimitAlgorithm,
        characteristics: Vec<String>,
    ) -> Result<Self, RuleError> {
        parse_characteristics(&characteristics)?;
        Ok(Self {
            mode,
            algorithm,
            characteristics,
        })
    }

    /// Limit the characteristics this rule counts by
    pub fn with_characteristics(mut self, characteristics: Vec<String>) -> Result<Self, RuleError> {
        parse_characteristics(&characteristics)?;
        self.characteristics = characteristics;
        Ok(self)
    }

    pub fn algorithm(&self) -> &RateLimitAlgorithm {
        &self.algorithm
    }
}

/// Allow `max` requests per fixed `window`
pub fn fixed_window(mode: Mode, options: FixedWindowOptions) -> Result<RateLimit, RuleError> {
    let window = duration::parse(options.window)?;
    RateLimit::new(
        mode,
        RateLimitAlgorithm::FixedWindow { max: options.max, window },
        options.characteristics,
    )
}

/// Allow `max` requests in any trailing `interval`
pub fn sliding_window(mode: Mode, options: SlidingWindowOptions) -> Result<RateLimit, RuleError> {
    let interval = duration::parse(options.interval)?;
    RateLimit::new(
        mode,
        RateLimitAlgorithm::SlidingWindow { max: options.max, interval },
        options.characteristics,
    )
}

/// Refill `refill_rate` tokens every `interval`, holding at most `capacity`
pub fn token_bucket(mode: Mode, options: TokenBucketOptions) -> Result<RateLimit, RuleError> {
    let interval = duration::parse(options.interval)?;
    if options.capacity == 0 {
        return Err(RuleError::InvalidOptions("token bucket capacity must be positive".to_string()));
    }
    RateLimit::new(
        mode,
        RateLimitAlgorithm::TokenBucket {
            refill_rate: options.refill_rate,
            interval,
            capacity: options.capacity,
        },
        options.characteristics,
    )
}

#[async_trait]
impl Rule for RateLimit {
    fn rule_type(&self) -> &'static str {
        "RATE_LIMIT"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn priority(&self) -> u32 {
        PRIORITY_RATE_LIMIT
    }

    fn options(&self) -> serde_json::Value {
        let mut options = json!(self.algorithm);
        if let Some(map) = options.as_object_mut() {
            map.insert("characteristics".to_string(), json!(self.characteristics));
        }
        options
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn validate(&self, _context: &Context, request: &Request) -> Result<(), RuleError> {
        if !matches!(self.algorithm, RateLimitAlgorithm::TokenBucket { .. }) {
            return Ok(());
        }
        match request.extra().get("requested").map(|v| v.parse::<u32>()) {
            Some(Ok(_)) => Ok(()),
            _ => Err(RuleError::MissingInput {
                rule: "RATE_LIMIT",
                requirement: "`requested` to be a non-negative integer".to_string(),
            }),
        }
    }

    async fn protect(&self, _context: &Context, _request: &Request) -> anyhow::Result<RuleResult> {
        Ok(RuleResult::not_run(Reason::RateLimit(self.algorithm.placeholder_reason())))
    }
}

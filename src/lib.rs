//! Request Guard
//!
//! An embeddable request protection engine. Hosts normalize each inbound
//! request, hand it to a [`RuleEngine`] and act on the returned [`Decision`].
//! Failures inside the engine never block a request: they surface as an
//! ERROR decision, which hosts should treat as allowed.

pub mod config;
pub mod core;
pub mod models;
pub mod utils;

pub use crate::config::load_config;
pub use crate::core::rules::{
    detect_bot, fixed_window, protect_signup, sensitive_info, shield, sliding_window, token_bucket,
    validate_email, Filter,
};
pub use crate::core::{BasicAnalyzer, RuleEngine};
pub use crate::models::{
    Conclusion, Decision, EngineConfig, Mode, Reason, Request, RuleResult, RuleState,
};

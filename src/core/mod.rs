//! Core functionality for the request guard.
//!
//! This module contains the engine and its collaborators: IP resolution,
//! fingerprinting, caching, rules, analysis and the decision service client.

pub mod analysis;
pub mod cache;
pub mod context;
pub mod duration;
pub mod fingerprint;
pub mod forwarded;
pub mod hasher;
pub mod ip;
pub mod logger;
pub mod protocol;
pub mod rule_engine;
pub mod rules;

pub use analysis::{AnalysisEngine, AnalysisError, BasicAnalyzer};
pub use cache::{Cache, CacheError, MemoryCache, RedisCache};
pub use context::{BodyAccessor, BodyError, BufferedBody, Context, OnceBody};
pub use fingerprint::{Characteristic, FingerprintBuilder, FingerprintError};
pub use ip::{IpResolver, TrustedProxies};
pub use logger::{LogLogger, Logger};
pub use protocol::{DecisionClient, HttpTransport, ProtocolError, Transport};
pub use rule_engine::{rule_cache_key, EngineError, RuleEngine};
pub use rules::{IntoRules, Rule, RuleError};

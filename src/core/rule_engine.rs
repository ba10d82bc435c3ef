//! Rule engine.
//!
//! `protect` resolves the client IP, fingerprints the request and runs the
//! registered rules in ascending priority bands. Rules within a band run
//! concurrently; a live DENY ends evaluation after its band. Remote rules are
//! settled by one `decide` call, and every final decision is reported.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use futures::future::join_all;
use futures::FutureExt;
use log::debug;
use serde_json::json;
use thiserror::Error;
use crate::core::analysis::AnalysisEngine;
use crate::core::cache::{Cache, MemoryCache};
use crate::core::context::{BodyAccessor, Context};
use crate::core::fingerprint::{FingerprintBuilder, FingerprintError};
use crate::core::hasher::{self, Field};
use crate::core::ip::{IpResolver, ProxyError, TrustedProxies};
use crate::core::logger::{LogLogger, Logger};
use crate::core::protocol::{DecisionClient, ProtocolError, RuleDescriptor};
use crate::core::rules::{IntoRules, Rule};
use crate::models::{
    Conclusion, Decision, EngineConfig, Mode, Platform, Reason, Request, RuleResult, RuleState,
};

const LOOPBACK: &str = "127.0.0.1";

/// Errors that can occur while building an engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Proxy configuration error: {0}")]
    ProxyError(#[from] ProxyError),
    #[error("Characteristic error: {0}")]
    CharacteristicError(#[from] FingerprintError),
    #[error("Decision client error: {0}")]
    ProtocolError(#[from] ProtocolError),
}

/// Cache key of `rule`, also used as its id
pub fn rule_cache_key(rule: &dyn Rule) -> String {
    let options = rule.options().to_string();
    hasher::hash(&[
        Field::Str("type", rule.rule_type()),
        Field::Uint32("version", u64::from(rule.version())),
        Field::Str("mode", rule.mode().as_str()),
        Field::Str("options", &options),
    ])
}

#[derive(Debug, Clone)]
struct RegisteredRule {
    id: String,
    rule: Arc<dyn Rule>,
}

impl RegisteredRule {
    fn new(rule: Arc<dyn Rule>) -> Self {
        Self {
            id: rule_cache_key(rule.as_ref()),
            rule,
        }
    }

    fn descriptor(&self) -> RuleDescriptor {
        RuleDescriptor {
            id: self.id.clone(),
            rule_type: self.rule.rule_type().to_string(),
            mode: self.rule.mode(),
            priority: self.rule.priority(),
            version: self.rule.version(),
            options: self.rule.options(),
        }
    }

    fn stamp(&self, mut result: RuleResult, fingerprint: &str) -> RuleResult {
        result.rule_id = self.id.clone();
        result.fingerprint = fingerprint.to_string();
        result
    }
}

/// A rule's local result, and whether the decision service still has to settle it
struct Outcome {
    result: RuleResult,
    remote: bool,
}

impl Outcome {
    fn local(result: RuleResult) -> Self {
        Self { result, remote: false }
    }
}

/// Evaluates registered rules against requests
///
/// Engines are immutable; `with_*` methods return a new engine that shares
/// everything it does not replace.
#[derive(Clone)]
pub struct RuleEngine {
    config: Arc<EngineConfig>,
    resolver: Arc<IpResolver>,
    fingerprinter: Arc<FingerprintBuilder>,
    rules: Arc<Vec<RegisteredRule>>,
    cache: Arc<dyn Cache>,
    logger: Arc<dyn Logger>,
    analysis: Option<Arc<dyn AnalysisEngine>>,
    client: Option<Arc<DecisionClient>>,
}

impl RuleEngine {
    /// Create a new engine with no rules
    ///
    /// # Arguments
    ///
    /// * `config` - Engine configuration; proxies and characteristics are
    ///   validated here
    ///
    /// # Returns
    ///
    /// * `Ok(RuleEngine)` with an in-memory cache, the `log` logger, no
    ///   analysis engine and an HTTP decision client if one is configured
    /// * `Err(EngineError)` if the configuration is invalid
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let platform = config.platform.or_else(Platform::detect);
        let proxies = TrustedProxies::parse(&config.proxies)?;
        let fingerprinter = FingerprintBuilder::new(&config.characteristics)?;
        let client = DecisionClient::from_config(&config)?.map(Arc::new);

        Ok(Self {
            config: Arc::new(config),
            resolver: Arc::new(IpResolver::new(platform, proxies)),
            fingerprinter: Arc::new(fingerprinter),
            rules: Arc::new(Vec::new()),
            cache: Arc::new(MemoryCache::new()),
            logger: Arc::new(LogLogger),
            analysis: None,
            client,
        })
    }

    /// A new engine with `rules` appended; this engine is unchanged
    pub fn with_rule(&self, rules: impl IntoRules) -> Self {
        let mut registered = self.rules.as_ref().clone();
        registered.extend(rules.into_rules().into_iter().map(RegisteredRule::new));
        Self {
            rules: Arc::new(registered),
            ..self.clone()
        }
    }

    pub fn with_cache(&self, cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            ..self.clone()
        }
    }

    pub fn with_logger(&self, logger: Arc<dyn Logger>) -> Self {
        Self {
            logger,
            ..self.clone()
        }
    }

    pub fn with_analysis(&self, analysis: Arc<dyn AnalysisEngine>) -> Self {
        Self {
            analysis: Some(analysis),
            ..self.clone()
        }
    }

    pub fn with_client(&self, client: Arc<DecisionClient>) -> Self {
        Self {
            client: Some(client),
            ..self.clone()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ids of the registered rules, in registration order
    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id.as_str()).collect()
    }

    /// Decide what to do with `request`
    pub async fn protect(&self, request: &Request) -> Decision {
        self.evaluate(request, None).await
    }

    /// Like [`RuleEngine::protect`], with access to the request body
    pub async fn protect_with_body(
        &self,
        request: &Request,
        body: Arc<dyn BodyAccessor>,
    ) -> Decision {
        self.evaluate(request, Some(body)).await
    }

    /// Wait for background reports to finish
    pub async fn drain(&self) {
        if let Some(client) = &self.client {
            client.drain().await;
        }
    }

    async fn evaluate(&self, request: &Request, body: Option<Arc<dyn BodyAccessor>>) -> Decision {
        let request = self.resolve_ip(request);
        let mut context = Context {
            key: self.config.key.clone(),
            fingerprint: String::new(),
            characteristics: self.fingerprinter.names(),
            runtime: self.config.runtime.clone(),
            cache: self.cache.clone(),
            logger: self.logger.clone(),
            analysis: self.analysis.clone(),
            body,
        };

        match self.fingerprint(&request).await {
            Ok(fingerprint) => context.fingerprint = fingerprint,
            Err(err) => {
                self.logger.error("Failed to build fingerprint: %s", &[json!(err.to_string())]);
                return self.finish(&context, &request, Decision::error(err.to_string()));
            }
        }

        let mut outcomes = self.run_bands(&context, &request).await;

        let blocked = outcomes.iter().any(|o| {
            o.result.is_enforced()
                && matches!(o.result.conclusion, Conclusion::Deny | Conclusion::Challenge)
        });
        let pending: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.remote)
            .map(|(index, _)| index)
            .collect();
        if !blocked && !pending.is_empty() {
            if let Some(client) = &self.client {
                self.settle_remote(client, &context, &request, &mut outcomes, &pending).await;
            }
        }

        let results = outcomes.into_iter().map(|o| o.result).collect();
        self.finish(&context, &request, conclude(results))
    }

    fn resolve_ip(&self, request: &Request) -> Request {
        let ip = self.resolver.resolve(request);
        if ip.is_empty() {
            if self.config.environment.is_development() {
                return request.with_ip(LOOPBACK);
            }
            self.logger.warn(
                "Client IP address is missing. If this is a dev environment \
                 set the environment to development",
                &[],
            );
        }
        request.with_ip(ip)
    }

    async fn fingerprint(&self, request: &Request) -> Result<String, FingerprintError> {
        if self.config.delegate_fingerprint {
            if let Some(analysis) = &self.analysis {
                return analysis
                    .generate_fingerprint(request, &self.fingerprinter.names())
                    .await
                    .map_err(|e| FingerprintError::Delegated(e.to_string()));
            }
            self.logger.warn(
                "Fingerprint delegation requested without an analysis engine; hashing locally",
                &[],
            );
        }
        self.fingerprinter.build(request)
    }

    async fn run_bands(&self, context: &Context, request: &Request) -> Vec<Outcome> {
        let mut bands: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, registered) in self.rules.iter().enumerate() {
            bands.entry(registered.rule.priority()).or_default().push(index);
        }

        let mut outcomes: Vec<Option<Outcome>> = self.rules.iter().map(|_| None).collect();
        let mut blocked = false;
        for band in bands.values() {
            if blocked {
                for &index in band {
                    let skipped = RuleResult::not_run(Reason::Generic);
                    let skipped = self.rules[index].stamp(skipped, &context.fingerprint);
                    outcomes[index] = Some(Outcome::local(skipped));
                }
                continue;
            }

            let runs = band
                .iter()
                .map(|&index| self.run_rule(context, request, &self.rules[index]));
            let finished = join_all(runs).await;
            for (&index, outcome) in band.iter().zip(finished) {
                blocked |= outcome.result.is_enforced() && outcome.result.is_denied();
                outcomes[index] = Some(outcome);
            }
        }
        outcomes.into_iter().flatten().collect()
    }

    async fn run_rule(
        &self,
        context: &Context,
        request: &Request,
        registered: &RegisteredRule,
    ) -> Outcome {
        let rule = &registered.rule;
        if let Err(err) = rule.validate(context, request) {
            return self.failed(context, registered, err.to_string());
        }

        match context.cache.get(&registered.id, &context.fingerprint).await {
            Ok(Some((cached, ttl))) => {
                let result = cached.with_state(RuleState::Cached).with_ttl(ttl);
                return Outcome::local(registered.stamp(result, &context.fingerprint));
            }
            Ok(None) => {}
            Err(err) => context.logger.debug("Cache lookup failed: %s", &[json!(err.to_string())]),
        }

        let result = match AssertUnwindSafe(rule.protect(context, request)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return self.failed(context, registered, err.to_string()),
            Err(_) => return self.failed(context, registered, "rule panicked".to_string()),
        };

        let remote = rule.is_remote() && result.state == RuleState::NotRun;
        Outcome {
            result: self.settle(context, registered, result).await,
            remote,
        }
    }

    /// Stamp `result`, apply the rule's mode and cache live results with a ttl
    async fn settle(
        &self,
        context: &Context,
        registered: &RegisteredRule,
        result: RuleResult,
    ) -> RuleResult {
        let result = registered.stamp(result, &context.fingerprint);
        if result.state != RuleState::Run {
            return result;
        }

        if registered.rule.mode() == Mode::DryRun {
            if result.is_denied() {
                context.logger.warn(
                    "Dry run mode is enabled for %s rule; the request would have been denied",
                    &[json!(registered.rule.rule_type())],
                );
            }
            return result.with_state(RuleState::DryRun);
        }

        if result.ttl > 0 {
            let write = context
                .cache
                .set(&registered.id, &context.fingerprint, &result, result.ttl)
                .await;
            if let Err(err) = write {
                context.logger.debug("Cache write failed: %s", &[json!(err.to_string())]);
            }
        }
        result
    }

    fn failed(&self, context: &Context, registered: &RegisteredRule, message: String) -> Outcome {
        context.logger.error(
            "Failure running rule: %s due to %s",
            &[json!(registered.id), json!(message)],
        );
        let rule_type = registered.rule.rule_type();
        metrics::counter!("request_guard_rule_failures_total", 1, "rule_type" => rule_type);
        let result = RuleResult::error(message).with_state(RuleState::NotRun);
        Outcome::local(registered.stamp(result, &context.fingerprint))
    }

    async fn settle_remote(
        &self,
        client: &DecisionClient,
        context: &Context,
        request: &Request,
        outcomes: &mut [Outcome],
        pending: &[usize],
    ) {
        let descriptors: Vec<RuleDescriptor> = pending
            .iter()
            .map(|&index| self.rules[index].descriptor())
            .collect();
        let remote = client.decide(context, request, &descriptors).await;

        for &index in pending {
            let registered = &self.rules[index];
            let result = match remote.results.iter().find(|r| r.rule_id == registered.id) {
                Some(result) => result.clone(),
                None if remote.is_errored() => {
                    RuleResult::new(Conclusion::Error, remote.reason.clone())
                }
                None => continue,
            };
            outcomes[index].result = self.settle(context, registered, result).await;
        }
    }

    fn finish(&self, context: &Context, request: &Request, decision: Decision) -> Decision {
        debug!("Decision {} concluded {}", decision.id, decision.conclusion);
        let conclusion = decision.conclusion.as_str();
        metrics::counter!("request_guard_decisions_total", 1, "conclusion" => conclusion);

        if let Some(client) = &self.client {
            let descriptors: Vec<RuleDescriptor> =
                self.rules.iter().map(RegisteredRule::descriptor).collect();
            client.report(context, request, &decision, &descriptors);
        }
        decision
    }
}

/// Merge rule results: DENY beats CHALLENGE beats ALLOW
///
/// Only RUN and CACHED results count; ERROR results count as ALLOW.
fn conclude(results: Vec<RuleResult>) -> Decision {
    let enforced = || results.iter().filter(|r| r.is_enforced());
    let decisive = enforced()
        .find(|r| r.conclusion == Conclusion::Deny)
        .or_else(|| enforced().find(|r| r.conclusion == Conclusion::Challenge))
        .map(|r| (r.conclusion, r.reason.clone(), r.ttl));

    let (conclusion, reason, ttl) = decisive.unwrap_or((Conclusion::Allow, Reason::Generic, 0));
    Decision::new(conclusion, reason, results, ttl)
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use crate::utils::local_decision_id;

/// Deployment environment of the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Hosting platform, used to decide which proxy headers can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Cloudflare,
    FlyIo,
    Vercel,
    Render,
}

impl Platform {
    /// Detect the platform from well-known environment variables
    pub fn detect() -> Option<Self> {
        Self::detect_with(|name| std::env::var_os(name).is_some())
    }

    pub(crate) fn detect_with(is_set: impl Fn(&str) -> bool) -> Option<Self> {
        if is_set("FLY_APP_NAME") {
            Some(Platform::FlyIo)
        } else if is_set("VERCEL") {
            Some(Platform::Vercel)
        } else if is_set("RENDER") {
            Some(Platform::Render)
        } else {
            None
        }
    }
}

/// Decision service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Base URL of the decision service; remote rules stay unevaluated without it
    pub base_url: Option<String>,
    /// Timeout for `decide` in milliseconds; defaults depend on the environment
    pub decide_timeout_ms: Option<u64>,
    /// Timeout for background `report` calls in milliseconds
    pub report_timeout_ms: u64,
    /// Stack label sent with every request
    pub sdk_stack: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            decide_timeout_ms: None,
            report_timeout_ms: 2000,
            sdk_stack: "RUST".to_string(),
        }
    }
}

impl ProtocolConfig {
    pub fn decide_timeout(&self, environment: Environment) -> std::time::Duration {
        let default = if environment.is_development() { 1000 } else { 500 };
        let millis = self.decide_timeout_ms.unwrap_or(default);
        std::time::Duration::from_millis(millis)
    }

    pub fn report_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.report_timeout_ms)
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// API key sent to the decision service
    pub key: String,
    /// Deployment environment
    pub environment: Environment,
    /// Hosting platform; detected from the environment when unset
    pub platform: Option<Platform>,
    /// Trusted proxy addresses or CIDR ranges
    pub proxies: Vec<String>,
    /// Characteristics used to fingerprint requests
    pub characteristics: Vec<String>,
    /// Runtime label passed to rules
    pub runtime: String,
    /// Ask the analysis engine for the fingerprint instead of hashing locally
    pub delegate_fingerprint: bool,
    /// Decision service configuration
    pub protocol: ProtocolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            environment: Environment::Production,
            platform: None,
            proxies: Vec::new(),
            characteristics: vec!["ip.src".to_string()],
            runtime: "rust".to_string(),
            delegate_fingerprint: false,
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Ordered, case-insensitive header multimap
///
/// The `cookie` header is never stored here; it lives in [`Request::cookies`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header value. Returns `false` for the excluded `cookie` header.
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> bool {
        let name = name.trim().to_ascii_lowercase();
        if name == "cookie" {
            return false;
        }
        self.entries.push((name, value.into()));
        true
    }

    /// All values for `name`, joined with `", "` as an HTTP list
    pub fn get(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_all(name).next().is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten into a sorted map, joining repeated headers
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.entries {
            map.entry(name.clone())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        map
    }
}

/// Normalized inbound request, immutable once built
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    ip: String,
    remote_address: Option<String>,
    method: String,
    protocol: String,
    host: String,
    path: String,
    headers: Headers,
    cookies: String,
    query: String,
    extra: BTreeMap<String, String>,
    email: Option<String>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Socket-level peer address supplied by the adapter
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Raw `cookie` header
    pub fn cookies(&self) -> &str {
        &self.cookies
    }

    /// Raw query string, without the leading `?`
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Value of the first cookie named `name`
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
    }

    /// Decoded value of the first query argument named `name`
    pub fn query_arg(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Copy of this request with the resolved client IP
    pub fn with_ip(&self, ip: impl Into<String>) -> Request {
        Request {
            ip: ip.into(),
            ..self.clone()
        }
    }
}

/// Builder for [`Request`], used by host adapters
#[derive(Debug, Default)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.request.ip = ip.into();
        self
    }

    pub fn remote_address(mut self, address: impl Into<String>) -> Self {
        self.request.remote_address = Some(address.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.request.method = method.into();
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.request.protocol = protocol.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.request.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.request.path = path.into();
        self
    }

    /// Add a header; a `cookie` header is routed to the cookie string
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !self.request.headers.append(name, value.clone()) {
            if !self.request.cookies.is_empty() {
                self.request.cookies.push_str("; ");
            }
            self.request.cookies.push_str(&value);
        }
        self
    }

    pub fn cookies(mut self, cookies: impl Into<String>) -> Self {
        self.request.cookies = cookies.into();
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        let query: String = query.into();
        self.request.query = query.strip_prefix('?').map(str::to_string).unwrap_or(query);
        self
    }

    /// Add a user-supplied characteristic value, coerced to a string
    pub fn extra(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.request.extra.insert(key.into(), value.to_string());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.request.email = Some(email.into());
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

/// Categorical outcome of a rule or decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Allow,
    Deny,
    Challenge,
    Error,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Allow => "ALLOW",
            Conclusion::Deny => "DENY",
            Conclusion::Challenge => "CHALLENGE",
            Conclusion::Error => "ERROR",
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    Run,
    Cached,
    DryRun,
    NotRun,
}

/// Rule enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Live,
    DryRun,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "LIVE",
            Mode::DryRun => "DRY_RUN",
        }
    }
}

/// Email classifications reported by email validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailType {
    Disposable,
    Free,
    NoMxRecords,
    NoGravatar,
    Invalid,
}

/// Kind of sensitive information found in a piece of text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Email,
    PhoneNumber,
    IpAddress,
    CreditCardNumber,
    Custom(String),
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "EMAIL" => EntityType::Email,
            "PHONE_NUMBER" => EntityType::PhoneNumber,
            "IP_ADDRESS" => EntityType::IpAddress,
            "CREDIT_CARD_NUMBER" => EntityType::CreditCardNumber,
            _ => EntityType::Custom(value),
        }
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        match value {
            EntityType::Email => "EMAIL".to_string(),
            EntityType::PhoneNumber => "PHONE_NUMBER".to_string(),
            EntityType::IpAddress => "IP_ADDRESS".to_string(),
            EntityType::CreditCardNumber => "CREDIT_CARD_NUMBER".to_string(),
            EntityType::Custom(name) => name,
        }
    }
}

/// A detected entity, as character offsets into the scanned text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveEntity {
    pub start: usize,
    pub end: usize,
    pub identified_type: EntityType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotReason {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    pub verified: bool,
    pub spoofed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitReason {
    pub max: u32,
    pub remaining: u32,
    pub reset_in_seconds: u32,
    pub window_in_seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailReason {
    pub email_types: Vec<EmailType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveInfoReason {
    pub allowed: Vec<SensitiveEntity>,
    pub denied: Vec<SensitiveEntity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldReason {
    pub shield_triggered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReason {
    pub message: String,
}

/// Why a rule or decision concluded what it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Bot(BotReason),
    RateLimit(RateLimitReason),
    Email(EmailReason),
    SensitiveInfo(SensitiveInfoReason),
    Shield(ShieldReason),
    Error(ErrorReason),
    #[default]
    Generic,
}

impl Reason {
    pub fn error(message: impl Into<String>) -> Self {
        Reason::Error(ErrorReason { message: message.into() })
    }
}

/// Outcome of a single rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub rule_id: String,
    pub fingerprint: String,
    pub ttl: u32,
    pub state: RuleState,
    pub conclusion: Conclusion,
    pub reason: Reason,
}

impl RuleResult {
    /// A freshly run result; the engine fills in rule id and fingerprint
    pub fn new(conclusion: Conclusion, reason: Reason) -> Self {
        Self {
            rule_id: String::new(),
            fingerprint: String::new(),
            ttl: 0,
            state: RuleState::Run,
            conclusion,
            reason,
        }
    }

    pub fn allow(reason: Reason) -> Self {
        Self::new(Conclusion::Allow, reason)
    }

    pub fn deny(reason: Reason) -> Self {
        Self::new(Conclusion::Deny, reason)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Conclusion::Error, Reason::error(message))
    }

    /// A placeholder for a rule that did not run locally
    pub fn not_run(reason: Reason) -> Self {
        Self::new(Conclusion::Allow, reason).with_state(RuleState::NotRun)
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_state(mut self, state: RuleState) -> Self {
        self.state = state;
        self
    }

    /// Whether this result takes part in the merged conclusion
    pub fn is_enforced(&self) -> bool {
        matches!(self.state, RuleState::Run | RuleState::Cached)
    }

    pub fn is_denied(&self) -> bool {
        self.conclusion == Conclusion::Deny
    }
}

/// The merged outcome of every rule for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub conclusion: Conclusion,
    pub reason: Reason,
    pub results: Vec<RuleResult>,
    pub ttl: u32,
}

impl Decision {
    pub fn new(conclusion: Conclusion, reason: Reason, results: Vec<RuleResult>, ttl: u32) -> Self {
        Self {
            id: local_decision_id(),
            conclusion,
            reason,
            results,
            ttl,
        }
    }

    /// An ERROR decision carrying `message`
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Conclusion::Error, Reason::error(message), Vec::new(), 0)
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self.conclusion, Conclusion::Allow | Conclusion::Error)
    }

    pub fn is_denied(&self) -> bool {
        self.conclusion == Conclusion::Deny
    }

    pub fn is_challenged(&self) -> bool {
        self.conclusion == Conclusion::Challenge
    }

    pub fn is_errored(&self) -> bool {
        self.conclusion == Conclusion::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_are_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        assert!(headers.append("X-Forwarded-For", "1.1.1.1"));
        assert!(headers.append("x-forwarded-for", "2.2.2.2"));
        assert!(headers.append("User-Agent", "curl/8.1.2"));
        assert!(!headers.append("Cookie", "a=b"));

        assert_eq!(headers.get("X-FORWARDED-FOR").as_deref(), Some("1.1.1.1, 2.2.2.2"));
        assert_eq!(headers.len(), 3);
        assert!(!headers.contains("cookie"));
        assert_eq!(headers.to_map().get("user-agent").map(String::as_str), Some("curl/8.1.2"));
    }

    #[test]
    fn test_request_builder_routes_cookie_header() {
        let request = Request::builder()
            .header("Cookie", "session=abc; theme=dark")
            .header("Accept", "*/*")
            .query("?q=hello%20world&page=2")
            .extra("requested", 5)
            .build();

        assert_eq!(request.cookie("session").as_deref(), Some("abc"));
        assert_eq!(request.cookie("theme").as_deref(), Some("dark"));
        assert_eq!(request.cookie("missing"), None);
        assert!(request.headers().get("cookie").is_none());
        assert_eq!(request.query_arg("q").as_deref(), Some("hello world"));
        assert_eq!(request.extra().get("requested").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_with_ip_keeps_other_fields() {
        let request = Request::builder().method("GET").path("/").build();
        let resolved = request.with_ip("8.8.8.8");
        assert_eq!(resolved.ip(), "8.8.8.8");
        assert_eq!(resolved.method(), "GET");
        assert_eq!(request.ip(), "");
    }

    #[test]
    fn test_reason_wire_format() {
        let reason = Reason::Bot(BotReason {
            allowed: vec![],
            denied: vec!["CURL".to_string()],
            verified: false,
            spoofed: false,
        });
        assert_eq!(
            serde_json::to_value(&reason).unwrap(),
            json!({
                "type": "BOT",
                "allowed": [],
                "denied": ["CURL"],
                "verified": false,
                "spoofed": false
            })
        );

        let raw = json!({"start": 0, "end": 4, "identifiedType": "MY_TOKEN"});
        let entity: SensitiveEntity = serde_json::from_value(raw).unwrap();
        assert_eq!(entity.identified_type, EntityType::Custom("MY_TOKEN".to_string()));
    }

    #[test]
    fn test_decision_round_trips_through_json() {
        let decision = Decision::new(
            Conclusion::Deny,
            Reason::Shield(ShieldReason { shield_triggered: true }),
            vec![RuleResult::deny(Reason::Generic).with_ttl(10)],
            10,
        );
        let text = serde_json::to_string(&decision).unwrap();
        assert!(text.contains("\"conclusion\":\"DENY\""));
        let back: Decision = serde_json::from_str(&text).unwrap();
        assert_eq!(back, decision);
    }

    #[test]
    fn test_platform_detection() {
        assert_eq!(Platform::detect_with(|name| name == "FLY_APP_NAME"), Some(Platform::FlyIo));
        assert_eq!(Platform::detect_with(|name| name == "VERCEL"), Some(Platform::Vercel));
        assert_eq!(Platform::detect_with(|name| name == "RENDER"), Some(Platform::Render));
        assert_eq!(Platform::detect_with(|_| false), None);
    }

    #[test]
    fn test_decide_timeout_defaults() {
        let protocol = ProtocolConfig::default();
        assert_eq!(protocol.decide_timeout(Environment::Production).as_millis(), 500);
        assert_eq!(protocol.decide_timeout(Environment::Development).as_millis(), 1000);
        assert_eq!(protocol.report_timeout().as_millis(), 2000);
    }
}

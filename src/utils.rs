use uuid::Uuid;

/// Key under which a rule result is stored for one fingerprint
pub fn format_cache_key(prefix: &str, key: &str, fingerprint: &str) -> String {
    format!("{}:{}:{}", prefix, key, fingerprint)
}

/// Identifier for a decision made without the decision service
pub fn local_decision_id() -> String {
    format!("lreq_{}", Uuid::new_v4().simple())
}

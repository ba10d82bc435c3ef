//! Request fingerprinting.
//!
//! A fingerprint identifies "the same caller" for caching and rate limiting.
//! Only the configured characteristics contribute; every other request
//! field is ignored. Characteristics are hashed in sorted order, so the
//! order they were configured in does not matter.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use crate::core::hasher::{self, Field};
use crate::models::Request;

/// Version tag embedded in every locally built fingerprint
pub const FINGERPRINT_VERSION: u32 = 2;

/// Errors that can occur while fingerprinting a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("invalid characteristic: {0:?}")]
    InvalidCharacteristic(String),
    #[error("unable to generate fingerprint: requested characteristic `{0}` has no value")]
    MissingCharacteristic(String),
    #[error("unable to generate fingerprint: {0}")]
    Delegated(String),
}

/// A request dimension that can be fingerprinted
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Characteristic {
    IpSrc,
    Host,
    Method,
    Path,
    QueryArg(String),
    Cookie(String),
    Header(String),
    /// A user-defined key looked up in the request's extra values
    Custom(String),
}

fn bracketed<'a>(name: &'a str, prefix: &str) -> Option<Result<&'a str, FingerprintError>> {
    let rest = name.strip_prefix(prefix)?;
    let inner = rest
        .strip_prefix("[\"")
        .and_then(|r| r.strip_suffix("\"]"))
        .filter(|inner| !inner.is_empty() && !inner.contains('"'));
    Some(inner.ok_or_else(|| FingerprintError::InvalidCharacteristic(name.to_string())))
}

impl FromStr for Characteristic {
    type Err = FingerprintError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "" => return Err(FingerprintError::InvalidCharacteristic(name.to_string())),
            "ip.src" => return Ok(Characteristic::IpSrc),
            "http.host" => return Ok(Characteristic::Host),
            "http.method" => return Ok(Characteristic::Method),
            "http.request.uri.path" => return Ok(Characteristic::Path),
            _ => {}
        }

        if let Some(arg) = bracketed(name, "http.request.uri.args") {
            return arg.map(|a| Characteristic::QueryArg(a.to_string()));
        }
        if let Some(cookie) = bracketed(name, "http.request.cookie") {
            return cookie.map(|c| Characteristic::Cookie(c.to_string()));
        }
        if let Some(header) = bracketed(name, "http.request.headers") {
            return header.map(|h| Characteristic::Header(h.to_ascii_lowercase()));
        }
        Ok(Characteristic::Custom(name.to_string()))
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Characteristic::IpSrc => f.write_str("ip.src"),
            Characteristic::Host => f.write_str("http.host"),
            Characteristic::Method => f.write_str("http.method"),
            Characteristic::Path => f.write_str("http.request.uri.path"),
            Characteristic::QueryArg(name) => write!(f, "http.request.uri.args[\"{}\"]", name),
            Characteristic::Cookie(name) => write!(f, "http.request.cookie[\"{}\"]", name),
            Characteristic::Header(name) => write!(f, "http.request.headers[\"{}\"]", name),
            Characteristic::Custom(name) => f.write_str(name),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Characteristic {
    /// Resolve this characteristic's value on `request`
    pub fn resolve(&self, request: &Request) -> Option<String> {
        match self {
            Characteristic::IpSrc => non_empty(request.ip()),
            Characteristic::Host => non_empty(request.host()),
            Characteristic::Method => non_empty(request.method()),
            Characteristic::Path => non_empty(request.path()),
            Characteristic::QueryArg(name) => request.query_arg(name),
            Characteristic::Cookie(name) => request.cookie(name),
            Characteristic::Header(name) => request.headers().get(name),
            Characteristic::Custom(name) => request.extra().get(name).cloned(),
        }
    }
}

/// Parse a list of characteristic names
pub fn parse_characteristics(names: &[String]) -> Result<Vec<Characteristic>, FingerprintError> {
    names.iter().map(|name| name.parse()).collect()
}

/// Builds fingerprints for a fixed set of characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintBuilder {
    characteristics: Vec<Characteristic>,
}

impl FingerprintBuilder {
    /// Create a builder; an empty list falls back to `ip.src`
    pub fn new(names: &[String]) -> Result<Self, FingerprintError> {
        let mut characteristics = parse_characteristics(names)?;
        if characteristics.is_empty() {
            characteristics.push(Characteristic::IpSrc);
        }
        characteristics.sort_by_key(|c| c.to_string());
        characteristics.dedup();
        Ok(Self { characteristics })
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// Characteristic names in hashing order
    pub fn names(&self) -> Vec<String> {
        self.characteristics.iter().map(|c| c.to_string()).collect()
    }

    /// Fingerprint `request` as `fp::<version>::<hex sha256>`
    ///
    /// # Returns
    ///
    /// * `Ok(fingerprint)` when every characteristic resolved
    /// * `Err(FingerprintError::MissingCharacteristic)` naming the first one that did not
    pub fn build(&self, request: &Request) -> Result<String, FingerprintError> {
        let mut resolved = Vec::with_capacity(self.characteristics.len());
        for characteristic in &self.characteristics {
            let name = characteristic.to_string();
            let value = characteristic
                .resolve(request)
                .ok_or_else(|| FingerprintError::MissingCharacteristic(name.clone()))?;
            resolved.push((name, value));
        }

        let fields: Vec<Field<'_>> = resolved
            .iter()
            .map(|(name, value)| Field::Str(name, value))
            .collect();
        Ok(format!("fp::{}::{}", FINGERPRINT_VERSION, hasher::hash(&fields)))
    }
}

/// Fingerprint `request` using `characteristics`
pub fn build(request: &Request, characteristics: &[String]) -> Result<String, FingerprintError> {
    FingerprintBuilder::new(characteristics)?.build(request)
}

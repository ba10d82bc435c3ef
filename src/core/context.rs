//! Per-call context handed to rules.

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use crate::core::analysis::AnalysisEngine;
use crate::core::cache::Cache;
use crate::core::logger::Logger;

/// Errors that can occur while reading a request body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("body is unusable: it was already consumed")]
    Unusable,
    #[error("no body is available for this request")]
    Missing,
    #[error("failed to read body: {0}")]
    Read(String),
}

/// Access to the request body, supplied by the host adapter
#[async_trait]
pub trait BodyAccessor: Send + Sync {
    async fn get_body(&self) -> Result<String, BodyError>;
}

/// A body that was fully buffered by the adapter
#[derive(Debug, Clone)]
pub struct BufferedBody(String);

impl BufferedBody {
    pub fn new(body: impl Into<String>) -> Self {
        Self(body.into())
    }
}

#[async_trait]
impl BodyAccessor for BufferedBody {
    async fn get_body(&self) -> Result<String, BodyError> {
        Ok(self.0.clone())
    }
}

/// A body backed by a stream that can only be read once
#[derive(Debug)]
pub struct OnceBody(Mutex<Option<String>>);

impl OnceBody {
    pub fn new(body: impl Into<String>) -> Self {
        Self(Mutex::new(Some(body.into())))
    }
}

#[async_trait]
impl BodyAccessor for OnceBody {
    async fn get_body(&self) -> Result<String, BodyError> {
        self.0.lock().take().ok_or(BodyError::Unusable)
    }
}

/// Collaborators for one `protect` call
#[derive(Clone)]
pub struct Context {
    /// API key for the decision service
    pub key: String,
    /// Fingerprint of the request; empty when fingerprinting failed
    pub fingerprint: String,
    /// Configured characteristic names, in hashing order
    pub characteristics: Vec<String>,
    /// Runtime label of the host
    pub runtime: String,
    pub cache: Arc<dyn Cache>,
    pub logger: Arc<dyn Logger>,
    pub analysis: Option<Arc<dyn AnalysisEngine>>,
    pub(crate) body: Option<Arc<dyn BodyAccessor>>,
}

impl Context {
    /// Read the request body through the adapter's accessor
    pub async fn body(&self) -> Result<String, BodyError> {
        match &self.body {
            Some(body) => body.get_body().await,
            None => Err(BodyError::Missing),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("fingerprint", &self.fingerprint)
            .field("characteristics", &self.characteristics)
            .field("runtime", &self.runtime)
            .field("analysis", &self.analysis.is_some())
            .field("body", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

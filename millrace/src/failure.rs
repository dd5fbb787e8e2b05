//! Failure classification and reporting for per-item execution.
//!
//! Two failure shapes matter to the harness: a stale lease token, which is
//! dropped silently because the service has already moved the key elsewhere,
//! and everything else, which is reported to the service so it can veto
//! local retries of poison items.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// The lease token for a key is no longer authoritative.
///
/// Raised by state fetches (and anything else that talks to the service
/// under a work token) when the service has reassigned the key. May appear
/// anywhere in an error's cause chain.
#[derive(Debug, Error)]
#[error("work token no longer valid for key {key}")]
pub struct KeyTokenInvalid {
    /// Lossy text form of the key, for diagnostics.
    pub key: String,
}

impl KeyTokenInvalid {
    /// Create the error for the given key bytes.
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }
}

/// Wrapper distinguishing failures thrown by user pipeline code from
/// harness failures. Classification unwraps exactly one layer of this
/// before inspecting the cause.
#[derive(Debug)]
pub struct UserCodeError {
    source: anyhow::Error,
}

impl UserCodeError {
    /// Wrap a user-pipeline failure.
    pub fn new(source: anyhow::Error) -> Self {
        Self { source }
    }

    /// The wrapped failure.
    pub fn into_cause(self) -> anyhow::Error {
        self.source
    }
}

impl std::fmt::Display for UserCodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user pipeline code failed")
    }
}

impl std::error::Error for UserCodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Strip one layer of [`UserCodeError`], if the outermost error is one.
pub fn unwrap_user_code(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<UserCodeError>() {
        Ok(wrapper) => wrapper.into_cause(),
        Err(err) => err,
    }
}

/// Whether a [`KeyTokenInvalid`] appears anywhere in the cause chain.
pub fn is_key_token_invalid(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<KeyTokenInvalid>().is_some())
}

/// Structured failure report sent to the service.
///
/// Frames start with the error's rendered form; each cause becomes a
/// nested report, mirroring the source chain.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExceptionReport {
    /// Rendered frames, outermost description first.
    pub stack_frames: Vec<String>,
    /// Report for the next error in the cause chain, if any.
    pub cause: Option<Box<ExceptionReport>>,
}

impl ExceptionReport {
    /// Build a report from an error and its cause chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::from_dyn(err.as_ref())
    }

    fn from_dyn(err: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            stack_frames: vec![err.to_string()],
            cause: err.source().map(|cause| Box::new(Self::from_dyn(cause))),
        }
    }

    /// Depth of the cause chain, counting this report.
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |cause| cause.depth())
    }
}

/// Most recent unclassified failure, surfaced on the status page.
///
/// Last write wins; stale entries are expected and harmless.
#[derive(Clone, Debug, Default)]
pub struct LastExceptionCell {
    inner: Arc<Mutex<Option<String>>>,
}

impl LastExceptionCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, replacing any previous one.
    pub fn record(&self, err: &anyhow::Error) {
        *self.inner.lock() = Some(format!("{err:#}"));
    }

    /// Rendered form of the most recent error, if any.
    pub fn get(&self) -> Option<String> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_token_invalid_found_at_top() {
        let err = anyhow::Error::new(KeyTokenInvalid::new(b"k1"));
        assert!(is_key_token_invalid(&err));
    }

    #[test]
    fn test_key_token_invalid_found_in_chain() {
        let err = anyhow::Error::new(KeyTokenInvalid::new(b"k1"))
            .context("state fetch failed")
            .context("pipeline stage read");
        assert!(is_key_token_invalid(&err));
    }

    #[test]
    fn test_plain_error_not_key_token_invalid() {
        let err = anyhow::anyhow!("boom");
        assert!(!is_key_token_invalid(&err));
    }

    #[test]
    fn test_unwrap_user_code_strips_one_layer() {
        let inner = anyhow::anyhow!("stage exploded");
        let wrapped = anyhow::Error::new(UserCodeError::new(inner));
        let unwrapped = unwrap_user_code(wrapped);
        assert_eq!(unwrapped.to_string(), "stage exploded");
    }

    #[test]
    fn test_unwrap_user_code_passthrough() {
        let err = anyhow::anyhow!("harness failure");
        let unwrapped = unwrap_user_code(err);
        assert_eq!(unwrapped.to_string(), "harness failure");
    }

    #[test]
    fn test_key_token_invalid_inside_user_code_wrapper() {
        let inner = anyhow::Error::new(KeyTokenInvalid::new(b"k"))
            .context("reading window state");
        let wrapped = anyhow::Error::new(UserCodeError::new(inner));
        let unwrapped = unwrap_user_code(wrapped);
        assert!(is_key_token_invalid(&unwrapped));
    }

    #[test]
    fn test_exception_report_mirrors_cause_chain() {
        let err = anyhow::anyhow!("root cause")
            .context("middle")
            .context("outermost");
        let report = ExceptionReport::from_error(&err);
        assert_eq!(report.depth(), 3);
        assert_eq!(report.stack_frames, vec!["outermost".to_string()]);
        let middle = report.cause.as_ref().unwrap();
        assert_eq!(middle.stack_frames, vec!["middle".to_string()]);
        let root = middle.cause.as_ref().unwrap();
        assert_eq!(root.stack_frames, vec!["root cause".to_string()]);
        assert!(root.cause.is_none());
    }

    #[test]
    fn test_last_exception_cell_last_write_wins() {
        let cell = LastExceptionCell::new();
        assert!(cell.get().is_none());
        cell.record(&anyhow::anyhow!("first"));
        cell.record(&anyhow::anyhow!("second"));
        assert_eq!(cell.get().unwrap(), "second");
    }
}

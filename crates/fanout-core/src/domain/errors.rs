//! Errors - エラー型と分類
//!
//! - `EngineError`: 設定ミスなど、`work()` 自体が失敗するエラー
//! - `LoaderError`: DataLoader / ProgressLoader 実装のエラー
//! - `HandlerError`: `handle` が返すエラー（リトライはしない）

use thiserror::Error;

/// ErrorKind は handler エラーの分類
///
/// engine はリトライしないので、分類はログと呼び出し側の判断材料にのみ使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Error returned by `TaskHandler::handle`.
#[derive(Debug, Error)]
#[error("handler error (kind: {kind:?}): {message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            ..Self::new(message)
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised by loader implementations.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("loader io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loader json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("loader format error: {0}")]
    Format(String),
}

/// Errors that stop `work()` or engine construction.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task handler must be set before work()")]
    MissingHandler,

    #[error("data loader must be set before work()")]
    MissingLoader,

    #[error("data loader has no items")]
    EmptyLoader,

    #[error("worker count must be positive")]
    InvalidWorkerCount,

    #[error("report interval must be a positive number of seconds, got {0}")]
    InvalidInterval(f64),

    #[error("invalid report template: {0}")]
    InvalidTemplate(String),

    #[error("failed to install signal handler: {0}")]
    SignalInstall(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Configuration errors are reported before any dispatch begins.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, EngineError::SignalInstall(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn handler_error_defaults_to_transient() {
        let err = HandlerError::new("timeout");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.message(), "timeout");
        assert!(err.to_string().contains("Transient"));
    }

    #[test]
    fn handler_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = HandlerError::permanent("fetch failed").with_source(io);
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.source().is_some());
    }

    #[test]
    fn signal_install_is_not_a_configuration_error() {
        assert!(EngineError::EmptyLoader.is_configuration());
        let io = std::io::Error::other("no signals");
        assert!(!EngineError::SignalInstall(io).is_configuration());
    }
}

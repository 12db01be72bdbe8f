use std::collections::BTreeMap;

use thiserror::Error;

pub mod artifact;
pub mod config_file;
pub mod html;
pub mod invoker;
pub mod mojibake;
pub mod options;
pub mod pipeline;
pub mod postprocess;
pub mod tools;

// Re-export for convenience
pub use artifact::{ArtifactHandle, ArtifactScope, ArtifactState, CleanupReport};
pub use options::{ConversionOptions, OptionKind, OptionSpec, OptionValue};
pub use config_file::Settings;
pub use html::TidyOptions;
pub use pipeline::{Converter, ConverterConfig, Route, ToolStatus};
pub use tools::{BinaryPaths, ToolSpec};

/// Errors raised while converting a single request.
///
/// The split between client and environment faults is decided where the
/// error is created (the invoker classifies tool diagnostics); callers only
/// ask [`ConversionError::is_client_error`].
#[derive(Error, Debug)]
pub enum ConversionError {
    /// The payload was rejected by the conversion tool as malformed.
    #[error("malformed input: {0}")]
    ClientInput(String),
    /// An allow-listed option could not be coerced to its declared kind.
    #[error("invalid value for option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },
    /// Missing binary, permission failure, crash, timeout.
    #[error("{tool} failed: {message}")]
    Environment { tool: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConversionError {
    pub fn environment(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ConversionError::Environment {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// True when the failure is the caller's fault (4xx), false for 5xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ConversionError::ClientInput(_) | ConversionError::InvalidOption { .. }
        )
    }
}

/// The inbound payload of one conversion plus its raw query parameters.
///
/// Option sets are derived from `params` by each pipeline through its own
/// allow-lists, so parameters meant for another stage are never forwarded
/// to a tool.
#[derive(Debug, Clone, Default)]
pub struct ConversionRequest {
    pub payload: Vec<u8>,
    pub params: BTreeMap<String, String>,
}

impl ConversionRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Converted document ready to be sent: body plus the content type to set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub body: String,
    pub content_type: String,
}

impl ConversionResult {
    pub fn html(body: String) -> Self {
        Self {
            body,
            content_type: "text/html; charset=utf-8".to_string(),
        }
    }

    pub fn text(body: String) -> Self {
        Self {
            body,
            content_type: "text/plain; charset=utf-8".to_string(),
        }
    }
}

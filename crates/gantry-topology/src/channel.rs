//! Command channel boundary.
//!
//! The engine drives the live hypervisor process through an abstract
//! "issue command, get output" collaborator. The wire protocol behind it is
//! out of scope; the engine treats [`Output`] as opaque except where a
//! device-specific verification predicate inspects it.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Opaque output of one channel command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    raw: String,
    data: Option<Value>,
}

impl Output {
    /// Output with raw text only.
    #[must_use]
    pub fn text(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            data: None,
        }
    }

    /// Output carrying a structured value.
    #[must_use]
    pub fn structured(data: Value) -> Self {
        Self {
            raw: String::new(),
            data: Some(data),
        }
    }

    /// Empty output (the usual success shape for mutating commands).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The raw text.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The structured value, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// True when the output carries an error marker: a structured `error`
    /// member, or raw text starting with `error`.
    #[must_use]
    pub fn is_error(&self) -> bool {
        if let Some(Value::Object(map)) = &self.data {
            if map.contains_key("error") {
                return true;
            }
        }
        self.raw.trim_start().to_ascii_lowercase().starts_with("error")
    }

    /// True when the raw text contains the token on its own line or as a
    /// whitespace-separated word. Listing commands return one entry per
    /// line; verification predicates use this to test membership.
    #[must_use]
    pub fn mentions(&self, token: &str) -> bool {
        if let Some(Value::Array(items)) = &self.data {
            if items.iter().any(|v| v.as_str() == Some(token)) {
                return true;
            }
        }
        self.raw.split_whitespace().any(|w| w == token)
    }
}

/// Channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The command did not complete within the caller's timeout. The effect
    /// of the command on the live process is unknown.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// Transport failure before the command could execute.
    #[error("channel transport error: {0}")]
    Transport(String),

    /// The live side rejected the command outright.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Synchronous command channel to the live process.
///
/// Every call runs to completion or fails within the supplied timeout; the
/// engine never retries silently on the caller's behalf.
pub trait CommandChannel {
    /// Executes one command with optional structured arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Timeout`] when the deadline elapses with the
    /// command effect unknown, and the other variants for definite
    /// failures.
    fn execute(
        &mut self,
        command: &str,
        args: Option<&Value>,
        timeout: Duration,
    ) -> Result<Output, ChannelError>;
}

//! Categorized errors for tunnel exchanges.
//!
//! Every failed exchange is described by a [`TunnelError`]; its category
//! decides the HTTP status the relay answers with.

use std::error::Error as StdError;
use std::fmt;

type BoxError = Box<dyn StdError + Send + Sync>;

/// What kind of failure an exchange hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed inbound request (no token segment, unreadable body).
    Protocol,
    /// No live connection for the token, or the connection went away.
    Connection,
    /// The agent reported that the local call failed.
    Upstream,
    /// The connection's outbound queue is full (fail-fast policy).
    Busy,
    /// No response before the exchange deadline.
    Timeout,
    Configuration,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Connection => "connection",
            Self::Upstream => "upstream",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Status the relay answers with.
    pub fn status(self) -> u16 {
        match self {
            Self::Protocol => 400,
            Self::Connection | Self::Upstream => 502,
            Self::Busy => 503,
            Self::Timeout => 504,
            Self::Configuration | Self::Internal => 500,
        }
    }

    /// Transient failures; a later attempt may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Busy)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized failure. `message` is what HTTP callers see.
#[derive(Debug)]
pub struct TunnelError {
    pub category: ErrorCategory,
    pub message: String,
    fields: Vec<(&'static str, String)>,
    source: Option<BoxError>,
}

impl TunnelError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            fields: Vec::new(),
            source: None,
        }
    }

    pub fn with_cause<E: StdError + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.source = Some(Box::new(cause));
        self
    }

    /// Attach a `key=value` pair shown in logs, never in HTTP bodies.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_transient()
    }

    pub fn http_status(&self) -> u16 {
        self.category.status()
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        match &self.source {
            Some(cause) => write!(f, ": {}", cause),
            None => Ok(()),
        }
    }
}

impl StdError for TunnelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

macro_rules! constructors {
    ($($name:ident => $category:ident),* $(,)?) => {
        impl TunnelError {
            $(
                pub fn $name(message: impl Into<String>) -> Self {
                    Self::new(ErrorCategory::$category, message)
                }
            )*
        }
    };
}

constructors! {
    protocol => Protocol,
    connection => Connection,
    upstream => Upstream,
    busy => Busy,
    timeout => Timeout,
    config => Configuration,
    internal => Internal,
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;

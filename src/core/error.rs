//! Custom error types for browsectl
//!
//! One error enum for the whole crate, grouped by where a failure is
//! resolved: transport, validation, addressing, engine and lifecycle.

use thiserror::Error;

use crate::protocol::command::ValidationError;

/// The five failure classes of the control protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad framing or a dropped connection
    Transport,
    /// A frame that decoded but is not a valid command
    Validation,
    /// Tab index, ref or frame that does not exist
    Addressing,
    /// Failure reported by the automation engine
    Engine,
    /// Daemon and bridge lifecycle failures
    Lifecycle,
    /// Configuration, IO and anything else
    Ambient,
}

/// Main error type for browsectl operations
#[derive(Error, Debug)]
pub enum BrowseError {
    /// Declared frame length over the ceiling
    #[error("Frame too large: {declared} bytes (max {max})")]
    FrameTooLarge { declared: usize, max: usize },

    /// Correctly framed payload that is not valid JSON
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Peer hung up, possibly mid-frame
    #[error("Connection closed")]
    ConnectionClosed,

    /// Command failed schema validation
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Tab index out of range
    #[error("Invalid tab index: {index} (session has {count} tabs)")]
    InvalidTabIndex { index: usize, count: usize },

    /// Attempt to close the sole remaining tab
    #[error("Cannot close the last tab; close the session instead")]
    LastTab,

    /// Ref token not in the current snapshot or no longer attached
    #[error("Ref not found: {0}. Take a new snapshot to refresh refs")]
    RefNotFound(String),

    /// Frame locator matched nothing
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// Operation needs a page but the browser is not launched
    #[error("Browser not launched")]
    NoBrowser,

    /// Navigation failed
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// Engine-side wait ran out of time
    #[error("Timeout after {ms}ms: {what}")]
    Timeout { what: String, ms: u64 },

    /// Locator matched no element
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Locator matched more than one element where exactly one was required
    #[error("Strict mode violation: \"{selector}\" resolved to {count} elements")]
    StrictMode { selector: String, count: usize },

    /// Script evaluation threw
    #[error("Evaluation failed: {0}")]
    Script(String),

    /// Operation the engine does not support
    #[error("Unsupported by engine: {0}")]
    Unsupported(String),

    /// Any other engine failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// A new tab exists but its first navigation failed
    #[error("Tab {index} was opened but navigation failed: {source}")]
    OpenedTabNavigation {
        index: usize,
        #[source]
        source: Box<BrowseError>,
    },

    /// No daemon answered after spawning one
    #[error("Daemon for session '{session}' unreachable after {attempts} attempts")]
    DaemonUnreachable { session: String, attempts: u32 },

    /// Bridge peer detached while a request was outstanding
    #[error("Bridge peer disconnected")]
    PeerDisconnected,

    /// Bridge request got no reply in time
    #[error("Bridge request {id} timed out after {secs}s")]
    BridgeTimeout { id: String, secs: u64 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for other cases
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type for browsectl operations
pub type Result<T> = std::result::Result<T, BrowseError>;

impl BrowseError {
    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a navigation error
    pub fn navigation(msg: impl Into<String>) -> Self {
        Self::Navigation(msg.into())
    }

    /// Create an element-not-found error
    pub fn not_found(selector: impl Into<String>) -> Self {
        Self::ElementNotFound(selector.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Which failure class this error belongs to
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::FrameTooLarge { .. } | Self::MalformedFrame(_) | Self::ConnectionClosed => {
                ErrorClass::Transport
            }
            Self::Validation(_) => ErrorClass::Validation,
            Self::InvalidTabIndex { .. }
            | Self::LastTab
            | Self::RefNotFound(_)
            | Self::FrameNotFound(_)
            | Self::NoBrowser => ErrorClass::Addressing,
            Self::Navigation(_)
            | Self::Timeout { .. }
            | Self::ElementNotFound(_)
            | Self::StrictMode { .. }
            | Self::Script(_)
            | Self::Unsupported(_)
            | Self::Engine(_) => ErrorClass::Engine,
            Self::DaemonUnreachable { .. } | Self::PeerDisconnected | Self::BridgeTimeout { .. } => {
                ErrorClass::Lifecycle
            }
            Self::OpenedTabNavigation { source, .. } => source.class(),
            Self::Config(_) | Self::Json(_) | Self::Io(_) | Self::Other(_) => ErrorClass::Ambient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(BrowseError::LastTab.class(), ErrorClass::Addressing);
        assert_eq!(
            BrowseError::StrictMode {
                selector: "button".into(),
                count: 2
            }
            .class(),
            ErrorClass::Engine
        );
        assert_eq!(BrowseError::PeerDisconnected.class(), ErrorClass::Lifecycle);
        assert_eq!(BrowseError::ConnectionClosed.class(), ErrorClass::Transport);

        let partial = BrowseError::OpenedTabNavigation {
            index: 1,
            source: Box::new(BrowseError::Timeout {
                what: "load".into(),
                ms: 30_000,
            }),
        };
        assert_eq!(partial.class(), ErrorClass::Engine);
        assert!(std::error::Error::source(&partial).is_some());
    }

    #[test]
    fn test_error_messages() {
        let err = BrowseError::InvalidTabIndex { index: 4, count: 2 };
        assert_eq!(err.to_string(), "Invalid tab index: 4 (session has 2 tabs)");

        let err = BrowseError::StrictMode {
            selector: "a".into(),
            count: 3,
        };
        assert!(err.to_string().contains("resolved to 3 elements"));
    }
}

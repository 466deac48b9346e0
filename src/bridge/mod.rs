//! Bridge module - engine calls over an intermittently attached peer
//!
//! The daemon side owns a [`Correlator`] that pairs requests with replies
//! by id. [`BridgeEngine`] turns [`Engine`](crate::engine::Engine) calls into
//! bridge requests; [`peer::serve`] is the other end, answering them from a
//! local engine. [`host`] relays a stdio peer onto the bridge socket.
//!
//! Wire form, framed like the control socket:
//!
//! ```text
//! request  {"id": "req-1", "method": "navigate", "params": {...}}
//! reply    {"id": "req-1", "result": ...}
//!          {"id": "req-1", "error": {"kind": "navigation", "message": "..."}}
//! ```

pub mod correlator;
pub mod engine;
pub mod host;
pub mod peer;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{BrowseError, ContextId, PageId, Scope};
use crate::dom::NodeId;
use crate::engine::{Condition, CookieOp, HistoryStep, Interaction, StorageOp, Target};
use crate::protocol::command::{FrameLocator, PaperFormat, WaitUntil};

pub use correlator::Correlator;
pub use engine::BridgeEngine;

/// One engine call as carried in a bridge request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Call {
    Launch,
    Shutdown,
    NewContext,
    CloseContext {
        context: ContextId,
    },
    NewPage {
        context: ContextId,
    },
    ClosePage {
        page: PageId,
    },
    Navigate {
        page: PageId,
        url: String,
        wait_until: WaitUntil,
    },
    History {
        page: PageId,
        step: HistoryStep,
    },
    PageInfo {
        page: PageId,
    },
    FindFrame {
        page: PageId,
        locator: FrameLocator,
    },
    Document {
        scope: Scope,
    },
    NodeAttached {
        scope: Scope,
        node: NodeId,
    },
    Interact {
        scope: Scope,
        target: Target,
        interaction: Interaction,
    },
    WaitFor {
        scope: Scope,
        condition: Condition,
        timeout_ms: u64,
    },
    Screenshot {
        scope: Scope,
        target: Option<Target>,
        full_page: bool,
    },
    Evaluate {
        scope: Scope,
        script: String,
        args: Vec<Value>,
    },
    Cookies {
        context: ContextId,
        op: CookieOp,
    },
    Storage {
        scope: Scope,
        op: StorageOp,
    },
    Pdf {
        page: PageId,
        format: PaperFormat,
    },
}

/// Engine failure as carried in a bridge reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl WireError {
    fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            ms: None,
            count: None,
        }
    }

    /// Decode the `error` member of a reply; unknown shapes become engine errors
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| match value.as_str() {
            Some(message) => Self::new("engine", message),
            None => Self::new("engine", value.to_string()),
        })
    }

    pub fn into_error(self) -> BrowseError {
        match self.kind.as_str() {
            "navigation" => BrowseError::Navigation(self.message),
            "timeout" => BrowseError::Timeout {
                what: self.message,
                ms: self.ms.unwrap_or_default(),
            },
            "not_found" => BrowseError::ElementNotFound(self.message),
            "strict_mode" => BrowseError::StrictMode {
                selector: self.message,
                count: self.count.unwrap_or(2),
            },
            "script" => BrowseError::Script(self.message),
            "unsupported" => BrowseError::Unsupported(self.message),
            "frame_not_found" => BrowseError::FrameNotFound(self.message),
            "no_browser" => BrowseError::NoBrowser,
            _ => BrowseError::Engine(self.message),
        }
    }
}

impl From<&BrowseError> for WireError {
    fn from(err: &BrowseError) -> Self {
        match err {
            BrowseError::Navigation(m) => Self::new("navigation", m.as_str()),
            BrowseError::Timeout { what, ms } => Self {
                ms: Some(*ms),
                ..Self::new("timeout", what.as_str())
            },
            BrowseError::ElementNotFound(s) => Self::new("not_found", s.as_str()),
            BrowseError::StrictMode { selector, count } => Self {
                count: Some(*count),
                ..Self::new("strict_mode", selector.as_str())
            },
            BrowseError::Script(m) => Self::new("script", m.as_str()),
            BrowseError::Unsupported(m) => Self::new("unsupported", m.as_str()),
            BrowseError::FrameNotFound(m) => Self::new("frame_not_found", m.as_str()),
            BrowseError::NoBrowser => Self::new("no_browser", err.to_string()),
            BrowseError::Engine(m) => Self::new("engine", m.as_str()),
            other => Self::new("engine", other.to_string()),
        }
    }
}

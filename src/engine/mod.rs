//! Engine module - the automation engine boundary
//!
//! The daemon never renders pages itself. Everything that touches a page
//! goes through [`Engine`], implemented in-process by [`MemoryEngine`] and
//! over the host bridge by `bridge::BridgeEngine`.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ContextId, FrameId, PageId, PageInfo, Result, Scope};
use crate::dom::{Document, NodeId};
use crate::protocol::command::{
    Cookie, FrameLocator, MouseButton, PaperFormat, ScrollDirection, StorageKind, WaitUntil,
};

pub use memory::{Fixture, FrameFixture, MemoryEngine};

/// Element an interaction applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Target {
    /// The page itself (keyboard and scroll without an element)
    Page,
    /// A node resolved from a ref
    Node(NodeId),
    /// A selector the engine resolves in strict mode
    Selector(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Page => write!(f, "page"),
            Target::Node(node) => write!(f, "node {}:{}", node.index, node.generation),
            Target::Selector(s) => write!(f, "{}", s),
        }
    }
}

/// Element-level operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    Click {
        button: MouseButton,
        click_count: u32,
    },
    Fill {
        value: String,
    },
    Type {
        text: String,
        delay_ms: Option<u64>,
    },
    Press {
        key: String,
    },
    SetChecked {
        checked: bool,
    },
    Hover,
    Focus,
    Select {
        values: Vec<String>,
    },
    Scroll {
        direction: ScrollDirection,
        amount: u32,
    },
    GetText,
}

impl Interaction {
    /// Short verb for logs and events
    pub fn verb(&self) -> &'static str {
        match self {
            Interaction::Click { .. } => "click",
            Interaction::Fill { .. } => "fill",
            Interaction::Type { .. } => "type",
            Interaction::Press { .. } => "press",
            Interaction::SetChecked { checked: true } => "check",
            Interaction::SetChecked { checked: false } => "uncheck",
            Interaction::Hover => "hover",
            Interaction::Focus => "focus",
            Interaction::Select { .. } => "select",
            Interaction::Scroll { .. } => "scroll",
            Interaction::GetText => "gettext",
        }
    }
}

/// History movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStep {
    Back,
    Forward,
    Reload,
}

/// Condition an engine-side wait polls for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Condition {
    /// A visible element
    Element(Target),
    /// Text anywhere in the rendered page
    Text(String),
}

/// Cookie jar operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CookieOp {
    Get { urls: Vec<String> },
    Set { cookies: Vec<Cookie> },
    Clear,
}

/// Web storage operations on the scope's origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StorageOp {
    Get {
        kind: StorageKind,
        key: Option<String>,
    },
    Set {
        kind: StorageKind,
        key: String,
        value: String,
    },
    Clear {
        kind: StorageKind,
    },
}

/// Calls the daemon issues to an automation engine.
///
/// Every method may fail with an engine error; the executor turns those
/// into failed responses.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Start the browser; calling it again is a no-op
    async fn launch(&self) -> Result<()>;

    /// Open an isolated browsing context
    async fn new_context(&self) -> Result<ContextId>;

    /// Close a browsing context and all of its pages
    async fn close_context(&self, context: ContextId) -> Result<()>;

    /// Open a blank page in a context
    async fn new_page(&self, context: ContextId) -> Result<PageId>;

    async fn close_page(&self, page: PageId) -> Result<()>;

    /// Navigate a page and wait for the given load state
    async fn navigate(&self, page: PageId, url: &str, wait_until: WaitUntil) -> Result<PageInfo>;

    async fn history(&self, page: PageId, step: HistoryStep) -> Result<PageInfo>;

    async fn page_info(&self, page: PageId) -> Result<PageInfo>;

    /// Locate an embedded frame of a page
    async fn find_frame(&self, page: PageId, locator: &FrameLocator) -> Result<FrameId>;

    /// Current document of a scope
    async fn document(&self, scope: Scope) -> Result<Document>;

    /// Whether a node is still part of the scope's live document
    async fn node_attached(&self, scope: Scope, node: NodeId) -> Result<bool>;

    async fn interact(&self, scope: Scope, target: &Target, interaction: &Interaction) -> Result<Value>;

    /// Poll until the condition holds or `timeout_ms` passes
    async fn wait_for(&self, scope: Scope, condition: &Condition, timeout_ms: u64) -> Result<()>;

    /// Capture the scope, or one element of it
    async fn screenshot(&self, scope: Scope, target: Option<&Target>, full_page: bool) -> Result<Vec<u8>>;

    async fn evaluate(&self, scope: Scope, script: &str, args: &[Value]) -> Result<Value>;

    async fn cookies(&self, context: ContextId, op: &CookieOp) -> Result<Value>;

    async fn storage(&self, scope: Scope, op: &StorageOp) -> Result<Value>;

    /// Render a page to PDF bytes
    async fn pdf(&self, page: PageId, format: PaperFormat) -> Result<Vec<u8>>;

    /// Tear the browser down
    async fn shutdown(&self) -> Result<()>;
}

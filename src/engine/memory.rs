//! In-process engine backed by fixture documents
//!
//! Pages load from a url → fixture table instead of the network. Cookies and
//! local storage live per browsing context, session storage per page. Used by
//! the test suite and for offline runs (`engine.kind = "memory"`).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{Condition, CookieOp, Engine, HistoryStep, Interaction, StorageOp, Target};
use crate::core::config::EngineConfig;
use crate::core::{BrowseError, ContextId, FrameId, PageId, PageInfo, Result, Scope};
use crate::dom::{Document, NodeId, SerializedNode};
use crate::protocol::command::{Cookie, FrameLocator, PaperFormat, StorageKind, WaitUntil};
use crate::snapshot::{aria, take_snapshot};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn empty_body() -> SerializedNode {
    SerializedNode::element("body")
}

/// A page the memory engine can load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub title: String,
    #[serde(default = "empty_body")]
    pub body: SerializedNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<FrameFixture>,
}

/// An embedded document of a fixture page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameFixture {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
    #[serde(default = "empty_body")]
    pub body: SerializedNode,
}

impl Fixture {
    pub fn new(title: &str, body: SerializedNode) -> Self {
        Self {
            title: title.to_string(),
            body,
            frames: Vec::new(),
        }
    }

    pub fn frame(mut self, frame: FrameFixture) -> Self {
        self.frames.push(frame);
        self
    }
}

/// Pages every memory engine knows
pub fn builtin_fixtures() -> Vec<(String, Fixture)> {
    let home = SerializedNode::element("body")
        .child(SerializedNode::element("h1").child(SerializedNode::text("Example Domain")))
        .child(SerializedNode::element("p").child(SerializedNode::text(
            "This domain is for use in documentation examples.",
        )))
        .child(
            SerializedNode::element("a")
                .attr("href", "/login")
                .child(SerializedNode::text("Sign in")),
        );

    let login = SerializedNode::element("body").child(
        SerializedNode::element("form")
            .attr("aria-label", "Login")
            .child(
                SerializedNode::element("input")
                    .attr("type", "email")
                    .attr("placeholder", "Email"),
            )
            .child(
                SerializedNode::element("label")
                    .child(SerializedNode::element("input").attr("type", "checkbox"))
                    .child(SerializedNode::text("Remember me")),
            )
            .child(
                SerializedNode::element("select")
                    .attr("name", "plan")
                    .child(
                        SerializedNode::element("option")
                            .attr("value", "free")
                            .child(SerializedNode::text("Free")),
                    )
                    .child(
                        SerializedNode::element("option")
                            .attr("value", "pro")
                            .child(SerializedNode::text("Pro")),
                    ),
            )
            .child(
                SerializedNode::element("button")
                    .attr("type", "submit")
                    .child(SerializedNode::text("Sign in")),
            ),
    );

    let checkout = Fixture::new(
        "Checkout",
        SerializedNode::element("body")
            .child(SerializedNode::element("h1").child(SerializedNode::text("Checkout"))),
    )
    .frame(FrameFixture {
        name: Some("payment".to_string()),
        url: "https://pay.example.test/widget".to_string(),
        body: SerializedNode::element("body").child(
            SerializedNode::element("button").child(SerializedNode::text("Pay now")),
        ),
    });

    vec![
        ("https://example.test/".to_string(), Fixture::new("Example", home)),
        ("https://example.test/login".to_string(), Fixture::new("Login", login)),
        ("https://example.test/checkout".to_string(), checkout),
    ]
}

fn fixture_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

fn origin_of(url: &str) -> Option<String> {
    let origin = url::Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_string)
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{}", domain))
}

type StorageArea = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct ContextState {
    cookies: Vec<Cookie>,
    local: HashMap<String, StorageArea>,
}

#[derive(Debug)]
struct FrameState {
    id: FrameId,
    name: Option<String>,
    url: String,
    doc: Document,
}

#[derive(Debug)]
struct PageState {
    context: ContextId,
    history: Vec<String>,
    cursor: usize,
    url: String,
    title: String,
    doc: Document,
    frames: Vec<FrameState>,
    session: HashMap<String, StorageArea>,
    focused: Option<NodeId>,
}

impl PageState {
    fn info(&self) -> PageInfo {
        PageInfo {
            url: self.url.clone(),
            title: self.title.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    launched: bool,
    fixtures: HashMap<String, Fixture>,
    next_id: u64,
    contexts: HashMap<ContextId, ContextState>,
    pages: HashMap<PageId, PageState>,
    events: Vec<String>,
}

impl Inner {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn page(&self, page: PageId) -> Result<&PageState> {
        self.pages
            .get(&page)
            .ok_or_else(|| BrowseError::engine(format!("Page {} is closed", page)))
    }

    fn page_mut(&mut self, page: PageId) -> Result<&mut PageState> {
        self.pages
            .get_mut(&page)
            .ok_or_else(|| BrowseError::engine(format!("Page {} is closed", page)))
    }

    fn doc(&self, scope: Scope) -> Result<&Document> {
        let page = self.page(scope.page)?;
        match scope.frame {
            None => Ok(&page.doc),
            Some(frame) => page
                .frames
                .iter()
                .find(|f| f.id == frame)
                .map(|f| &f.doc)
                .ok_or_else(|| BrowseError::FrameNotFound(format!("frame {} was detached", frame))),
        }
    }

    fn doc_mut(&mut self, scope: Scope) -> Result<&mut Document> {
        let page = self.page_mut(scope.page)?;
        match scope.frame {
            None => Ok(&mut page.doc),
            Some(frame) => page
                .frames
                .iter_mut()
                .find(|f| f.id == frame)
                .map(|f| &mut f.doc)
                .ok_or_else(|| BrowseError::FrameNotFound(format!("frame {} was detached", frame))),
        }
    }

    fn scope_url(&self, scope: Scope) -> Result<String> {
        let page = self.page(scope.page)?;
        match scope.frame {
            None => Ok(page.url.clone()),
            Some(frame) => page
                .frames
                .iter()
                .find(|f| f.id == frame)
                .map(|f| f.url.clone())
                .ok_or_else(|| BrowseError::FrameNotFound(format!("frame {} was detached", frame))),
        }
    }

    /// Replace a page's content with whatever `url` loads
    fn load(&mut self, page: PageId, url: &str) -> Result<PageInfo> {
        self.page(page)?;
        let parsed = url::Url::parse(url)
            .map_err(|e| BrowseError::navigation(format!("invalid URL {}: {}", url, e)))?;

        let fixture = match parsed.scheme() {
            "about" | "data" => Fixture::new("", empty_body()),
            "http" | "https" => self
                .fixtures
                .get(&fixture_key(url))
                .cloned()
                .ok_or_else(|| {
                    BrowseError::navigation(format!("net::ERR_NAME_NOT_RESOLVED at {}", url))
                })?,
            other => {
                return Err(BrowseError::navigation(format!(
                    "unsupported scheme '{}' in {}",
                    other, url
                )))
            }
        };

        let mut doc = Document::from_serialized(&fixture.body);
        let mut frames = Vec::new();
        for frame in &fixture.frames {
            let body = doc.body();
            let present = doc
                .query_all(body, "iframe")
                .unwrap_or_default()
                .into_iter()
                .any(|f| doc.attr(f, "src") == Some(frame.url.as_str()));
            if !present {
                let mut attrs = vec![("src", frame.url.as_str())];
                if let Some(name) = &frame.name {
                    attrs.push(("name", name.as_str()));
                }
                doc.element(body, "iframe", &attrs);
            }
            frames.push(FrameState {
                id: FrameId(self.next()),
                name: frame.name.clone(),
                url: frame.url.clone(),
                doc: Document::from_serialized(&frame.body),
            });
        }

        let state = self.page_mut(page)?;
        state.url = url.to_string();
        state.title = fixture.title;
        state.doc = doc;
        state.frames = frames;
        state.focused = None;
        Ok(state.info())
    }

    fn record(&mut self, event: String) {
        tracing::debug!(event = %event, "memory engine");
        self.events.push(event);
    }
}

/// Resolve a target in strict mode; `Target::Page` yields `None`
fn resolve(doc: &Document, target: &Target) -> Result<Option<NodeId>> {
    match target {
        Target::Page => Ok(None),
        Target::Node(node) => {
            if doc.is_attached(*node) {
                Ok(Some(*node))
            } else {
                Err(BrowseError::not_found("element is no longer attached to the page"))
            }
        }
        Target::Selector(selector) => {
            let found = doc
                .query_all(doc.root(), selector)
                .map_err(|e| BrowseError::engine(format!("Invalid selector: {}", e)))?;
            match found.len() {
                0 => Err(BrowseError::not_found(selector.clone())),
                1 => Ok(Some(found[0])),
                count => Err(BrowseError::StrictMode {
                    selector: selector.clone(),
                    count,
                }),
            }
        }
    }
}

fn describe(doc: &Document, node: Option<NodeId>) -> String {
    let Some(node) = node else {
        return "page".to_string();
    };
    let role = aria::role_of(doc, node);
    let name = aria::accessible_name(doc, node, &role);
    if name.is_empty() {
        role
    } else {
        format!("{} \"{}\"", role, name)
    }
}

fn is_editable(doc: &Document, node: NodeId) -> bool {
    match doc.tag(node) {
        Some("textarea") => true,
        Some("input") => !matches!(
            doc.attr(node, "type").map(str::to_ascii_lowercase).as_deref(),
            Some("checkbox" | "radio" | "button" | "submit" | "reset" | "image" | "file" | "hidden")
        ),
        _ => doc.get(node).is_some_and(|n| n.has_attr("contenteditable")),
    }
}

fn current_value(doc: &Document, node: NodeId) -> String {
    match doc.tag(node) {
        Some("input") => doc.attr(node, "value").unwrap_or_default().to_string(),
        _ => doc.text_content(node),
    }
}

fn set_value(doc: &mut Document, node: NodeId, value: &str) {
    if doc.tag(node) == Some("input") {
        doc.set_attr(node, "value", value);
        return;
    }
    for child in doc.children(node).to_vec() {
        doc.remove(child);
    }
    if !value.is_empty() {
        doc.text(node, value);
    }
}

/// Fixture-backed engine; cloning shares the same browser
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Engine with the built-in pages only
    pub fn new() -> Self {
        Self::with_fixtures(Vec::new())
    }

    /// Engine with extra pages on top of the built-in ones
    pub fn with_fixtures(fixtures: impl IntoIterator<Item = (String, Fixture)>) -> Self {
        let mut table: HashMap<String, Fixture> = builtin_fixtures()
            .into_iter()
            .map(|(url, f)| (fixture_key(&url), f))
            .collect();
        for (url, fixture) in fixtures {
            table.insert(fixture_key(&url), fixture);
        }
        Self {
            inner: Arc::new(Mutex::new(Inner {
                fixtures: table,
                ..Inner::default()
            })),
        }
    }

    /// Read a JSON `{url: fixture}` file
    pub fn load_fixtures(path: &Path) -> Result<Vec<(String, Fixture)>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrowseError::config(format!("Failed to read fixtures {}: {}", path.display(), e))
        })?;
        let table: BTreeMap<String, Fixture> = serde_json::from_str(&content)?;
        Ok(table.into_iter().collect())
    }

    /// Build from the `[engine]` config section
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let extra = match &config.fixtures {
            Some(path) => Self::load_fixtures(path)?,
            None => Vec::new(),
        };
        Ok(Self::with_fixtures(extra))
    }

    /// Add or replace a page
    pub async fn add_fixture(&self, url: &str, fixture: Fixture) {
        self.inner.lock().await.fixtures.insert(fixture_key(url), fixture);
    }

    /// Interaction log, oldest first
    pub async fn events(&self) -> Vec<String> {
        self.inner.lock().await.events.clone()
    }

    pub async fn page_count(&self) -> usize {
        self.inner.lock().await.pages.len()
    }

    /// Mutate a page's main document in place, as page scripts would
    pub async fn with_document<R>(
        &self,
        page: PageId,
        f: impl FnOnce(&mut Document) -> R + Send,
    ) -> Result<R> {
        let mut inner = self.inner.lock().await;
        let state = inner.page_mut(page)?;
        Ok(f(&mut state.doc))
    }

    fn evaluate_in(inner: &Inner, scope: Scope, script: &str, args: &[Value]) -> Result<Value> {
        let script = script.trim().trim_end_matches(';').trim();
        let page = inner.page(scope.page)?;
        let doc = inner.doc(scope)?;

        let value = match script {
            "document.title" => json!(if scope.frame.is_none() { page.title.as_str() } else { "" }),
            "location.href" | "window.location.href" | "document.URL" => {
                json!(inner.scope_url(scope)?)
            }
            "document.body.innerText" => json!(aria::visible_text(doc, doc.body())),
            "document.readyState" => json!("complete"),
            _ => {
                if let Some(index) = script
                    .strip_prefix("args[")
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    return Ok(args.get(index).cloned().unwrap_or(Value::Null));
                }
                if let Some(selector) = script
                    .strip_prefix("document.querySelectorAll(")
                    .and_then(|s| s.strip_suffix(").length"))
                {
                    let selector = selector.trim().trim_matches(|c| c == '\'' || c == '"');
                    let count = doc
                        .query_all(doc.root(), selector)
                        .map_err(|e| BrowseError::Script(format!("SyntaxError: {}", e)))?
                        .len();
                    return Ok(json!(count));
                }
                serde_json::from_str::<Value>(script).map_err(|_| {
                    BrowseError::Script(format!("memory engine cannot evaluate '{}'", script))
                })?
            }
        };
        Ok(value)
    }

    fn interact_in(
        inner: &mut Inner,
        scope: Scope,
        target: &Target,
        interaction: &Interaction,
    ) -> Result<Value> {
        let (node, label) = {
            let doc = inner.doc(scope)?;
            let node = resolve(doc, target)?;
            if let Some(node) = node {
                let needs_visible = !matches!(interaction, Interaction::GetText);
                if needs_visible && !aria::is_visible_in_tree(doc, node) {
                    return Err(BrowseError::engine(format!(
                        "Element is not visible: {}",
                        target
                    )));
                }
                let disabled = doc.get(node).is_some_and(|n| n.has_attr("disabled"));
                let acts = !matches!(
                    interaction,
                    Interaction::GetText | Interaction::Hover | Interaction::Scroll { .. }
                );
                if disabled && acts {
                    return Err(BrowseError::engine(format!("Element is disabled: {}", target)));
                }
            }
            // Keys without an element go to whatever has focus
            let focused = match (node, interaction) {
                (None, Interaction::Press { .. }) => inner
                    .page(scope.page)?
                    .focused
                    .filter(|f| doc.is_attached(*f)),
                _ => None,
            };
            (node, describe(doc, node.or(focused)))
        };

        let require = |node: Option<NodeId>| {
            node.ok_or_else(|| {
                BrowseError::engine(format!("{} needs an element", interaction.verb()))
            })
        };

        let mut follow: Option<String> = None;
        let result = match interaction {
            Interaction::Click { click_count, .. } => {
                let node = require(node)?;
                let page_url = inner.page(scope.page)?.url.clone();
                let doc = inner.doc_mut(scope)?;
                let tag = doc.tag(node).map(str::to_string);
                match tag.as_deref() {
                    Some("a") if scope.frame.is_none() => {
                        if let Some(href) = doc.attr(node, "href") {
                            let base = url::Url::parse(&page_url).ok();
                            follow = base
                                .and_then(|b| b.join(href).ok())
                                .map(|u| u.to_string())
                                .or_else(|| Some(href.to_string()));
                        }
                    }
                    Some("input") => {
                        let kind = doc.attr(node, "type").map(str::to_ascii_lowercase);
                        // An even click count leaves a checkbox unchanged
                        if kind.as_deref() == Some("checkbox") && click_count % 2 == 1 {
                            if doc.get(node).is_some_and(|n| n.has_attr("checked")) {
                                doc.remove_attr(node, "checked");
                            } else {
                                doc.set_attr(node, "checked", "");
                            }
                        } else if kind.as_deref() == Some("radio") {
                            doc.set_attr(node, "checked", "");
                        }
                    }
                    _ => {}
                }
                Value::Null
            }
            Interaction::Fill { value } => {
                let node = require(node)?;
                let doc = inner.doc_mut(scope)?;
                if !is_editable(doc, node) {
                    return Err(BrowseError::engine(
                        "Element is not an <input>, <textarea> or [contenteditable] element",
                    ));
                }
                set_value(doc, node, value);
                Value::Null
            }
            Interaction::Type { text, .. } => {
                let node = require(node)?;
                let doc = inner.doc_mut(scope)?;
                if !is_editable(doc, node) {
                    return Err(BrowseError::engine(format!("Cannot type into {}", label)));
                }
                let value = format!("{}{}", current_value(doc, node), text);
                set_value(doc, node, &value);
                Value::Null
            }
            Interaction::Press { .. } | Interaction::Hover | Interaction::Scroll { .. } => {
                Value::Null
            }
            Interaction::Focus => {
                let node = require(node)?;
                inner.page_mut(scope.page)?.focused = Some(node);
                Value::Null
            }
            Interaction::SetChecked { checked } => {
                let node = require(node)?;
                let doc = inner.doc_mut(scope)?;
                let kind = doc.attr(node, "type").map(str::to_ascii_lowercase);
                let native = doc.tag(node) == Some("input")
                    && matches!(kind.as_deref(), Some("checkbox" | "radio"));
                let role = aria::role_of(doc, node);
                if native {
                    if *checked {
                        doc.set_attr(node, "checked", "");
                    } else if kind.as_deref() == Some("radio") {
                        return Err(BrowseError::engine("Cannot uncheck a radio button"));
                    } else {
                        doc.remove_attr(node, "checked");
                    }
                } else if matches!(role.as_str(), "checkbox" | "switch" | "menuitemcheckbox") {
                    doc.set_attr(node, "aria-checked", if *checked { "true" } else { "false" });
                } else {
                    return Err(BrowseError::engine(format!(
                        "Not a checkbox or radio button: {}",
                        label
                    )));
                }
                Value::Null
            }
            Interaction::Select { values } => {
                let node = require(node)?;
                let doc = inner.doc_mut(scope)?;
                if doc.tag(node) != Some("select") {
                    return Err(BrowseError::engine(format!("Element is not a <select>: {}", label)));
                }
                let multiple = doc.get(node).is_some_and(|n| n.has_attr("multiple"));
                let options = doc.query_all(node, "option").unwrap_or_default();
                let mut chosen = Vec::new();
                for option in options {
                    let value = doc
                        .attr(option, "value")
                        .map(str::to_string)
                        .unwrap_or_else(|| aria::visible_text(doc, option));
                    let text = aria::visible_text(doc, option);
                    let wanted = values.iter().any(|v| *v == value || *v == text);
                    let take = wanted && (multiple || chosen.is_empty());
                    if take {
                        doc.set_attr(option, "selected", "");
                        chosen.push(value);
                    } else {
                        doc.remove_attr(option, "selected");
                    }
                }
                if chosen.is_empty() {
                    return Err(BrowseError::engine(format!(
                        "No options matching {:?} in {}",
                        values, label
                    )));
                }
                json!(chosen)
            }
            Interaction::GetText => {
                let node = require(node)?;
                json!(aria::visible_text(inner.doc(scope)?, node))
            }
        };

        let event = match interaction {
            Interaction::Press { key } => format!("press {} on {}", key, label),
            Interaction::Fill { value } => format!("fill {} with {:?}", label, value),
            Interaction::Type { text, .. } => format!("type {:?} into {}", text, label),
            other => format!("{} {}", other.verb(), label),
        };
        inner.record(event);

        if let Some(url) = follow {
            let info = inner.load(scope.page, &url)?;
            let page = inner.page_mut(scope.page)?;
            page.history.truncate(page.cursor + 1);
            page.history.push(url);
            page.cursor = page.history.len() - 1;
            return Ok(json!({ "url": info.url, "title": info.title }));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").finish_non_exhaustive()
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn launch(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.launched {
            inner.launched = true;
            inner.record("launch".to_string());
        }
        Ok(())
    }

    async fn new_context(&self) -> Result<ContextId> {
        let mut inner = self.inner.lock().await;
        if !inner.launched {
            return Err(BrowseError::NoBrowser);
        }
        let id = ContextId(inner.next());
        inner.contexts.insert(id, ContextState::default());
        Ok(id)
    }

    async fn close_context(&self, context: ContextId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.contexts.remove(&context);
        inner.pages.retain(|_, p| p.context != context);
        Ok(())
    }

    async fn new_page(&self, context: ContextId) -> Result<PageId> {
        let mut inner = self.inner.lock().await;
        if !inner.contexts.contains_key(&context) {
            return Err(BrowseError::engine(format!("Context {} is closed", context)));
        }
        let id = PageId(inner.next());
        inner.pages.insert(
            id,
            PageState {
                context,
                history: vec!["about:blank".to_string()],
                cursor: 0,
                url: "about:blank".to_string(),
                title: String::new(),
                doc: Document::new(),
                frames: Vec::new(),
                session: HashMap::new(),
                focused: None,
            },
        );
        Ok(id)
    }

    async fn close_page(&self, page: PageId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .pages
            .remove(&page)
            .map(|_| ())
            .ok_or_else(|| BrowseError::engine(format!("Page {} is closed", page)))
    }

    async fn navigate(&self, page: PageId, url: &str, _wait_until: WaitUntil) -> Result<PageInfo> {
        let mut inner = self.inner.lock().await;
        let info = inner.load(page, url)?;
        let state = inner.page_mut(page)?;
        state.history.truncate(state.cursor + 1);
        state.history.push(url.to_string());
        state.cursor = state.history.len() - 1;
        inner.record(format!("navigate {}", url));
        Ok(info)
    }

    async fn history(&self, page: PageId, step: HistoryStep) -> Result<PageInfo> {
        let mut inner = self.inner.lock().await;
        let state = inner.page_mut(page)?;
        let cursor = match step {
            HistoryStep::Back => state.cursor.saturating_sub(1),
            HistoryStep::Forward => (state.cursor + 1).min(state.history.len() - 1),
            HistoryStep::Reload => state.cursor,
        };
        if cursor == state.cursor && step != HistoryStep::Reload {
            return Ok(state.info());
        }
        state.cursor = cursor;
        let url = state.history[cursor].clone();
        inner.load(page, &url)
    }

    async fn page_info(&self, page: PageId) -> Result<PageInfo> {
        Ok(self.inner.lock().await.page(page)?.info())
    }

    async fn find_frame(&self, page: PageId, locator: &FrameLocator) -> Result<FrameId> {
        let inner = self.inner.lock().await;
        let state = inner.page(page)?;
        let found = match locator {
            FrameLocator::Name(name) => state
                .frames
                .iter()
                .find(|f| f.name.as_deref() == Some(name.as_str())),
            FrameLocator::Url(url) => state
                .frames
                .iter()
                .find(|f| f.url == *url || f.url.contains(url.as_str())),
            FrameLocator::Selector(selector) => {
                let element = resolve(&state.doc, &Target::Selector(selector.clone()))
                    .map_err(|_| BrowseError::FrameNotFound(locator.to_string()))?
                    .ok_or_else(|| BrowseError::FrameNotFound(locator.to_string()))?;
                if state.doc.tag(element) != Some("iframe") {
                    return Err(BrowseError::engine(format!(
                        "Element is not an <iframe>: {}",
                        selector
                    )));
                }
                let src = state.doc.attr(element, "src");
                let name = state.doc.attr(element, "name");
                state.frames.iter().find(|f| {
                    src == Some(f.url.as_str()) || (name.is_some() && name == f.name.as_deref())
                })
            }
        };
        found
            .map(|f| f.id)
            .ok_or_else(|| BrowseError::FrameNotFound(locator.to_string()))
    }

    async fn document(&self, scope: Scope) -> Result<Document> {
        Ok(self.inner.lock().await.doc(scope)?.clone())
    }

    async fn node_attached(&self, scope: Scope, node: NodeId) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.doc(scope).map(|d| d.is_attached(node)).unwrap_or(false))
    }

    async fn interact(&self, scope: Scope, target: &Target, interaction: &Interaction) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        Self::interact_in(&mut inner, scope, target, interaction)
    }

    async fn wait_for(&self, scope: Scope, condition: &Condition, timeout_ms: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let inner = self.inner.lock().await;
                let doc = inner.doc(scope)?;
                let satisfied = match condition {
                    Condition::Element(target) => match resolve(doc, target) {
                        Ok(Some(node)) => aria::is_visible_in_tree(doc, node),
                        Ok(None) => true,
                        Err(BrowseError::StrictMode { .. }) => true,
                        Err(_) => false,
                    },
                    Condition::Text(text) => aria::visible_text(doc, doc.body()).contains(text.as_str()),
                };
                if satisfied {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let what = match condition {
                    Condition::Element(target) => format!("waiting for {}", target),
                    Condition::Text(text) => format!("waiting for text {:?}", text),
                };
                return Err(BrowseError::Timeout {
                    what,
                    ms: timeout_ms,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn screenshot(&self, scope: Scope, target: Option<&Target>, _full_page: bool) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        let doc = inner.doc(scope)?;
        let root = match target {
            Some(target) => resolve(doc, target)?,
            None => None,
        };
        let snapshot = take_snapshot(doc, root, &Default::default());
        Ok(snapshot.tree.into_bytes())
    }

    async fn evaluate(&self, scope: Scope, script: &str, args: &[Value]) -> Result<Value> {
        let inner = self.inner.lock().await;
        Self::evaluate_in(&inner, scope, script, args)
    }

    async fn cookies(&self, context: ContextId, op: &CookieOp) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .contexts
            .get_mut(&context)
            .ok_or_else(|| BrowseError::engine(format!("Context {} is closed", context)))?;

        match op {
            CookieOp::Get { urls } => {
                let hosts: Vec<String> = urls.iter().filter_map(|u| host_of(u)).collect();
                let cookies: Vec<&Cookie> = state
                    .cookies
                    .iter()
                    .filter(|c| {
                        urls.is_empty()
                            || c.domain
                                .as_deref()
                                .is_some_and(|d| hosts.iter().any(|h| domain_matches(h, d)))
                    })
                    .collect();
                Ok(serde_json::to_value(cookies)?)
            }
            CookieOp::Set { cookies } => {
                for cookie in cookies {
                    let mut cookie = cookie.clone();
                    if cookie.domain.is_none() {
                        cookie.domain = cookie.url.as_deref().and_then(host_of);
                    }
                    if cookie.domain.is_none() {
                        return Err(BrowseError::engine(format!(
                            "Cookie '{}' has no usable domain",
                            cookie.name
                        )));
                    }
                    cookie.path.get_or_insert_with(|| "/".to_string());
                    cookie.url = None;
                    state.cookies.retain(|c| {
                        !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
                    });
                    state.cookies.push(cookie);
                }
                Ok(Value::Null)
            }
            CookieOp::Clear => {
                state.cookies.clear();
                Ok(Value::Null)
            }
        }
    }

    async fn storage(&self, scope: Scope, op: &StorageOp) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        let url = inner.scope_url(scope)?;
        let origin = origin_of(&url).ok_or_else(|| {
            BrowseError::Script(format!("SecurityError: storage is not available at {}", url))
        })?;
        let kind = match op {
            StorageOp::Get { kind, .. } | StorageOp::Set { kind, .. } | StorageOp::Clear { kind } => *kind,
        };

        let context = inner.page(scope.page)?.context;
        let area = match kind {
            StorageKind::Session => inner.page_mut(scope.page)?.session.entry(origin).or_default(),
            StorageKind::Local => inner
                .contexts
                .get_mut(&context)
                .ok_or_else(|| BrowseError::engine(format!("Context {} is closed", context)))?
                .local
                .entry(origin)
                .or_default(),
        };

        match op {
            StorageOp::Get { key: Some(key), .. } => Ok(json!(area.get(key))),
            StorageOp::Get { key: None, .. } => Ok(serde_json::to_value(&*area)?),
            StorageOp::Set { key, value, .. } => {
                area.insert(key.clone(), value.clone());
                Ok(Value::Null)
            }
            StorageOp::Clear { .. } => {
                area.clear();
                Ok(Value::Null)
            }
        }
    }

    async fn pdf(&self, page: PageId, format: PaperFormat) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        let state = inner.page(page)?;
        let text = aria::visible_text(&state.doc, state.doc.body());
        Ok(format!("%PDF-1.4\n% {:?} {}\n{}\n%%EOF\n", format, state.title, text).into_bytes())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.contexts.clear();
        inner.pages.clear();
        inner.launched = false;
        inner.record("shutdown".to_string());
        Ok(())
    }
}

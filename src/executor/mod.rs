//! Command executor - dispatches validated commands and normalizes errors
//!
//! Every command yields exactly one [`Response`] carrying its id. Failures
//! from the state manager or the engine never escape: they become
//! `{success: false, error}` here.

use std::sync::Arc;

use base64::Engine as _;
use serde_json::{json, Value};

use crate::core::{BrowseError, PageId, PageInfo, Response, Result};
use crate::engine::{Condition, CookieOp, Engine, HistoryStep, Interaction, StorageOp, Target};
use crate::protocol::command::{
    validate, Action, Command, MouseButton, ScreenshotOptions, SnapshotOptions, WaitFor,
};
use crate::snapshot::{parse_ref, take_snapshot, RefMap};
use crate::state::StateManager;

/// Executes commands for one session
pub struct Executor {
    engine: Arc<dyn Engine>,
    state: StateManager,
    /// Refs of the latest snapshot
    refs: RefMap,
    closed: bool,
}

impl Executor {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            state: StateManager::new(engine.clone()),
            engine,
            refs: RefMap::default(),
            closed: false,
        }
    }

    /// Whether a `close` command has shut the browser down
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Tear the browser down unless a `close` command already did
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.state.close_all().await {
            tracing::warn!(error = %e, "browser shutdown failed");
        }
        self.refs.clear();
        self.closed = true;
    }

    /// Validate a raw frame and execute it
    pub async fn handle_value(&mut self, raw: &Value) -> Response {
        match validate(raw) {
            Ok(command) => self.execute(command).await,
            Err(err) => {
                let id = err.id.clone().unwrap_or_default();
                tracing::warn!(id = %id, error = %err, "rejected command");
                Response::err(id, err.to_string())
            }
        }
    }

    /// Execute one command
    pub async fn execute(&mut self, command: Command) -> Response {
        let Command { id, action } = command;
        let name = action.name();
        tracing::debug!(id = %id, action = name, "executing");

        match self.dispatch(action).await {
            Ok(data) => Response::ok(id, data),
            Err(e) => {
                tracing::warn!(id = %id, action = name, class = ?e.class(), error = %e, "command failed");
                Response::err(id, e.to_string())
            }
        }
    }

    async fn dispatch(&mut self, action: Action) -> Result<Value> {
        match action {
            Action::Launch => {
                let launched = self.state.launch().await?;
                return Ok(json!({ "launched": launched }));
            }
            Action::Close => {
                self.state.close_all().await?;
                self.refs.clear();
                self.closed = true;
                return Ok(json!({ "closed": true }));
            }
            _ => {}
        }

        self.state.ensure_launched().await?;

        match action {
            Action::Navigate { url, wait_until } => {
                let page = self.state.active()?.page;
                let info = self.engine.navigate(page, &url, wait_until).await?;
                Ok(self.navigated(page, info))
            }
            Action::Back => self.history(HistoryStep::Back).await,
            Action::Forward => self.history(HistoryStep::Forward).await,
            Action::Reload => self.history(HistoryStep::Reload).await,
            Action::Url => {
                let info = self.engine.page_info(self.state.active()?.page).await?;
                Ok(json!({ "url": info.url }))
            }
            Action::Title => {
                let info = self.engine.page_info(self.state.active()?.page).await?;
                Ok(json!({ "title": info.title }))
            }

            Action::Click {
                selector,
                button,
                click_count,
            } => self.click(&selector, button, click_count).await,
            Action::Dblclick { selector } => self.click(&selector, MouseButton::Left, 2).await,
            Action::Fill { selector, value } => {
                self.interact(Some(&selector), Interaction::Fill { value }).await
            }
            Action::Type {
                selector,
                text,
                delay_ms,
            } => {
                self.interact(Some(&selector), Interaction::Type { text, delay_ms })
                    .await
            }
            Action::Press { key, selector } => {
                self.interact(selector.as_deref(), Interaction::Press { key })
                    .await
            }
            Action::Check { selector } => {
                self.interact(Some(&selector), Interaction::SetChecked { checked: true })
                    .await
            }
            Action::Uncheck { selector } => {
                self.interact(Some(&selector), Interaction::SetChecked { checked: false })
                    .await
            }
            Action::Hover { selector } => self.interact(Some(&selector), Interaction::Hover).await,
            Action::Focus { selector } => self.interact(Some(&selector), Interaction::Focus).await,
            Action::Select { selector, values } => {
                let chosen = self
                    .interact(Some(&selector), Interaction::Select { values })
                    .await?;
                Ok(json!({ "values": chosen }))
            }
            Action::Scroll {
                direction,
                amount,
                selector,
            } => {
                self.interact(
                    selector.as_deref(),
                    Interaction::Scroll { direction, amount },
                )
                .await
            }
            Action::GetText { selector } => {
                let text = self.interact(Some(&selector), Interaction::GetText).await?;
                Ok(json!({ "text": text }))
            }

            Action::Wait(wait) => self.wait(wait).await,
            Action::Snapshot(options) => self.snapshot(options).await,
            Action::Screenshot(options) => self.screenshot(options).await,
            Action::Evaluate { script, args } => {
                let scope = self.state.scope()?;
                let result = self.engine.evaluate(scope, &script, &args).await?;
                Ok(json!({ "result": result }))
            }
            Action::Pdf { path, format } => {
                let page = self.state.active()?.page;
                let bytes = self.engine.pdf(page, format).await?;
                tokio::fs::write(&path, &bytes).await?;
                Ok(json!({ "path": path }))
            }

            Action::CookiesGet { urls } => {
                let cookies = self.cookies(CookieOp::Get { urls }).await?;
                Ok(json!({ "cookies": cookies }))
            }
            Action::CookiesSet { cookies } => self.cookies(CookieOp::Set { cookies }).await.map(ack),
            Action::CookiesClear => self.cookies(CookieOp::Clear).await.map(ack),
            Action::StorageGet { kind, key } => {
                let scope = self.state.scope()?;
                let value = self
                    .engine
                    .storage(scope, &StorageOp::Get { kind, key: key.clone() })
                    .await?;
                Ok(match key {
                    Some(key) => json!({ "key": key, "value": value }),
                    None => json!({ "data": value }),
                })
            }
            Action::StorageSet { kind, key, value } => {
                let scope = self.state.scope()?;
                self.engine
                    .storage(scope, &StorageOp::Set { kind, key, value })
                    .await
                    .map(ack)
            }
            Action::StorageClear { kind } => {
                let scope = self.state.scope()?;
                self.engine
                    .storage(scope, &StorageOp::Clear { kind })
                    .await
                    .map(ack)
            }

            Action::TabNew { url } => {
                let index = self.state.new_tab().await?;
                self.opened(index, url.as_deref()).await
            }
            Action::WindowNew { url } => {
                let index = self.state.new_window().await?;
                self.opened(index, url.as_deref()).await
            }
            Action::TabList => {
                let tabs = self.state.list_tabs().await;
                Ok(json!({ "tabs": tabs, "active": self.state.active_index() }))
            }
            Action::TabSwitch { index } => {
                let tab = self.state.switch_to(index)?;
                Ok(json!({ "index": index, "url": tab.url, "title": tab.title }))
            }
            Action::TabClose { index } => {
                let closed = self.state.close_tab(index).await?;
                Ok(json!({
                    "closed": closed,
                    "remaining": self.state.tab_count(),
                    "active": self.state.active_index(),
                }))
            }
            Action::Frame(locator) => {
                self.state.switch_to_frame(&locator).await?;
                Ok(json!({ "frame": locator.to_string() }))
            }
            Action::MainFrame => {
                self.state.switch_to_main_frame();
                Ok(ack(Value::Null))
            }

            Action::Launch | Action::Close => Ok(ack(Value::Null)),
        }
    }

    /// Turn a locator string into an engine target.
    ///
    /// Ref tokens must resolve to a node that is still attached; anything
    /// else is passed to the engine as a selector.
    async fn target(&self, selector: &str) -> Result<Target> {
        let Some(node) = self.refs.lookup(selector) else {
            return Ok(Target::Selector(selector.to_string()));
        };
        let node = node?;
        let scope = self.state.scope()?;
        if self.engine.node_attached(scope, node).await? {
            Ok(Target::Node(node))
        } else {
            Err(BrowseError::RefNotFound(
                parse_ref(selector).unwrap_or_else(|| selector.to_string()),
            ))
        }
    }

    async fn interact(&mut self, selector: Option<&str>, interaction: Interaction) -> Result<Value> {
        let target = match selector {
            Some(selector) => self.target(selector).await?,
            None => Target::Page,
        };
        let scope = self.state.scope()?;
        let result = self.engine.interact(scope, &target, &interaction).await?;
        Ok(match interaction {
            Interaction::GetText | Interaction::Select { .. } => result,
            _ => ack(result),
        })
    }

    async fn click(&mut self, selector: &str, button: MouseButton, click_count: u32) -> Result<Value> {
        let page = self.state.active()?.page;
        let result = self
            .interact(
                Some(selector),
                Interaction::Click {
                    button,
                    click_count,
                },
            )
            .await?;
        // A followed link changes the page under the tab
        let info = self.engine.page_info(page).await?;
        self.state.record(page, &info);
        Ok(result)
    }

    async fn history(&mut self, step: HistoryStep) -> Result<Value> {
        let page = self.state.active()?.page;
        let info = self.engine.history(page, step).await?;
        Ok(self.navigated(page, info))
    }

    fn navigated(&mut self, page: PageId, info: PageInfo) -> Value {
        self.state.record(page, &info);
        // The old frame documents are gone after a navigation
        self.state.switch_to_main_frame();
        json!({ "url": info.url, "title": info.title })
    }

    /// Report a freshly opened tab, navigating it if asked.
    ///
    /// The tab stays open when navigation fails; the error says so.
    async fn opened(&mut self, index: usize, url: Option<&str>) -> Result<Value> {
        let page = self.state.active()?.page;
        let mut data = json!({ "index": index, "total": self.state.tab_count() });
        if let Some(url) = url {
            let info = self
                .engine
                .navigate(page, url, Default::default())
                .await
                .map_err(|e| BrowseError::OpenedTabNavigation {
                    index,
                    source: Box::new(e),
                })?;
            self.state.record(page, &info);
            data["url"] = json!(info.url);
            data["title"] = json!(info.title);
        }
        Ok(data)
    }

    async fn wait(&mut self, wait: WaitFor) -> Result<Value> {
        match wait {
            WaitFor::Duration(ms) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
            WaitFor::Selector {
                selector,
                timeout_ms,
            } => {
                let target = self.target(&selector).await?;
                let scope = self.state.scope()?;
                self.engine
                    .wait_for(scope, &Condition::Element(target), timeout_ms)
                    .await?;
            }
            WaitFor::Text { text, timeout_ms } => {
                let scope = self.state.scope()?;
                self.engine
                    .wait_for(scope, &Condition::Text(text), timeout_ms)
                    .await?;
            }
        }
        Ok(ack(Value::Null))
    }

    async fn snapshot(&mut self, options: SnapshotOptions) -> Result<Value> {
        let scope = self.state.scope()?;
        let doc = self.engine.document(scope).await?;

        let root = match options.selector.as_deref() {
            None => None,
            Some(selector) => match self.refs.lookup(selector) {
                Some(_) => Some(self.refs.resolve(selector, &doc)?),
                None => Some(
                    doc.query_all(doc.root(), selector)
                        .map_err(|e| BrowseError::engine(format!("Invalid selector: {}", e)))?
                        .into_iter()
                        .next()
                        .ok_or_else(|| BrowseError::not_found(selector))?,
                ),
            },
        };

        let snapshot = take_snapshot(&doc, root, &options);
        self.refs = RefMap::from_snapshot(&snapshot);
        tracing::debug!(refs = self.refs.len(), "snapshot taken");
        Ok(snapshot.to_value())
    }

    async fn screenshot(&mut self, options: ScreenshotOptions) -> Result<Value> {
        let target = match options.selector.as_deref() {
            Some(selector) => Some(self.target(selector).await?),
            None => None,
        };
        let scope = self.state.scope()?;
        let bytes = self
            .engine
            .screenshot(scope, target.as_ref(), options.full_page)
            .await?;

        match options.path {
            Some(path) => {
                tokio::fs::write(&path, &bytes).await?;
                Ok(json!({ "path": path }))
            }
            None => Ok(json!({
                "base64": base64::engine::general_purpose::STANDARD.encode(&bytes)
            })),
        }
    }

    async fn cookies(&mut self, op: CookieOp) -> Result<Value> {
        let context = self.state.context()?;
        self.engine.cookies(context, &op).await
    }
}

/// Engine results that are objects pass through; anything else becomes `{}`
fn ack(result: Value) -> Value {
    match result {
        Value::Object(_) => result,
        _ => json!({}),
    }
}

//! State module - tabs, windows and frame context of one session
//!
//! Owned by the daemon's single worker, so nothing here locks. Tabs are an
//! ordered, index-addressed list; the first tab lives in the default
//! browsing context and every `window_new` gets a context of its own.

use std::sync::Arc;

use crate::core::{BrowseError, ContextId, FrameId, PageId, PageInfo, Result, Scope, TabInfo};
use crate::engine::Engine;
use crate::protocol::command::FrameLocator;

/// One open tab
#[derive(Debug, Clone, PartialEq)]
pub struct Tab {
    pub page: PageId,
    pub context: ContextId,
    pub url: String,
    pub title: String,
}

/// Tab list, active index and frame context for one session
pub struct StateManager {
    engine: Arc<dyn Engine>,
    default_context: Option<ContextId>,
    tabs: Vec<Tab>,
    active: usize,
    frame: Option<FrameId>,
}

impl StateManager {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            default_context: None,
            tabs: Vec::new(),
            active: 0,
            frame: None,
        }
    }

    /// Whether a browser is up with at least one tab
    pub fn is_launched(&self) -> bool {
        self.default_context.is_some() && !self.tabs.is_empty()
    }

    /// Start the browser with one blank tab; returns false if already running
    pub async fn launch(&mut self) -> Result<bool> {
        if self.is_launched() {
            return Ok(false);
        }
        self.engine.launch().await?;
        let context = self.engine.new_context().await?;
        let page = self.engine.new_page(context).await?;
        self.default_context = Some(context);
        self.tabs = vec![Tab {
            page,
            context,
            url: "about:blank".to_string(),
            title: String::new(),
        }];
        self.active = 0;
        self.frame = None;
        tracing::info!(engine = self.engine.name(), "browser launched");
        Ok(true)
    }

    pub async fn ensure_launched(&mut self) -> Result<()> {
        self.launch().await.map(|_| ())
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    /// The active tab
    pub fn active(&self) -> Result<&Tab> {
        self.tabs.get(self.active).ok_or(BrowseError::NoBrowser)
    }

    /// Where page commands currently apply
    pub fn scope(&self) -> Result<Scope> {
        Ok(Scope {
            page: self.active()?.page,
            frame: self.frame,
        })
    }

    /// Browsing context of the active tab
    pub fn context(&self) -> Result<ContextId> {
        Ok(self.active()?.context)
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    /// Remember url and title a page reported
    pub fn record(&mut self, page: PageId, info: &PageInfo) {
        if let Some(tab) = self.tabs.iter_mut().find(|t| t.page == page) {
            tab.url = info.url.clone();
            tab.title = info.title.clone();
        }
    }

    /// Open a tab in the default context and make it active
    pub async fn new_tab(&mut self) -> Result<usize> {
        let context = self.default_context.ok_or(BrowseError::NoBrowser)?;
        let page = self.engine.new_page(context).await?;
        Ok(self.push_tab(page, context))
    }

    /// Open a tab in a fresh, isolated context and make it active
    pub async fn new_window(&mut self) -> Result<usize> {
        if self.default_context.is_none() {
            return Err(BrowseError::NoBrowser);
        }
        let context = self.engine.new_context().await?;
        let page = match self.engine.new_page(context).await {
            Ok(page) => page,
            Err(e) => {
                let _ = self.engine.close_context(context).await;
                return Err(e);
            }
        };
        Ok(self.push_tab(page, context))
    }

    fn push_tab(&mut self, page: PageId, context: ContextId) -> usize {
        self.tabs.push(Tab {
            page,
            context,
            url: "about:blank".to_string(),
            title: String::new(),
        });
        self.active = self.tabs.len() - 1;
        self.frame = None;
        self.active
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.tabs.len() {
            Ok(())
        } else {
            Err(BrowseError::InvalidTabIndex {
                index,
                count: self.tabs.len(),
            })
        }
    }

    /// Make a tab active
    pub fn switch_to(&mut self, index: usize) -> Result<&Tab> {
        self.check_index(index)?;
        if index != self.active {
            self.frame = None;
        }
        self.active = index;
        Ok(&self.tabs[index])
    }

    /// Close a tab (default: the active one) and return its index.
    ///
    /// The sole remaining tab cannot be closed. When the active tab goes,
    /// the tab that slides into its index becomes active, or the new last
    /// tab if it was the last.
    pub async fn close_tab(&mut self, index: Option<usize>) -> Result<usize> {
        if self.tabs.is_empty() {
            return Err(BrowseError::NoBrowser);
        }
        let index = index.unwrap_or(self.active);
        self.check_index(index)?;
        if self.tabs.len() == 1 {
            return Err(BrowseError::LastTab);
        }

        let tab = self.tabs[index].clone();
        self.engine.close_page(tab.page).await?;
        self.tabs.remove(index);

        let shared = self.tabs.iter().any(|t| t.context == tab.context);
        if !shared && Some(tab.context) != self.default_context {
            if let Err(e) = self.engine.close_context(tab.context).await {
                tracing::warn!(context = %tab.context, error = %e, "failed to close window context");
            }
        }

        if index < self.active {
            self.active -= 1;
        } else if index == self.active {
            self.active = index.min(self.tabs.len() - 1);
            self.frame = None;
        }
        Ok(index)
    }

    /// Tab metadata in index order, refreshed from the engine where possible
    pub async fn list_tabs(&mut self) -> Vec<TabInfo> {
        for tab in &mut self.tabs {
            if let Ok(info) = self.engine.page_info(tab.page).await {
                tab.url = info.url;
                tab.title = info.title;
            }
        }
        self.tabs
            .iter()
            .enumerate()
            .map(|(index, tab)| TabInfo {
                index,
                url: tab.url.clone(),
                title: tab.title.clone(),
                active: index == self.active,
            })
            .collect()
    }

    /// Target an embedded frame of the active tab
    pub async fn switch_to_frame(&mut self, locator: &FrameLocator) -> Result<FrameId> {
        let page = self.active()?.page;
        let frame = self.engine.find_frame(page, locator).await?;
        self.frame = Some(frame);
        Ok(frame)
    }

    /// Target the main frame of the active tab again
    pub fn switch_to_main_frame(&mut self) {
        self.frame = None;
    }

    /// Tear down the browser and forget all tabs
    pub async fn close_all(&mut self) -> Result<()> {
        let launched = self.default_context.is_some();
        self.tabs.clear();
        self.active = 0;
        self.frame = None;
        self.default_context = None;
        if launched {
            self.engine.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::protocol::command::WaitUntil;

    async fn launched() -> (MemoryEngine, StateManager) {
        let engine = MemoryEngine::new();
        let mut state = StateManager::new(Arc::new(engine.clone()));
        assert!(state.launch().await.unwrap());
        (engine, state)
    }

    #[tokio::test]
    async fn test_launch_is_idempotent() {
        let (engine, mut state) = launched().await;
        assert!(!state.launch().await.unwrap());
        assert_eq!(state.tab_count(), 1);
        assert_eq!(engine.page_count().await, 1);
    }

    #[tokio::test]
    async fn test_unlaunched_has_no_scope() {
        let state = StateManager::new(Arc::new(MemoryEngine::new()));
        assert!(matches!(state.scope(), Err(BrowseError::NoBrowser)));
    }

    #[tokio::test]
    async fn test_close_last_tab_rejected() {
        let (_, mut state) = launched().await;
        let before = state.list_tabs().await;
        assert!(matches!(state.close_tab(None).await, Err(BrowseError::LastTab)));
        assert_eq!(state.list_tabs().await, before);
    }

    #[tokio::test]
    async fn test_close_active_reclamps() {
        let (_, mut state) = launched().await;
        state.new_tab().await.unwrap();
        state.new_tab().await.unwrap();
        assert_eq!(state.active_index(), 2);

        // Closing the last, active tab moves to the new last tab
        assert_eq!(state.close_tab(None).await.unwrap(), 2);
        assert_eq!(state.active_index(), 1);

        // Closing the active tab in the middle activates its successor
        state.new_tab().await.unwrap();
        state.switch_to(1).unwrap();
        let successor = state.tabs[2].page;
        state.close_tab(Some(1)).await.unwrap();
        assert_eq!(state.active_index(), 1);
        assert_eq!(state.active().unwrap().page, successor);

        // Closing before the active tab shifts the index down
        state.close_tab(Some(0)).await.unwrap();
        assert_eq!(state.active_index(), 0);
        assert_eq!(state.tab_count(), 1);
    }

    #[tokio::test]
    async fn test_switch_bounds() {
        let (_, mut state) = launched().await;
        let err = state.switch_to(3).unwrap_err();
        assert!(matches!(err, BrowseError::InvalidTabIndex { index: 3, count: 1 }));
        assert!(matches!(
            state.close_tab(Some(5)).await,
            Err(BrowseError::InvalidTabIndex { .. })
        ));
    }

    #[tokio::test]
    async fn test_window_gets_own_context() {
        let (engine, mut state) = launched().await;
        let first = state.context().unwrap();
        let index = state.new_window().await.unwrap();
        assert_eq!(index, 1);
        assert_ne!(state.context().unwrap(), first);

        state.close_tab(None).await.unwrap();
        assert_eq!(state.context().unwrap(), first);
        assert_eq!(engine.page_count().await, 1);
    }

    #[tokio::test]
    async fn test_frames_reset_on_switch() {
        let (engine, mut state) = launched().await;
        let page = state.active().unwrap().page;
        engine
            .navigate(page, "https://example.test/checkout", WaitUntil::Load)
            .await
            .unwrap();

        let frame = state
            .switch_to_frame(&FrameLocator::Name("payment".into()))
            .await
            .unwrap();
        assert_eq!(state.scope().unwrap().frame, Some(frame));

        state.new_tab().await.unwrap();
        assert_eq!(state.frame(), None);
        state.switch_to(0).unwrap();
        assert_eq!(state.frame(), None);
    }

    #[tokio::test]
    async fn test_list_tabs_refreshes() {
        let (engine, mut state) = launched().await;
        let page = state.active().unwrap().page;
        engine
            .navigate(page, "https://example.test/", WaitUntil::Load)
            .await
            .unwrap();
        let tabs = state.list_tabs().await;
        assert_eq!(tabs[0].title, "Example");
        assert!(tabs[0].active);
    }
}

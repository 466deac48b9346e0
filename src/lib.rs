//! browsectl - session daemon for driving a browser from agents and scripts
//!
//! Clients send length-prefixed JSON commands to a per-session daemon,
//! which keeps the browser state alive between invocations and answers
//! with compact accessibility snapshots whose elements carry short refs
//! (`e1`, `e2`, ...) usable as selectors in later commands.
//!
//! # Architecture
//!
//! - **Core**: Shared types, configuration, and error handling
//! - **Protocol**: Frame codec and command schema validation
//! - **Dom / Snapshot**: Document model and the ref snapshot engine
//! - **Engine**: Automation engine boundary and the in-memory engine
//! - **State / Executor**: Browser state and command execution
//! - **Session / Daemon**: Endpoint resolution and the daemon lifecycle
//! - **Bridge**: Request/response correlation with an external host
//!
//! # Usage
//!
//! ```rust,no_run
//! use browsectl::{Client, Config, Registry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> browsectl::Result<()> {
//!     let registry = Registry::new(Config::load());
//!     let endpoint = registry.ensure_running("default").await?;
//!     let mut client = Client::connect(&endpoint).await?;
//!
//!     let response = client.request("navigate", json!({"url": "https://example.com"})).await?;
//!     println!("{:?}", response.data);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod core;
pub mod daemon;
pub mod dom;
pub mod engine;
pub mod executor;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod state;

// Re-export commonly used items
pub use client::Client;
pub use core::{BrowseError, Config, Response, Result};
pub use daemon::Daemon;
pub use engine::{Engine, MemoryEngine};
pub use executor::Executor;
pub use session::{Endpoint, Registry};

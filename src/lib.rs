//! # Engine Bridge
//!
//! Drives an embedded JavaScript engine (QuickJS through `rquickjs`) from a
//! remote process over a synchronous, textual request/response channel.
//!
//! ## Features
//!
//! - **Single engine owner**: one worker thread owns the runtime; every
//!   request is a task queued onto it
//! - **Handles**: the remote party references live engine values by id
//! - **Tagged wire values**: scalars by value, composites and domain
//!   objects by tag plus value or handle id
//! - **Remote callbacks**: engine code can call a function only the remote
//!   party can run, and the remote party may make nested requests before
//!   answering
//!
//! ### Example
//!
//! ```no_run
//! use engine_bridge::{BridgeConfig, BridgeServer};
//! use serde_json::json;
//!
//! let server = BridgeServer::new(BridgeConfig::default()).unwrap();
//! let session = server.handle("/create_session", json!({})).unwrap();
//! let id = session["result"].as_u64().unwrap();
//! let value = server
//!     .handle("/get_property", json!({ "sessionId": id, "id": id, "name": "Math" }))
//!     .unwrap();
//! println!("{value}");
//! server.stop();
//! ```
//!
//! ## Modules
//!
//! - [`core`]: errors and logging
//! - [`config`]: configuration loading
//! - [`domain`]: domain object kinds and row schemas
//! - [`bindings`]: wire protocol and value marshalling
//! - [`scripting`]: engine worker, handles and callbacks
//! - [`server`]: request routing

/// Error types and logging initialisation
pub mod core;
/// Configuration system
pub mod config;
/// Domain object kinds and row schemas
pub mod domain;
/// Wire protocol and value marshalling
pub mod bindings;
/// Engine worker, handle table and callback bridge
pub mod scripting;
/// Request routing
pub mod server;

pub use crate::bindings::WireValue;
pub use crate::config::BridgeConfig;
pub use crate::core::error::{BridgeError, BridgeResult, WireError, WorkerError};
pub use crate::server::BridgeServer;

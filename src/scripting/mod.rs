//! 脚本引擎宿主
//!
//! - `worker` - 独占引擎的工作线程和任务队列
//! - `engine` - 工作线程上的引擎作用域（句柄、回调代理、会话）
//! - `callback` - 远端回调的同步调用桥
//! - `handles` - 句柄表

pub mod callback;
pub mod engine;
pub mod handles;
pub mod worker;

pub use callback::{CallbackBridge, PendingCallback};
pub use engine::{EngineScope, SessionSlot};
pub use handles::{HandleTable, FETCH_CALLBACK_ID};
pub use worker::{Task, WorkItem, Worker, WorkerQueue};

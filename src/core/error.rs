//! 统一错误处理模块
//!
//! 提供桥接层范围内的统一错误类型定义
//!
//! ## 错误类型分层
//!
//! - **协议层错误** (`BridgeError`): 会话校验、未知请求、请求格式
//! - **编码层错误** (`WireError`): 线上标签无法识别、值无法编码
//! - **工作线程错误** (`WorkerError`): 引擎线程启动失败或已停止
//!
//! 脚本异常不会作为通道级错误返回，而是在请求内部被捕获并序列化为数据。

use thiserror::Error;

use crate::config::ConfigError;

/// 桥接层顶层错误类型
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid session ID")]
    InvalidSession,

    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Method '{name}' is not a function on handle {id}")]
    MissingMethod { id: u64, name: String },

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Script error: {0}")]
    Script(#[from] rquickjs::Error),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// 是否为脚本抛出的异常（异常值仍挂在引擎上下文中，需要 `Ctx::catch` 取出）
    pub fn is_script_exception(&self) -> bool {
        matches!(self, BridgeError::Script(rquickjs::Error::Exception))
    }
}

/// 线上编码错误
///
/// 这些错误表示桥接层自身的缺陷，而不是远端可以恢复的情况；
/// 它们会让当前任务失败，并以内部错误的形式返回给远端。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error("unrecognized wire tag `{0}`")]
    UnknownTag(String),

    #[error("malformed `{tag}` wire value: {reason}")]
    Malformed { tag: String, reason: String },

    #[error("engine value of type `{0}` has no wire encoding")]
    Unencodable(String),

    #[error("invalid base64 payload: {0}")]
    Base64(String),
}

impl WireError {
    pub fn malformed(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        WireError::Malformed {
            tag: tag.into(),
            reason: reason.into(),
        }
    }
}

/// 引擎工作线程错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Failed to start engine worker: {0}")]
    Startup(String),

    #[error("Engine worker stopped before the task completed")]
    Stopped,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
pub type WireResult<T> = Result<T, WireError>;

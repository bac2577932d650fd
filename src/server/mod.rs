//! 桥接服务
//!
//! 对外的唯一入口：按请求名分发，把处理函数排队到引擎工作线程上执行。
//!
//! ## 架构设计
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              BridgeServer::handle            │
//! ├──────────────────────────────────────────────┤
//! │   会话校验（除 /create_session 外的所有请求） │
//! │                      │                       │
//! │        ┌─────────────┴──────────────┐        │
//! │        │                            │        │
//! │  ┌─────▼──────┐            ┌────────▼──────┐ │
//! │  │ 回调通道    │            │ 请求表         │ │
//! │  │ (不加锁)    │            │ (请求互斥锁)   │ │
//! │  └─────┬──────┘            └────────┬──────┘ │
//! │        │                            │        │
//! │  ┌─────▼──────┐            ┌────────▼──────┐ │
//! │  │ 回调桥      │◄──────────►│ 工作线程       │ │
//! │  └────────────┘            └───────────────┘ │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! 回调结果和回调轮询不经过请求互斥锁：它们必须能在顶层请求的任务
//! 仍阻塞在回调等待中时送达。

pub mod requests;

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value as Json};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::core::error::{BridgeError, BridgeResult, WorkerError};
use crate::scripting::callback::CallbackBridge;
use crate::scripting::engine::SessionSlot;
use crate::scripting::worker::Worker;

pub use requests::{names, RequestHandler, RequestTable};

/// 会话校验失败时的响应
pub fn invalid_session_response() -> Json {
    json!({ "error": BridgeError::InvalidSession.to_string() })
}

pub struct BridgeServer {
    worker: Worker,
    bridge: Arc<CallbackBridge>,
    session: Arc<SessionSlot>,
    requests: RequestTable,
    /// 顶层请求互斥锁
    request_lock: Mutex<()>,
}

impl BridgeServer {
    /// 启动引擎工作线程并创建服务
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        Self::with_requests(config, RequestTable::standard())
    }

    pub fn with_requests(config: BridgeConfig, requests: RequestTable) -> BridgeResult<Self> {
        config.validate()?;

        let bridge = Arc::new(CallbackBridge::new());
        let session = Arc::new(SessionSlot::default());
        let worker = Worker::spawn(&config, Arc::clone(&bridge), Arc::clone(&session))?;
        info!(target: "bridge::server", "Bridge server ready");

        Ok(Self {
            worker,
            bridge,
            session,
            requests,
            request_lock: Mutex::new(()),
        })
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.get()
    }

    /// 处理一个请求
    ///
    /// 脚本异常和会话校验失败都作为数据返回；只有未知请求名和工作线程
    /// 已停止会以 `Err` 返回。
    pub fn handle(&self, name: &str, args: Json) -> BridgeResult<Json> {
        debug!(target: "bridge::server", request = name, "Handling request");

        if name != names::CREATE_SESSION {
            let presented = args.get("sessionId").and_then(Json::as_u64);
            if !self.session.matches(presented) {
                debug!(target: "bridge::server", request = name, ?presented, "Invalid session");
                return Ok(invalid_session_response());
            }
        }

        match name {
            names::CALLBACK_RESULT => self.callback_result(&args),
            names::CALLBACK_POLL_RESULT => Ok(self.callback_poll_result(&args)),
            names::CALLBACKS_POLL => Ok(self.poll_callback()),
            _ => {
                let handler = self
                    .requests
                    .get(name)
                    .ok_or_else(|| BridgeError::UnknownRequest(name.to_string()))?;
                let _guard = self
                    .request_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                self.worker
                    .submit(move |ctx, scope| {
                        handler(ctx, scope, &args).unwrap_or_else(|err| scope.error_response(ctx, err))
                    })
                    .map_err(BridgeError::from)
            }
        }
    }

    /// 解析 JSON 参数并处理请求，返回序列化后的响应
    ///
    /// 参数无法解析时返回错误响应而不是失败。
    pub fn perform_request(&self, name: &str, args: &str) -> BridgeResult<String> {
        let args = if args.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(args) {
                Ok(args) => args,
                Err(err) => {
                    return Ok(json!({ "error": BridgeError::from(err).to_string() }).to_string());
                }
            }
        };
        self.handle(name, args).map(|response| response.to_string())
    }

    /// 投递回调结果并等待工作线程的下一个结果
    ///
    /// 没有匹配的待决回调时立即返回 `{}`。
    fn callback_result(&self, args: &Json) -> BridgeResult<Json> {
        let queue = self.worker.queue();
        let (slot, receiver) = queue.await_next_result();

        if !self.bridge.resolve(args) {
            queue.remove_slot(slot);
            return Ok(json!({}));
        }
        queue.wake();

        receiver
            .recv()
            .map_err(|_| BridgeError::Worker(WorkerError::Stopped))
    }

    /// 投递回调结果并立即返回下一条待轮询的回调消息
    fn callback_poll_result(&self, args: &Json) -> Json {
        if self.bridge.resolve(args) {
            self.worker.queue().wake();
        }
        self.poll_callback()
    }

    fn poll_callback(&self) -> Json {
        self.worker
            .queue()
            .try_pop_callback()
            .unwrap_or_else(|| json!({}))
    }

    /// 停止引擎工作线程；等待中的回调以 `undefined` 结束
    pub fn stop(&self) {
        self.worker.stop();
    }
}

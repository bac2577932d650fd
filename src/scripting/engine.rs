//! 引擎作用域
//!
//! 工作线程上的全部引擎侧状态：句柄表、回调代理注册表、会话根对象和
//! 前置脚本的辅助对象。它只存在于工作线程上（`Rc`，非 `Send`）；
//! 请求线程只能通过 [`SessionSlot`] 和 [`CallbackBridge`] 观察它。

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Function, Object, Persistent, Value};
use serde_json::{json, Value as Json};
use tracing::{debug, info};

use crate::bindings::js::{Marshaller, Prelude};
use crate::bindings::protocol::WireValue;
use crate::config::{BridgeConfig, ConfigError};
use crate::core::error::{BridgeError, BridgeResult};
use crate::scripting::callback::{self, CallbackBridge};
use crate::scripting::handles::{HandleTable, FETCH_CALLBACK_ID};
use crate::scripting::worker::WorkerQueue;

/// 当前会话根对象的句柄，0 表示尚未创建会话
#[derive(Debug, Default)]
pub struct SessionSlot(AtomicU64);

impl SessionSlot {
    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set(&self, id: u64) {
        self.0.store(id, Ordering::SeqCst);
    }

    /// 请求中携带的会话编号是否与当前会话一致
    pub fn matches(&self, id: Option<u64>) -> bool {
        matches!((self.get(), id), (Some(current), Some(id)) if current == id)
    }
}

pub struct EngineScope {
    this: Weak<EngineScope>,
    queue: Arc<WorkerQueue>,
    bridge: Arc<CallbackBridge>,
    session: Arc<SessionSlot>,
    config: BridgeConfig,
    prelude: Persistent<Object<'static>>,
    handles: RefCell<HandleTable<Persistent<Value<'static>>>>,
    callbacks: RefCell<HashMap<u64, Persistent<Function<'static>>>>,
    collect_requested: Cell<bool>,
}

impl EngineScope {
    /// 在上下文中安装前置脚本并创建作用域
    pub fn install(
        ctx: &Ctx<'_>,
        queue: Arc<WorkerQueue>,
        bridge: Arc<CallbackBridge>,
        session: Arc<SessionSlot>,
        config: BridgeConfig,
    ) -> BridgeResult<Rc<Self>> {
        let prelude = Prelude::install(ctx)?;
        let prelude = Persistent::save(ctx, prelude.object().clone());
        if let Some(path) = config.session.init_script.as_deref() {
            run_init_script(ctx, path)?;
        }

        Ok(Rc::new_cyclic(|this| Self {
            this: this.clone(),
            queue,
            bridge,
            session,
            config,
            prelude,
            handles: RefCell::new(HandleTable::new()),
            callbacks: RefCell::new(HashMap::new()),
            collect_requested: Cell::new(false),
        }))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn queue(&self) -> &WorkerQueue {
        &self.queue
    }

    pub fn bridge(&self) -> &CallbackBridge {
        &self.bridge
    }

    pub fn prelude<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Prelude<'js>> {
        self.prelude.clone().restore(ctx).map(Prelude::from_object)
    }

    pub fn marshaller<'a, 'js>(&'a self, ctx: &Ctx<'js>) -> rquickjs::Result<Marshaller<'a, 'js>> {
        Ok(Marshaller::new(ctx, self, self.prelude(ctx)?))
    }

    /// 保留一个引擎值并返回句柄编号
    pub fn store<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> u64 {
        let value = Persistent::save(ctx, value);
        self.handles.borrow_mut().store(value)
    }

    /// 解析句柄；已释放或已重置的句柄返回 `None`
    pub fn resolve<'js>(&self, ctx: &Ctx<'js>, id: u64) -> rquickjs::Result<Option<Value<'js>>> {
        let value = self.handles.borrow().resolve(id).cloned();
        value.map(|value| value.restore(ctx)).transpose()
    }

    pub fn release(&self, id: u64) -> bool {
        self.handles.borrow_mut().release(id).is_some()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.borrow().len()
    }

    /// 返回回调编号对应的代理函数，不存在时创建
    ///
    /// 代理在被引擎调用时经由回调桥请求远端执行。创建之后发生过重置的
    /// 代理（fetch 回调除外）直接返回 `undefined`。
    pub fn callback_proxy<'js>(&self, ctx: &Ctx<'js>, id: u64) -> rquickjs::Result<Function<'js>> {
        let existing = self.callbacks.borrow().get(&id).cloned();
        if let Some(existing) = existing {
            return existing.restore(ctx);
        }

        let scope = self.this.clone();
        let generation = self.bridge.generation();
        let proxy = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, this: This<Value<'js>>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                let Some(scope) = scope.upgrade() else {
                    return Ok(Value::new_undefined(ctx));
                };
                if id != FETCH_CALLBACK_ID && scope.bridge.generation() != generation {
                    debug!(target: "bridge::callback", callback = id, "Stale callback proxy invoked");
                    return Ok(Value::new_undefined(ctx));
                }
                callback::invoke(&ctx, &scope, id, this.0, args.0)
            },
        )?;

        self.prelude(ctx)?.mark_callback(&proxy, id)?;
        self.callbacks
            .borrow_mut()
            .insert(id, Persistent::save(ctx, proxy.clone()));
        Ok(proxy)
    }

    /// 会话根对象：全局对象，或配置指定的全局变量
    pub fn session_root<'js>(&self, ctx: &Ctx<'js>) -> BridgeResult<Object<'js>> {
        let globals = ctx.globals();
        match self.config.session.root_global.as_deref() {
            None => Ok(globals),
            Some(name) => globals.get::<_, Object>(name).map_err(|err| {
                if matches!(err, rquickjs::Error::Exception) {
                    let _ = ctx.catch();
                }
                BridgeError::MalformedRequest(format!("session root global `{name}` is not an object"))
            }),
        }
    }

    /// 创建会话：保留根对象并安装远端 fetch 回调
    pub fn create_session<'js>(&self, ctx: &Ctx<'js>, fetch: Option<&Json>) -> BridgeResult<u64> {
        let root = self.session_root(ctx)?;

        if let Some(fetch) = fetch.filter(|fetch| !fetch.is_null()) {
            let fetch = match WireValue::from_json(fetch)? {
                WireValue::Callback(id) if id == FETCH_CALLBACK_ID => self.callback_proxy(ctx, id)?,
                other => {
                    return Err(BridgeError::MalformedRequest(format!(
                        "fetch must be callback {FETCH_CALLBACK_ID}, got {}",
                        other.to_json()
                    )))
                }
            };
            ctx.globals()
                .set(self.config.session.fetch_global.as_str(), fetch)?;
        }

        let id = self.store(ctx, root.into_value());
        self.session.set(id);
        info!(target: "bridge::session", session = id, "Session created");
        Ok(id)
    }

    /// 清空测试状态
    ///
    /// 保留会话根对象和 fetch 回调，推进代数使所有等待中的回调返回
    /// `undefined`，并请求工作线程在离开引擎作用域后执行垃圾回收。
    pub fn reset(&self) {
        let keep: Vec<u64> = self.session.get().into_iter().collect();
        self.handles.borrow_mut().retain_only(&keep);
        self.callbacks
            .borrow_mut()
            .retain(|id, _| *id == FETCH_CALLBACK_ID);

        let generation = self.bridge.advance_generation();
        self.queue.wake();
        self.collect_requested.set(true);
        info!(target: "bridge::session", generation, "Test state cleared");
    }

    pub fn take_collect_request(&self) -> bool {
        self.collect_requested.replace(false)
    }

    /// 释放全部持久值，必须在运行时销毁之前调用
    pub fn shutdown(&self) {
        self.handles.borrow_mut().clear();
        self.callbacks.borrow_mut().clear();
    }

    /// 把请求处理失败转换为返回给远端的错误数据
    ///
    /// 脚本异常被取出并编码；其他失败只返回错误文本。
    pub fn error_response<'js>(&self, ctx: &Ctx<'js>, err: BridgeError) -> Json {
        if !err.is_script_exception() {
            return json!({ "error": err.to_string() });
        }

        let exception = ctx.catch();
        let message = exception_message(&exception);
        debug!(target: "bridge::server", %message, "Script exception");

        match self.marshaller(ctx).map_err(BridgeError::from).and_then(|m| m.encode(exception)) {
            Ok(encoded) => json!({ "error": encoded.to_json(), "message": message }),
            Err(encode_err) => {
                if encode_err.is_script_exception() {
                    let _ = ctx.catch();
                }
                json!({ "error": message })
            }
        }
    }
}

/// 执行宿主初始化脚本；脚本异常转换为带文件名的配置错误
fn run_init_script(ctx: &Ctx<'_>, path: &Path) -> BridgeResult<()> {
    let source = fs::read_to_string(path)?;
    match ctx.eval::<(), _>(source) {
        Ok(()) => {
            info!(target: "bridge::session", path = %path.display(), "Init script evaluated");
            Ok(())
        }
        Err(rquickjs::Error::Exception) => {
            let message = exception_message(&ctx.catch());
            Err(ConfigError::ValidationError(format!(
                "session.init_script {} threw: {message}",
                path.display()
            ))
            .into())
        }
        Err(err) => Err(err.into()),
    }
}

/// 异常的消息文本：`Error` 取 `message`，其他值转为字符串
fn exception_message(exception: &Value<'_>) -> String {
    if let Some(object) = exception.as_object() {
        if let Ok(message) = object.get::<_, String>("message") {
            return message;
        }
    }
    if let Some(text) = exception.as_string().and_then(|text| text.to_string().ok()) {
        return text;
    }
    if let Some(n) = exception.as_int() {
        return n.to_string();
    }
    if let Some(n) = exception.as_float() {
        return n.to_string();
    }
    "Uncaught exception".to_string()
}

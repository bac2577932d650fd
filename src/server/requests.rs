//! 请求处理函数表
//!
//! 每个处理函数都在工作线程上执行，返回值是完整的响应对象
//! （`{"result": ...}` 或 `{}`）。失败由调用方统一转换为错误响应。

use std::collections::HashMap;

use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::bindings::protocol::WireValue;
use crate::core::error::{BridgeError, BridgeResult};
use crate::scripting::engine::EngineScope;

/// 请求名常量
pub mod names {
    pub const CREATE_SESSION: &str = "/create_session";
    pub const CREATE_INSTANCE: &str = "/create_instance";
    pub const CALL_METHOD: &str = "/call_method";
    pub const GET_PROPERTY: &str = "/get_property";
    pub const SET_PROPERTY: &str = "/set_property";
    pub const GET_OBJECT: &str = "/get_object";
    pub const DISPOSE_OBJECT: &str = "/dispose_object";
    pub const CLEAR_TEST_STATE: &str = "/clear_test_state";
    pub const CALLBACK_RESULT: &str = "/callback_result";
    pub const CALLBACK_POLL_RESULT: &str = "/callback_poll_result";
    pub const CALLBACKS_POLL: &str = "/callbacks_poll";
}

/// 请求处理函数
pub type RequestHandler = for<'js> fn(&Ctx<'js>, &EngineScope, &Json) -> BridgeResult<Json>;

/// 请求名到处理函数的映射
#[derive(Clone)]
pub struct RequestTable {
    handlers: HashMap<&'static str, RequestHandler>,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl RequestTable {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 标准请求集合
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(names::CREATE_SESSION, create_session);
        table.register(names::CREATE_INSTANCE, create_instance);
        table.register(names::CALL_METHOD, call_method);
        table.register(names::GET_PROPERTY, get_property);
        table.register(names::SET_PROPERTY, set_property);
        table.register(names::GET_OBJECT, get_object);
        table.register(names::DISPOSE_OBJECT, dispose_object);
        table.register(names::CLEAR_TEST_STATE, clear_test_state);
        table
    }

    pub fn register(&mut self, name: &'static str, handler: RequestHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<RequestHandler> {
        self.handlers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

fn result<'js>(scope: &EngineScope, ctx: &Ctx<'js>, value: Value<'js>) -> BridgeResult<Json> {
    let wire = scope.marshaller(ctx)?.encode(value)?;
    Ok(json!({ "result": wire.to_json() }))
}

fn null_result() -> Json {
    json!({ "result": WireValue::Null.to_json() })
}

fn handle_id(args: &Json) -> BridgeResult<u64> {
    args.get("id")
        .and_then(Json::as_u64)
        .ok_or_else(|| BridgeError::MalformedRequest("missing handle `id`".to_string()))
}

fn string_field<'a>(args: &'a Json, field: &str) -> BridgeResult<&'a str> {
    args.get(field)
        .and_then(Json::as_str)
        .ok_or_else(|| BridgeError::MalformedRequest(format!("missing string `{field}`")))
}

/// 解析句柄对应的对象；句柄已失效时返回 `None`
fn resolve_object<'js>(ctx: &Ctx<'js>, scope: &EngineScope, id: u64) -> BridgeResult<Option<Object<'js>>> {
    match scope.resolve(ctx, id)? {
        Some(value) => match value.into_object() {
            Some(object) => Ok(Some(object)),
            None => Err(BridgeError::MalformedRequest(format!("handle {id} is not an object"))),
        },
        None => {
            debug!(target: "bridge::server", id, "Request on stale handle");
            Ok(None)
        }
    }
}

/// 属性名既可以是字符串也可以是数字下标
fn read_property<'js>(object: &Object<'js>, name: &Json) -> BridgeResult<Value<'js>> {
    match name {
        Json::String(name) => Ok(object.get(name.as_str())?),
        Json::Number(n) => {
            let index = n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| BridgeError::MalformedRequest(format!("invalid property index {n}")))?;
            Ok(object.get(index)?)
        }
        other => Err(BridgeError::MalformedRequest(format!("invalid property name {other}"))),
    }
}

fn write_property<'js>(object: &Object<'js>, name: &Json, value: Value<'js>) -> BridgeResult<()> {
    match name {
        Json::String(name) => Ok(object.set(name.as_str(), value)?),
        Json::Number(n) => {
            let index = n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| BridgeError::MalformedRequest(format!("invalid property index {n}")))?;
            Ok(object.set(index, value)?)
        }
        other => Err(BridgeError::MalformedRequest(format!("invalid property name {other}"))),
    }
}

fn create_session<'js>(ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let id = scope.create_session(ctx, args.get("fetch"))?;
    Ok(json!({ "result": id }))
}

fn create_instance<'js>(ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let name = string_field(args, "name")?;
    let root = scope.session_root(ctx)?;
    let constructor: Function = root
        .get(name)
        .map_err(|_| BridgeError::MalformedRequest(format!("`{name}` is not a constructor")))?;

    let marshaller = scope.marshaller(ctx)?;
    let arguments = marshaller.decode_arguments(args.get("arguments"))?;
    let instance = marshaller.prelude().construct(constructor, arguments)?;
    result(scope, ctx, instance)
}

fn call_method<'js>(ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let id = handle_id(args)?;
    let name = string_field(args, "name")?;
    let Some(object) = resolve_object(ctx, scope, id)? else {
        return Ok(null_result());
    };

    let method: Value = object.get(name)?;
    let Some(method) = method.into_function() else {
        return Err(BridgeError::MissingMethod {
            id,
            name: name.to_string(),
        });
    };

    let arguments = scope.marshaller(ctx)?.decode_arguments(args.get("arguments"))?;
    let value: Value = method.call((This(object), Rest(arguments)))?;
    result(scope, ctx, value)
}

fn get_property<'js>(ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let id = handle_id(args)?;
    let name = args
        .get("name")
        .ok_or_else(|| BridgeError::MalformedRequest("missing property `name`".to_string()))?;
    let Some(object) = resolve_object(ctx, scope, id)? else {
        return Ok(null_result());
    };
    let value = read_property(&object, name)?;
    result(scope, ctx, value)
}

fn set_property<'js>(ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let id = handle_id(args)?;
    let name = args
        .get("name")
        .ok_or_else(|| BridgeError::MalformedRequest("missing property `name`".to_string()))?;
    let Some(object) = resolve_object(ctx, scope, id)? else {
        return Ok(json!({}));
    };
    let value = match args.get("value") {
        Some(value) => scope.marshaller(ctx)?.decode_json(value)?,
        None => Value::new_undefined(ctx.clone()),
    };
    write_property(&object, name, value)?;
    Ok(json!({}))
}

/// 行对象的快照缓存加上指定属性的完整编码
///
/// 指定属性已在缓存中时不再读取；非行对象只返回指定属性。
fn get_object<'js>(ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let id = handle_id(args)?;
    let Some(object) = resolve_object(ctx, scope, id)? else {
        return Ok(null_result());
    };

    let marshaller = scope.marshaller(ctx)?;
    let mut fields = serde_json::Map::new();
    if let Some(cache) = marshaller.row_cache(&object.clone().into_value())? {
        for (key, value) in cache {
            fields.insert(key, value.to_json());
        }
    }

    if let Some(name) = args.get("name").filter(|name| !name.is_null()) {
        let key = match name {
            Json::String(name) => name.clone(),
            other => other.to_string(),
        };
        if !fields.contains_key(&key) {
            let value = read_property(&object, name)?;
            fields.insert(key, marshaller.encode(value)?.to_json());
        }
    }

    Ok(json!({ "result": fields }))
}

fn dispose_object<'js>(_ctx: &Ctx<'js>, scope: &EngineScope, args: &Json) -> BridgeResult<Json> {
    let id = handle_id(args)?;
    if !scope.release(id) {
        debug!(target: "bridge::server", id, "Disposed an unknown handle");
    }
    Ok(json!({}))
}

fn clear_test_state<'js>(_ctx: &Ctx<'js>, scope: &EngineScope, _args: &Json) -> BridgeResult<Json> {
    scope.reset();
    Ok(json!({}))
}

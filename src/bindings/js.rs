//! JavaScript side of the value binding, on top of rquickjs
//!
//! The [`Marshaller`] converts between engine values and [`WireValue`].
//! Classification and the few constructions that are awkward from Rust
//! (typed arrays, dates, errors with a foreign stack) are done by the
//! helpers in `prelude.js`, installed once per context as the frozen
//! global `__engineBridge`.

use std::collections::BTreeMap;

use rquickjs::{Array, Ctx, Function, IntoJs, Object, Value};
use serde_json::Value as Json;
use tracing::debug;

use crate::bindings::protocol::{DictKey, HandleMeta, HandleRef, WireValue};
use crate::config::MarshalConfig;
use crate::core::error::{BridgeResult, WireError};
use crate::domain::schema::{build_cache, CollectionType, FieldSnapshot, PropertySchema, PropertyType, RowSchema};
use crate::domain::{ObjectKind, COLLECTION_TYPE_SYMBOL, KIND_SYMBOL, SCHEMA_SYMBOL};
use crate::scripting::engine::EngineScope;

/// Source of the installer function evaluated at start-up.
pub const PRELUDE_SOURCE: &str = include_str!("prelude.js");
/// Global name the helper object is installed under.
pub const PRELUDE_GLOBAL: &str = "__engineBridge";

/// Typed access to the `__engineBridge` helpers.
#[derive(Clone)]
pub struct Prelude<'js>(Object<'js>);

impl<'js> Prelude<'js> {
    /// Evaluates the prelude in `ctx` and returns the installed helper object.
    pub fn install(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let names = Object::new(ctx.clone())?;
        names.set("kind", KIND_SYMBOL)?;
        names.set("schema", SCHEMA_SYMBOL)?;
        names.set("type", COLLECTION_TYPE_SYMBOL)?;
        names.set("global", PRELUDE_GLOBAL)?;

        let installer: Function = ctx.eval(PRELUDE_SOURCE)?;
        installer.call::<_, Object>((names,)).map(Prelude)
    }

    pub fn from_object(object: Object<'js>) -> Self {
        Prelude(object)
    }

    pub fn object(&self) -> &Object<'js> {
        &self.0
    }

    fn helper(&self, name: &str) -> rquickjs::Result<Function<'js>> {
        self.0.get(name)
    }

    /// Classification tag: a JS `typeof` result, `array`, `data`, `date`,
    /// `error`, `dict`, `global`, `callback`, or `domain:<tag>` for marked objects.
    pub fn kind_of(&self, value: &Value<'js>) -> rquickjs::Result<String> {
        self.helper("kindOf")?.call((value.clone(),))
    }

    pub fn schema_of(&self, value: &Value<'js>) -> rquickjs::Result<Option<String>> {
        self.helper("schemaJsonOf")?.call((value.clone(),))
    }

    pub fn collection_type_of(&self, value: &Value<'js>) -> rquickjs::Result<Option<String>> {
        self.helper("collectionTypeJsonOf")?.call((value.clone(),))
    }

    pub fn is_valid(&self, value: &Value<'js>) -> rquickjs::Result<bool> {
        self.helper("isValid")?.call((value.clone(),))
    }

    pub fn bytes_of(&self, value: &Value<'js>) -> rquickjs::Result<Vec<u8>> {
        let bytes: Vec<i32> = self.helper("bytesOf")?.call((value.clone(),))?;
        Ok(bytes.into_iter().map(|byte| byte as u8).collect())
    }

    pub fn make_bytes(&self, bytes: &[u8]) -> rquickjs::Result<Value<'js>> {
        let bytes: Vec<i32> = bytes.iter().map(|byte| i32::from(*byte)).collect();
        self.helper("makeBytes")?.call((bytes,))
    }

    pub fn time_of(&self, value: &Value<'js>) -> rquickjs::Result<f64> {
        self.helper("timeOf")?.call((value.clone(),))
    }

    pub fn make_date(&self, ms: f64) -> rquickjs::Result<Value<'js>> {
        self.helper("makeDate")?.call((ms,))
    }

    pub fn text_of(&self, value: &Value<'js>) -> rquickjs::Result<String> {
        self.helper("textOf")?.call((value.clone(),))
    }

    /// Builds an `Error`; `stack` is JSON-parsed when possible and attached as-is otherwise.
    pub fn make_error(&self, message: &str, stack: Option<&str>) -> rquickjs::Result<Value<'js>> {
        self.helper("makeError")?.call((message, stack))
    }

    pub fn construct(&self, target: Function<'js>, args: Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> {
        self.helper("construct")?.call((target, args))
    }

    pub fn mark_callback(&self, function: &Function<'js>, id: u64) -> rquickjs::Result<()> {
        self.helper("markCallback")?.call((function.clone(), id as f64))
    }

    pub fn callback_id_of(&self, value: &Value<'js>) -> rquickjs::Result<Option<u64>> {
        let id: Option<f64> = self.helper("callbackIdOf")?.call((value.clone(),))?;
        Ok(id.map(|id| id as u64))
    }
}

/// Converts engine values to wire values and back.
///
/// Only ever constructed inside a worker task: it borrows the engine scope
/// that owns the handle table and callback registry.
pub struct Marshaller<'a, 'js> {
    ctx: Ctx<'js>,
    scope: &'a EngineScope,
    prelude: Prelude<'js>,
    config: &'a MarshalConfig,
}

impl<'a, 'js> Marshaller<'a, 'js> {
    pub fn new(ctx: &Ctx<'js>, scope: &'a EngineScope, prelude: Prelude<'js>) -> Self {
        Self {
            ctx: ctx.clone(),
            scope,
            prelude,
            config: &scope.config().marshal,
        }
    }

    pub fn prelude(&self) -> &Prelude<'js> {
        &self.prelude
    }

    pub fn encode(&self, value: Value<'js>) -> BridgeResult<WireValue> {
        self.encode_at(value, 0)
    }

    fn encode_at(&self, value: Value<'js>, depth: usize) -> BridgeResult<WireValue> {
        if depth > self.config.max_depth {
            return Err(WireError::malformed(
                "dict",
                format!("value nests deeper than {} levels", self.config.max_depth),
            )
            .into());
        }

        let kind = self.prelude.kind_of(&value)?;
        let wire = match kind.as_str() {
            "undefined" => WireValue::Undefined,
            "null" => WireValue::Null,
            "boolean" => WireValue::Bool(value.as_bool().unwrap_or_default()),
            "number" => WireValue::Number(number_of(&value).unwrap_or(f64::NAN)),
            "string" => WireValue::String(string_of(&value)?),
            "array" => {
                let array = value
                    .as_array()
                    .ok_or_else(|| WireError::Unencodable(kind.clone()))?;
                let mut items = Vec::with_capacity(array.len());
                for item in array.iter::<Value>() {
                    items.push(self.encode_at(item?, depth + 1)?);
                }
                WireValue::Array(items)
            }
            "data" => WireValue::Data(self.prelude.bytes_of(&value)?),
            "date" => WireValue::Date(self.prelude.time_of(&value)?),
            "error" => {
                let object = value
                    .as_object()
                    .ok_or_else(|| WireError::Unencodable(kind.clone()))?;
                let message: Value = object.get("message")?;
                let stack: Value = object.get("stack")?;
                WireValue::Error {
                    message: Box::new(self.encode_at(message, depth + 1)?),
                    stack: Box::new(self.encode_at(stack, depth + 1)?),
                }
            }
            "callback" => match self.prelude.callback_id_of(&value)? {
                Some(id) => WireValue::Callback(id),
                None => self.encode_handle(ObjectKind::Function, value, HandleMeta::None),
            },
            "function" => self.encode_handle(ObjectKind::Function, value, HandleMeta::None),
            "dict" => self.encode_dict(&value, depth)?,
            // the global object is never walked; it travels as an untyped handle
            "global" => WireValue::Handle(HandleRef {
                id: self.scope.store(&self.ctx, value),
                kind: None,
                meta: HandleMeta::None,
            }),
            tag => match tag.strip_prefix("domain:").and_then(ObjectKind::from_domain_mark) {
                Some(domain) => self.encode_domain(domain, value, depth)?,
                None => return Err(WireError::Unencodable(tag.to_string()).into()),
            },
        };
        Ok(wire)
    }

    fn encode_dict(&self, value: &Value<'js>, depth: usize) -> BridgeResult<WireValue> {
        let object = value
            .as_object()
            .ok_or_else(|| WireError::Unencodable("dict".to_string()))?;
        let mut entries = Vec::new();
        for key in object.keys::<String>() {
            let key = key?;
            let field: Value = object.get(key.as_str())?;
            entries.push((
                DictKey::from_property_name(&key),
                self.encode_at(field, depth + 1)?,
            ));
        }
        Ok(WireValue::Dict(entries))
    }

    fn encode_domain(&self, kind: ObjectKind, value: Value<'js>, depth: usize) -> BridgeResult<WireValue> {
        let meta = match kind {
            ObjectKind::Object => self.row_meta(&value)?,
            ObjectKind::List | ObjectKind::Results => {
                let collection = match self.prelude.collection_type_of(&value)? {
                    Some(json) => serde_json::from_str::<CollectionType>(&json)
                        .map_err(|e| WireError::malformed(kind.tag(), e.to_string()))?,
                    None => CollectionType::default(),
                };
                HandleMeta::Collection(collection)
            }
            ObjectKind::Realm | ObjectKind::Session => self.inline_meta(kind, &value, depth)?,
            _ => HandleMeta::None,
        };
        Ok(self.encode_handle(kind, value, meta))
    }

    fn encode_handle(&self, kind: ObjectKind, value: Value<'js>, meta: HandleMeta) -> WireValue {
        let id = self.scope.store(&self.ctx, value);
        WireValue::Handle(HandleRef::new(id, kind).with_meta(meta))
    }

    /// Snapshot cache of a marked row, or `None` for any other value.
    ///
    /// Builds no handles, unlike [`Marshaller::encode`].
    pub fn row_cache(&self, value: &Value<'js>) -> BridgeResult<Option<BTreeMap<String, WireValue>>> {
        let kind = self.prelude.kind_of(value)?;
        if kind.strip_prefix("domain:").and_then(ObjectKind::from_domain_mark) != Some(ObjectKind::Object) {
            return Ok(None);
        }
        match self.row_meta(value)? {
            HandleMeta::Row { cache, .. } => Ok(Some(cache)),
            _ => Ok(None),
        }
    }

    fn row_meta(&self, value: &Value<'js>) -> BridgeResult<HandleMeta> {
        let Some(schema_json) = self.prelude.schema_of(value)? else {
            return Ok(HandleMeta::None);
        };
        let schema: RowSchema = serde_json::from_str(&schema_json)
            .map_err(|e| WireError::malformed("object", e.to_string()))?;

        let valid = match self.prelude.is_valid(value) {
            Ok(valid) => valid,
            Err(err) => {
                self.discard_exception(&err, "isValid");
                false
            }
        };

        let cache = match value.as_object() {
            Some(object) if valid => build_cache(&schema, self.config.max_cached_string_len, |prop| {
                self.snapshot_field(object, prop)
            }),
            _ => BTreeMap::new(),
        };

        Ok(HandleMeta::Row {
            schema: schema.to_wire(),
            cache,
        })
    }

    fn snapshot_field(&self, object: &Object<'js>, prop: &PropertySchema) -> Option<FieldSnapshot> {
        let field: Value = match object.get(prop.name.as_str()) {
            Ok(field) => field,
            Err(err) => {
                self.discard_exception(&err, &prop.name);
                return None;
            }
        };
        match self.snapshot(prop, &field) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                self.discard_exception(&err, &prop.name);
                None
            }
        }
    }

    fn snapshot(&self, prop: &PropertySchema, field: &Value<'js>) -> rquickjs::Result<FieldSnapshot> {
        if field.is_undefined() || field.is_null() {
            return Ok(FieldSnapshot::Null);
        }
        if let Some(b) = field.as_bool() {
            return Ok(FieldSnapshot::Bool(b));
        }
        if let Some(n) = number_of(field) {
            return Ok(FieldSnapshot::Number(n));
        }
        if field.is_string() {
            return string_of(field).map(FieldSnapshot::Text);
        }
        if self.prelude.kind_of(field)? == "date" {
            return self.prelude.time_of(field).map(FieldSnapshot::Date);
        }
        match prop.property_type {
            PropertyType::Decimal | PropertyType::ObjectId => {
                self.prelude.text_of(field).map(FieldSnapshot::Text)
            }
            _ => Ok(FieldSnapshot::Unsupported),
        }
    }

    fn inline_meta(&self, kind: ObjectKind, value: &Value<'js>, depth: usize) -> BridgeResult<HandleMeta> {
        let Some(object) = value.as_object() else {
            return Ok(HandleMeta::None);
        };
        let mut data = BTreeMap::new();
        for name in kind.inline_properties() {
            let field: Value = match object.get(*name) {
                Ok(field) => field,
                Err(err) => {
                    self.discard_exception(&err, name);
                    continue;
                }
            };
            data.insert(name.to_string(), self.encode_at(field, depth + 1)?);
        }
        Ok(HandleMeta::Data(data))
    }

    /// Clears a pending exception left by a best-effort read.
    fn discard_exception(&self, err: &rquickjs::Error, what: &str) {
        if matches!(err, rquickjs::Error::Exception) {
            let _ = self.ctx.catch();
        }
        debug!(target: "bridge::marshal", field = what, error = %err, "Skipped unreadable field");
    }

    pub fn decode(&self, wire: &WireValue) -> BridgeResult<Value<'js>> {
        let ctx = &self.ctx;
        let value = match wire {
            WireValue::Undefined => Value::new_undefined(ctx.clone()),
            WireValue::Null => Value::new_null(ctx.clone()),
            WireValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
            WireValue::Number(n) => (*n).into_js(ctx)?,
            WireValue::String(s) => s.as_str().into_js(ctx)?,
            WireValue::Array(items) => {
                let array = Array::new(ctx.clone())?;
                for (index, item) in items.iter().enumerate() {
                    array.set(index, self.decode(item)?)?;
                }
                array.into_value()
            }
            WireValue::Data(bytes) => self.prelude.make_bytes(bytes)?,
            WireValue::Date(ms) => self.prelude.make_date(*ms)?,
            WireValue::Dict(entries) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in entries {
                    let item = self.decode(item)?;
                    match key {
                        DictKey::Index(index) => object.set(*index, item)?,
                        DictKey::Name(name) => object.set(name.as_str(), item)?,
                    }
                }
                object.into_value()
            }
            WireValue::Ejson(fields) => {
                let object = Object::new(ctx.clone())?;
                for (key, text) in fields {
                    object.set(key.as_str(), text.as_str())?;
                }
                object.into_value()
            }
            WireValue::Callback(id) => self.scope.callback_proxy(ctx, *id)?.into_value(),
            WireValue::Error { message, stack } => {
                let message = match message.as_ref() {
                    WireValue::String(text) => text.clone(),
                    WireValue::Undefined | WireValue::Null => String::new(),
                    other => other.to_json().to_string(),
                };
                let stack = match stack.as_ref() {
                    WireValue::String(text) => Some(text.as_str()),
                    _ => None,
                };
                self.prelude.make_error(&message, stack)?
            }
            WireValue::Handle(handle) => match self.scope.resolve(ctx, handle.id)? {
                Some(value) => value,
                None => {
                    debug!(target: "bridge::marshal", id = handle.id, "Stale handle decoded as null");
                    Value::new_null(ctx.clone())
                }
            },
        };
        Ok(value)
    }

    /// Decodes a raw JSON wire value.
    pub fn decode_json(&self, json: &Json) -> BridgeResult<Value<'js>> {
        self.decode(&WireValue::from_json(json)?)
    }

    /// Decodes a positional argument list: a JSON array of wire values, absent means none.
    pub fn decode_arguments(&self, json: Option<&Json>) -> BridgeResult<Vec<Value<'js>>> {
        match json {
            None | Some(Json::Null) => Ok(Vec::new()),
            Some(Json::Array(items)) => items.iter().map(|item| self.decode_json(item)).collect(),
            Some(other) => Err(WireError::malformed("arguments", format!("expected an array, got {other}")).into()),
        }
    }
}

fn number_of(value: &Value<'_>) -> Option<f64> {
    value.as_int().map(f64::from).or_else(|| value.as_float())
}

fn string_of(value: &Value<'_>) -> rquickjs::Result<String> {
    match value.as_string() {
        Some(text) => text.to_string(),
        None => Ok(String::new()),
    }
}

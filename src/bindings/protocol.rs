//! Tagged wire encoding
//!
//! Every value exchanged with the remote party is a JSON object in one of
//! three shapes:
//!
//! - `{"value": <scalar or array>}` for primitives and plain arrays
//! - `{"type": <tag>, "value": ...}` for values carried literally
//! - `{"type": <tag>, "id": <handle>, ...}` for values carried by handle
//!
//! [`WireValue`] is the typed form of that union. Conversion to and from
//! JSON is explicit so that an unknown tag is a typed error instead of a
//! silently ignored map entry.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value as Json};

use crate::core::error::{WireError, WireResult};
use crate::domain::{CollectionType, ObjectKind, ObjectSchema};

/// Wire tags for values carried literally.
pub mod tags {
    pub const DATA: &str = "data";
    pub const DATE: &str = "date";
    pub const DICT: &str = "dict";
    pub const FUNCTION: &str = "function";
    pub const EJSON: &str = "ejson";
    pub const UNDEFINED: &str = "undefined";
    pub const ERROR: &str = "error";
}

/// Largest integer a JavaScript number represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A plain array, carried element by element.
    Array(Vec<WireValue>),
    /// Binary data, base64 on the wire.
    Data(Vec<u8>),
    /// Milliseconds since the epoch.
    Date(f64),
    /// A plain object; entry order is preserved.
    Dict(Vec<(DictKey, WireValue)>),
    /// A function living on the remote side, identified by its callback id.
    Callback(u64),
    /// Extended-JSON scalar such as `{"$oid": "..."}` or `{"$numberDecimal": "..."}`.
    Ejson(BTreeMap<String, String>),
    Error {
        message: Box<WireValue>,
        stack: Box<WireValue>,
    },
    /// An engine value retained in the handle table.
    Handle(HandleRef),
}

/// Dictionary key: numeric keys and string keys stay distinct on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictKey {
    Index(u32),
    Name(String),
}

impl DictKey {
    /// Classifies an engine property name; canonical array indices become numeric keys.
    pub fn from_property_name(name: &str) -> Self {
        match name.parse::<u32>() {
            // 2^32 - 1 is not an array index
            Ok(index) if index != u32::MAX && index.to_string() == name => DictKey::Index(index),
            _ => DictKey::Name(name.to_string()),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            DictKey::Index(index) => Json::from(*index),
            DictKey::Name(name) => Json::from(name.as_str()),
        }
    }

    pub fn from_json(json: &Json) -> WireResult<Self> {
        match json {
            Json::String(name) => Ok(DictKey::Name(name.clone())),
            Json::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(DictKey::Index)
                .ok_or_else(|| WireError::malformed(tags::DICT, format!("invalid numeric key {n}"))),
            other => Err(WireError::malformed(
                tags::DICT,
                format!("keys must be strings or numbers, got {other}"),
            )),
        }
    }
}

/// Reference to a handle plus the metadata that travels inline with it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleRef {
    pub id: u64,
    /// `None` when the remote party sent a bare `{"id": n}`.
    pub kind: Option<ObjectKind>,
    pub meta: HandleMeta,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum HandleMeta {
    #[default]
    None,
    /// Rows carry their schema and a snapshot of small scalar fields.
    Row {
        schema: ObjectSchema,
        cache: BTreeMap<String, WireValue>,
    },
    /// Lists and result sets carry their element type.
    Collection(CollectionType),
    /// Realms and sessions carry a few properties inline.
    Data(BTreeMap<String, WireValue>),
}

impl HandleRef {
    pub fn new(id: u64, kind: ObjectKind) -> Self {
        Self {
            id,
            kind: Some(kind),
            meta: HandleMeta::None,
        }
    }

    pub fn with_meta(mut self, meta: HandleMeta) -> Self {
        self.meta = meta;
        self
    }

    fn to_json(&self) -> Json {
        let mut map = Map::new();
        if let Some(kind) = self.kind {
            map.insert("type".into(), Json::from(kind.tag()));
        }
        map.insert("id".into(), Json::from(self.id));

        match &self.meta {
            HandleMeta::None => {}
            HandleMeta::Row { schema, cache } => {
                map.insert(
                    "schema".into(),
                    json!({"name": schema.name, "properties": schema.properties}),
                );
                map.insert("cache".into(), wire_map_to_json(cache));
            }
            HandleMeta::Collection(collection) => {
                map.insert("dataType".into(), Json::from(collection.data_type.as_str()));
                map.insert("optional".into(), Json::from(collection.optional));
            }
            HandleMeta::Data(data) => {
                map.insert("data".into(), wire_map_to_json(data));
            }
        }

        Json::Object(map)
    }

    fn from_json(id: u64, obj: &Map<String, Json>) -> WireResult<Self> {
        let kind = match obj.get("type") {
            Some(Json::String(tag)) => Some(
                ObjectKind::from_tag(tag).ok_or_else(|| WireError::UnknownTag(tag.clone()))?,
            ),
            _ => None,
        };

        let meta = if let (Some(schema), Some(cache)) = (obj.get("schema"), obj.get("cache")) {
            HandleMeta::Row {
                schema: serde_json::from_value(schema.clone())
                    .map_err(|e| WireError::malformed("object", e.to_string()))?,
                cache: wire_map_from_json(cache)?,
            }
        } else if let Some(data_type) = obj.get("dataType").and_then(Json::as_str) {
            HandleMeta::Collection(CollectionType {
                data_type: data_type.to_string(),
                optional: obj.get("optional").and_then(Json::as_bool).unwrap_or(false),
            })
        } else if let Some(data) = obj.get("data") {
            HandleMeta::Data(wire_map_from_json(data)?)
        } else {
            HandleMeta::None
        };

        Ok(Self { id, kind, meta })
    }
}

impl WireValue {
    pub fn ejson(key: &str, text: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(key.to_string(), text.into());
        WireValue::Ejson(fields)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, WireValue::Undefined)
    }

    pub fn to_json(&self) -> Json {
        match self {
            WireValue::Undefined => json!({"type": tags::UNDEFINED}),
            WireValue::Null => json!({"value": null}),
            WireValue::Bool(b) => json!({"value": b}),
            WireValue::Number(n) => json!({"value": number_to_json(*n)}),
            WireValue::String(s) => json!({"value": s}),
            WireValue::Array(items) => {
                json!({"value": items.iter().map(WireValue::to_json).collect::<Vec<_>>()})
            }
            WireValue::Data(bytes) => json!({"type": tags::DATA, "value": BASE64.encode(bytes)}),
            WireValue::Date(ms) => json!({"type": tags::DATE, "value": number_to_json(*ms)}),
            WireValue::Dict(entries) => {
                let keys: Vec<Json> = entries.iter().map(|(key, _)| key.to_json()).collect();
                let values: Vec<Json> = entries.iter().map(|(_, value)| value.to_json()).collect();
                json!({"type": tags::DICT, "keys": keys, "values": values})
            }
            WireValue::Callback(id) => json!({"type": tags::FUNCTION, "value": id}),
            WireValue::Ejson(fields) => json!({"type": tags::EJSON, "value": fields}),
            WireValue::Error { message, stack } => json!({
                "type": tags::ERROR,
                "message": message.to_json(),
                "stack": stack.to_json(),
            }),
            WireValue::Handle(handle) => handle.to_json(),
        }
    }

    pub fn from_json(json: &Json) -> WireResult<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| WireError::malformed("value", format!("expected an object, got {json}")))?;

        // Anything carrying a handle id resolves through the handle table, whatever its tag.
        if let Some(id) = obj.get("id").filter(|id| !id.is_null()) {
            let id = id
                .as_u64()
                .ok_or_else(|| WireError::malformed("id", format!("invalid handle id {id}")))?;
            return HandleRef::from_json(id, obj).map(WireValue::Handle);
        }

        match obj.get("type") {
            Some(Json::String(tag)) => Self::from_tagged(tag, obj),
            None | Some(Json::Null) => Self::from_untyped(obj.get("value")),
            Some(other) => Err(WireError::malformed("type", format!("tag must be a string, got {other}"))),
        }
    }

    fn from_untyped(value: Option<&Json>) -> WireResult<Self> {
        match value {
            None => Ok(WireValue::Undefined),
            Some(Json::Null) => Ok(WireValue::Null),
            Some(Json::Bool(b)) => Ok(WireValue::Bool(*b)),
            Some(Json::Number(n)) => Ok(WireValue::Number(n.as_f64().unwrap_or(f64::NAN))),
            Some(Json::String(s)) => Ok(WireValue::String(s.clone())),
            Some(Json::Array(items)) => items
                .iter()
                .map(WireValue::from_json)
                .collect::<WireResult<Vec<_>>>()
                .map(WireValue::Array),
            Some(Json::Object(_)) => Err(WireError::malformed(
                "value",
                "an untyped value must be a scalar or an array",
            )),
        }
    }

    fn from_tagged(tag: &str, obj: &Map<String, Json>) -> WireResult<Self> {
        let value = obj.get("value");
        match tag {
            tags::UNDEFINED => Ok(WireValue::Undefined),
            tags::DATA => {
                let encoded = value
                    .and_then(Json::as_str)
                    .ok_or_else(|| WireError::malformed(tag, "expected a base64 string"))?;
                BASE64
                    .decode(encoded)
                    .map(WireValue::Data)
                    .map_err(|e| WireError::Base64(e.to_string()))
            }
            tags::DATE => value
                .and_then(Json::as_f64)
                .map(WireValue::Date)
                .ok_or_else(|| WireError::malformed(tag, "expected epoch milliseconds")),
            tags::DICT => {
                let keys = obj
                    .get("keys")
                    .and_then(Json::as_array)
                    .ok_or_else(|| WireError::malformed(tag, "missing `keys` array"))?;
                let values = obj
                    .get("values")
                    .and_then(Json::as_array)
                    .ok_or_else(|| WireError::malformed(tag, "missing `values` array"))?;
                if keys.len() != values.len() {
                    return Err(WireError::malformed(
                        tag,
                        format!("{} keys but {} values", keys.len(), values.len()),
                    ));
                }
                keys.iter()
                    .zip(values)
                    .map(|(key, value)| Ok((DictKey::from_json(key)?, WireValue::from_json(value)?)))
                    .collect::<WireResult<Vec<_>>>()
                    .map(WireValue::Dict)
            }
            // the engine keys callback proxies by number
            tags::FUNCTION => value
                .and_then(Json::as_u64)
                .filter(|id| *id <= MAX_SAFE_INTEGER as u64)
                .map(WireValue::Callback)
                .ok_or_else(|| WireError::malformed(tag, "expected a callback id up to 2^53 - 1")),
            tags::EJSON => {
                let fields = value
                    .and_then(Json::as_object)
                    .ok_or_else(|| WireError::malformed(tag, "expected an object"))?;
                Ok(WireValue::Ejson(
                    fields
                        .iter()
                        .map(|(key, value)| {
                            let text = match value {
                                Json::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (key.clone(), text)
                        })
                        .collect(),
                ))
            }
            tags::ERROR => Ok(WireValue::Error {
                message: Box::new(optional_field(obj, "message")?),
                stack: Box::new(optional_field(obj, "stack")?),
            }),
            other if ObjectKind::from_tag(other).is_some() => {
                Err(WireError::malformed(other, "missing handle id"))
            }
            other => Err(WireError::UnknownTag(other.to_string())),
        }
    }
}

impl Serialize for WireValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        WireValue::from_json(&json).map_err(de::Error::custom)
    }
}

impl From<&WireValue> for Json {
    fn from(value: &WireValue) -> Self {
        value.to_json()
    }
}

fn number_to_json(n: f64) -> Json {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Json::Number)
            .unwrap_or(Json::Null)
    }
}

fn optional_field(obj: &Map<String, Json>, key: &str) -> WireResult<WireValue> {
    match obj.get(key) {
        Some(value) => WireValue::from_json(value),
        None => Ok(WireValue::Undefined),
    }
}

fn wire_map_to_json(map: &BTreeMap<String, WireValue>) -> Json {
    Json::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

fn wire_map_from_json(json: &Json) -> WireResult<BTreeMap<String, WireValue>> {
    json.as_object()
        .ok_or_else(|| WireError::malformed("data", "expected an object"))?
        .iter()
        .map(|(key, value)| Ok((key.clone(), WireValue::from_json(value)?)))
        .collect()
}

/// One line of the stdio transport: `{"id": n, "name": "/call_method", "args": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportRequest {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub args: Json,
}

/// Reply line of the stdio transport, echoing the request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportResponse {
    pub id: u64,
    pub response: Json,
}

/// Message asking the remote party to run one of its callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackInvocation {
    pub callback: u64,
    pub this: WireValue,
    pub arguments: WireValue,
    pub callback_call_counter: u64,
}

/// The remote party's answer to a [`CallbackInvocation`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackReply {
    #[serde(default)]
    pub callback: Option<u64>,
    #[serde(default)]
    pub callback_call_counter: Option<u64>,
    #[serde(default)]
    pub result: Option<WireValue>,
    #[serde(default)]
    pub error: Option<Json>,
    #[serde(default)]
    pub stack: Option<Json>,
}

impl CallbackReply {
    /// The error message, if the callback threw on the remote side.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Json::Null => None,
            Json::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }

    /// The serialized stack attached to a thrown error, if it is a string.
    pub fn stack_text(&self) -> Option<&str> {
        self.stack.as_ref().and_then(Json::as_str)
    }
}

//! Domain object wrapper kinds
//!
//! The domain classes (rows, lists, result sets, realms, users, ...) live
//! inside the engine and are owned by the host scripts. The bridge only
//! needs to tell them apart and describe them on the wire. Host objects
//! mark themselves with well-known symbols:
//!
//! - `Symbol.for("engine-bridge:kind")`: one of the tags in [`ObjectKind`]
//! - `Symbol.for("engine-bridge:schema")`: row schema, see [`RowSchema`]
//! - `Symbol.for("engine-bridge:type")`: element type of a list or result set

pub mod schema;

use serde::{Deserialize, Serialize};

pub use schema::{
    CollectionType, FieldSnapshot, ObjectSchema, PropertySchema, PropertyType, RowSchema,
};

/// Symbol description used to mark a domain object's kind.
pub const KIND_SYMBOL: &str = "engine-bridge:kind";
/// Symbol description carrying a row schema.
pub const SCHEMA_SYMBOL: &str = "engine-bridge:schema";
/// Symbol description carrying a collection's element type.
pub const COLLECTION_TYPE_SYMBOL: &str = "engine-bridge:type";

/// Properties of a realm that travel inline with its handle.
pub const REALM_DATA_PROPERTIES: &[&str] =
    &["_isPartialRealm", "inMemory", "path", "readOnly", "syncSession"];

/// Properties of a sync session that travel inline with its handle.
pub const SESSION_DATA_PROPERTIES: &[&str] = &["user", "config"];

/// Engine values passed to the remote party by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Object,
    List,
    Results,
    Realm,
    User,
    Session,
    AsyncOpenTask,
    App,
    Credentials,
    FetchResponseHandler,
    EmailPasswordAuth,
    /// An engine function that is not a remote callback proxy.
    Function,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 12] = [
        ObjectKind::Object,
        ObjectKind::List,
        ObjectKind::Results,
        ObjectKind::Realm,
        ObjectKind::User,
        ObjectKind::Session,
        ObjectKind::AsyncOpenTask,
        ObjectKind::App,
        ObjectKind::Credentials,
        ObjectKind::FetchResponseHandler,
        ObjectKind::EmailPasswordAuth,
        ObjectKind::Function,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ObjectKind::Object => "object",
            ObjectKind::List => "list",
            ObjectKind::Results => "results",
            ObjectKind::Realm => "realm",
            ObjectKind::User => "user",
            ObjectKind::Session => "session",
            ObjectKind::AsyncOpenTask => "asyncopentask",
            ObjectKind::App => "app",
            ObjectKind::Credentials => "credentials",
            ObjectKind::FetchResponseHandler => "fetchresponsehandler",
            ObjectKind::EmailPasswordAuth => "emailpasswordauth",
            ObjectKind::Function => "function",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    /// Kinds a host script may claim through the kind symbol.
    ///
    /// `function` is excluded: functions are classified by the engine itself.
    pub fn from_domain_mark(tag: &str) -> Option<Self> {
        Self::from_tag(tag).filter(|kind| *kind != ObjectKind::Function)
    }

    /// Names of properties that are encoded inline next to the handle id.
    pub fn inline_properties(&self) -> &'static [&'static str] {
        match self {
            ObjectKind::Realm => REALM_DATA_PROPERTIES,
            ObjectKind::Session => SESSION_DATA_PROPERTIES,
            _ => &[],
        }
    }
}

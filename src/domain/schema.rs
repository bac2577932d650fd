//! Row schemas and the inline snapshot cache
//!
//! Sending a row's small scalar fields together with its handle saves the
//! remote party one round trip per field read. The cache is best effort:
//! anything left out is fetched later with `/get_property`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bindings::protocol::WireValue;

/// Schema of a row as published by the host through the schema symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSchema {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertySchema>,
    #[serde(default, rename = "computedProperties")]
    pub computed_properties: Vec<PropertySchema>,
}

impl RowSchema {
    /// The shape sent on the wire: the schema name and the public property names.
    pub fn to_wire(&self) -> ObjectSchema {
        let properties = self
            .properties
            .iter()
            .chain(self.computed_properties.iter())
            .map(|prop| prop.public_name().to_string())
            .collect();
        ObjectSchema {
            name: self.name.clone(),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, rename = "publicName", skip_serializing_if = "Option::is_none")]
    pub public_name: Option<String>,
}

impl PropertySchema {
    pub fn public_name(&self) -> &str {
        match self.public_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }

    /// Whether a snapshot of this property is worth reading at all.
    pub fn is_cacheable(&self) -> bool {
        self.property_type.is_cacheable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    Bool,
    Int,
    Float,
    Double,
    String,
    Date,
    #[serde(alias = "decimal128")]
    Decimal,
    #[serde(rename = "objectId")]
    ObjectId,
    Uuid,
    Data,
    Object,
    Mixed,
    List,
    Set,
    Dictionary,
    LinkingObjects,
    #[serde(other)]
    Other,
}

impl PropertyType {
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            PropertyType::List
                | PropertyType::Set
                | PropertyType::Dictionary
                | PropertyType::LinkingObjects
        )
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            PropertyType::Bool
                | PropertyType::Int
                | PropertyType::Float
                | PropertyType::Double
                | PropertyType::String
                | PropertyType::Date
                | PropertyType::Decimal
                | PropertyType::ObjectId
        )
    }
}

/// `{name, properties}` as carried by an `object` handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSchema {
    pub name: String,
    pub properties: Vec<String>,
}

/// Element type of a list or result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionType {
    #[serde(rename = "type", alias = "dataType")]
    pub data_type: String,
    #[serde(default)]
    pub optional: bool,
}

impl Default for CollectionType {
    fn default() -> Self {
        Self {
            data_type: "mixed".to_string(),
            optional: true,
        }
    }
}

/// A field value read out of the engine, reduced to what the cache can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSnapshot {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Milliseconds since the epoch.
    Date(f64),
    Unsupported,
}

/// Cache entry for one property, or `None` when the field is left to be fetched.
pub fn cached_field(
    prop: &PropertySchema,
    field: FieldSnapshot,
    max_string_len: usize,
) -> Option<WireValue> {
    if !prop.is_cacheable() {
        return None;
    }

    match (prop.property_type, field) {
        (_, FieldSnapshot::Null) if prop.optional => Some(WireValue::Null),
        (PropertyType::Bool, FieldSnapshot::Bool(b)) => Some(WireValue::Bool(b)),
        (PropertyType::Int | PropertyType::Float | PropertyType::Double, FieldSnapshot::Number(n)) => {
            Some(WireValue::Number(n))
        }
        (PropertyType::Date, FieldSnapshot::Date(ms)) => Some(WireValue::Date(ms)),
        (PropertyType::String, FieldSnapshot::Text(s)) => {
            // arbitrary limit on how big a string gets pre-cached
            (s.chars().count() < max_string_len).then_some(WireValue::String(s))
        }
        (PropertyType::Decimal, FieldSnapshot::Text(s)) => {
            Some(WireValue::ejson("$numberDecimal", s))
        }
        (PropertyType::ObjectId, FieldSnapshot::Text(s)) => Some(WireValue::ejson("$oid", s)),
        _ => None,
    }
}

/// Builds the snapshot cache of a row, reading fields through `read`.
///
/// `read` returning `None` means the field could not be read; it is skipped.
pub fn build_cache<F>(schema: &RowSchema, max_string_len: usize, mut read: F) -> BTreeMap<String, WireValue>
where
    F: FnMut(&PropertySchema) -> Option<FieldSnapshot>,
{
    let mut cache = BTreeMap::new();
    for prop in schema.properties.iter().filter(|prop| prop.is_cacheable()) {
        let Some(field) = read(prop) else {
            continue;
        };
        if let Some(value) = cached_field(prop, field, max_string_len) {
            cache.insert(prop.name.clone(), value);
        }
    }
    cache
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(name: &str, property_type: PropertyType, optional: bool) -> PropertySchema {
        PropertySchema {
            name: name.to_string(),
            property_type,
            optional,
            public_name: None,
        }
    }

    #[test]
    fn test_schema_parsing() {
        let schema: RowSchema = serde_json::from_str(
            r#"{
                "name": "Person",
                "properties": [
                    {"name": "age", "type": "int"},
                    {"name": "_id", "type": "objectId", "publicName": "id"},
                    {"name": "price", "type": "decimal128", "optional": true},
                    {"name": "tags", "type": "list"},
                    {"name": "shape", "type": "geometry"}
                ],
                "computedProperties": [{"name": "owners", "type": "linkingObjects"}]
            }"#,
        )
        .unwrap();

        assert_eq!(schema.properties[1].property_type, PropertyType::ObjectId);
        assert_eq!(schema.properties[2].property_type, PropertyType::Decimal);
        assert_eq!(schema.properties[4].property_type, PropertyType::Other);

        let wire = schema.to_wire();
        assert_eq!(wire.name, "Person");
        assert_eq!(wire.properties, vec!["age", "id", "price", "tags", "shape", "owners"]);
    }

    #[test]
    fn test_scalars_are_cached_by_value() {
        assert_eq!(
            cached_field(&prop("ok", PropertyType::Bool, false), FieldSnapshot::Bool(true), 100),
            Some(WireValue::Bool(true))
        );
        assert_eq!(
            cached_field(&prop("n", PropertyType::Double, false), FieldSnapshot::Number(2.5), 100),
            Some(WireValue::Number(2.5))
        );
        assert_eq!(
            cached_field(&prop("at", PropertyType::Date, false), FieldSnapshot::Date(1000.0), 100),
            Some(WireValue::Date(1000.0))
        );
    }

    #[test]
    fn test_long_strings_are_left_out() {
        let name = prop("name", PropertyType::String, false);
        assert_eq!(
            cached_field(&name, FieldSnapshot::Text("short".into()), 100),
            Some(WireValue::String("short".into()))
        );
        assert_eq!(cached_field(&name, FieldSnapshot::Text("x".repeat(100)), 100), None);
    }

    #[test]
    fn test_extended_json_scalars() {
        let id = prop("_id", PropertyType::ObjectId, false);
        let cached = cached_field(&id, FieldSnapshot::Text("5f1d".into()), 100).unwrap();
        assert_eq!(
            cached.to_json(),
            serde_json::json!({"type": "ejson", "value": {"$oid": "5f1d"}})
        );
    }

    #[test]
    fn test_null_only_cached_for_optional() {
        assert_eq!(
            cached_field(&prop("a", PropertyType::Int, true), FieldSnapshot::Null, 100),
            Some(WireValue::Null)
        );
        assert_eq!(cached_field(&prop("a", PropertyType::Int, false), FieldSnapshot::Null, 100), None);
    }

    #[test]
    fn test_build_cache_skips_collections_and_binary() {
        let schema = RowSchema {
            name: "Thing".into(),
            properties: vec![
                prop("count", PropertyType::Int, false),
                prop("items", PropertyType::List, false),
                prop("blob", PropertyType::Data, false),
                prop("label", PropertyType::String, false),
            ],
            computed_properties: vec![],
        };

        let mut reads = Vec::new();
        let cache = build_cache(&schema, 100, |p| {
            reads.push(p.name.clone());
            match p.name.as_str() {
                "count" => Some(FieldSnapshot::Number(3.0)),
                _ => None,
            }
        });

        assert_eq!(reads, vec!["count", "label"]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("count"), Some(&WireValue::Number(3.0)));
    }
}

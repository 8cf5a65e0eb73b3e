// file: src/api/registry.rs
// version: 1.0.0
// guid: d2a7c9e4-5f1b-4c83-b6e0-8a4d3f2e1c96

//! Process-wide registry of document schemas
//!
//! Loading peeks at the `apiVersion`/`kind` envelope and dispatches to the
//! registered schema. Dumping encodes through the schema of the document's
//! variant, injects the envelope and strips empty collections and nulls.

use super::documents::{
    AnyDocument, Build, Document, ImageConfigDocument, List, ToolConfigDocument, Upload,
};
use super::meta::TypeMeta;
use crate::error::CloudImagesError;
use crate::Result;
use serde::ser::Serializer;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

/// What to do with fields a schema does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownPolicy {
    /// Reject the document
    #[default]
    Raise,
    /// Keep the fields and write them back on dump
    Include,
    /// Drop the fields silently
    Exclude,
}

type Loader = fn(&Registry, Value, UnknownPolicy) -> Result<AnyDocument>;

/// Maps (apiVersion, kind) to the loader of a schema
pub struct Registry {
    loaders: HashMap<TypeMeta, Loader>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The registry with every document schema of this crate
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(|| {
            let mut registry = Registry {
                loaders: HashMap::new(),
            };
            registry.register::<Build>();
            registry.register::<Upload>();
            registry.register::<ImageConfigDocument>();
            registry.register::<ToolConfigDocument>();
            registry.loaders.insert(
                TypeMeta::new(List::API_VERSION, List::KIND),
                load_list as Loader,
            );
            registry
        })
    }

    fn register<D: Document>(&mut self) {
        self.loaders.insert(
            TypeMeta::new(D::API_VERSION, D::KIND),
            |_, value, policy| decode::<D>(value, policy).map(Into::into),
        );
    }

    /// Registered schemas
    pub fn types(&self) -> Vec<TypeMeta> {
        let mut types: Vec<TypeMeta> = self.loaders.keys().cloned().collect();
        types.sort();
        types
    }

    /// Load any registered document
    pub fn load(&self, value: Value, policy: UnknownPolicy) -> Result<AnyDocument> {
        let type_meta = envelope(&value)?;
        let loader = self.loaders.get(&type_meta).ok_or_else(|| {
            CloudImagesError::validation(format!("Unknown document type {}", type_meta))
        })?;
        loader(self, value, policy)
    }

    /// Load a document that must be of schema `D`
    pub fn load_as<D: Document>(&self, value: Value, policy: UnknownPolicy) -> Result<D> {
        let type_meta = envelope(&value)?;
        if type_meta.api_version != D::API_VERSION || type_meta.kind != D::KIND {
            return Err(CloudImagesError::validation(format!(
                "Expected {}/{}, got {}",
                D::API_VERSION,
                D::KIND,
                type_meta
            )));
        }
        decode::<D>(value, policy)
    }

    /// Dump any document
    pub fn dump(&self, doc: &AnyDocument) -> Result<Value> {
        match doc {
            AnyDocument::Build(d) => dump_typed(d),
            AnyDocument::Upload(d) => dump_typed(d),
            AnyDocument::ImageConfig(d) => dump_typed(d),
            AnyDocument::ToolConfig(d) => dump_typed(d),
            AnyDocument::List(list) => {
                let items = list
                    .items
                    .iter()
                    .map(|item| self.dump(item))
                    .collect::<Result<Vec<_>>>()?;
                let mut obj = Map::new();
                obj.insert("items".to_string(), Value::Array(items));
                Ok(with_envelope(Value::Object(obj), List::API_VERSION, List::KIND))
            }
        }
    }
}

/// Dump one typed document
pub fn dump_typed<D: Document>(doc: &D) -> Result<Value> {
    let value = serde_json::to_value(doc)?;
    Ok(with_envelope(value, D::API_VERSION, D::KIND))
}

/// Load one typed document with the default RAISE policy
pub fn load<D: Document>(value: Value) -> Result<D> {
    Registry::global().load_as(value, UnknownPolicy::Raise)
}

/// Canonical on-disk text: sorted keys, 4-space indent, trailing newline
pub fn to_canonical_string(value: &Value) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    sorted(value).serialize(&mut ser)?;
    buf.push(b'\n');
    String::from_utf8(buf).map_err(|e| CloudImagesError::validation(e.to_string()))
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            Value::Object(keys.into_iter().map(|k| (k.clone(), sorted(&obj[k]))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

fn envelope(value: &Value) -> Result<TypeMeta> {
    let obj = value
        .as_object()
        .ok_or_else(|| CloudImagesError::validation("Document must be a JSON object"))?;
    let field = |name: &str| {
        obj.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CloudImagesError::validation(format!("Document lacks '{}'", name)))
    };
    Ok(TypeMeta::new(field("apiVersion")?, field("kind")?))
}

fn with_envelope(mut value: Value, api_version: &str, kind: &str) -> Value {
    strip_empty(&mut value);
    if let Value::Object(obj) = &mut value {
        obj.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
        obj.insert("kind".to_string(), Value::String(kind.to_string()));
    }
    value
}

/// Remove null values and empty objects/arrays, recursively
pub fn strip_empty(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            for child in obj.values_mut() {
                strip_empty(child);
            }
            obj.retain(|_, child| !is_empty(child));
        }
        Value::Array(items) => items.iter_mut().for_each(strip_empty),
        _ => {}
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(obj) => obj.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn strip_envelope(value: Value) -> Result<Value> {
    match value {
        Value::Object(mut obj) => {
            obj.remove("apiVersion");
            obj.remove("kind");
            Ok(Value::Object(obj))
        }
        _ => Err(CloudImagesError::validation("Document must be a JSON object")),
    }
}

fn decode<D: Document>(value: Value, policy: UnknownPolicy) -> Result<D> {
    let mut doc: D = serde_json::from_value(strip_envelope(value)?).map_err(|e| {
        CloudImagesError::validation(format!("Invalid {} document: {}", D::KIND, e))
    })?;

    for (location, extra) in doc.extra_fields() {
        apply_policy(D::KIND, location, extra, policy)?;
    }
    Ok(doc)
}

fn apply_policy(
    kind: &str,
    location: &str,
    extra: &mut Map<String, Value>,
    policy: UnknownPolicy,
) -> Result<()> {
    if extra.is_empty() {
        return Ok(());
    }
    match policy {
        UnknownPolicy::Include => Ok(()),
        UnknownPolicy::Exclude => {
            extra.clear();
            Ok(())
        }
        UnknownPolicy::Raise => {
            let fields: Vec<&str> = extra.keys().map(String::as_str).collect();
            let at = if location.is_empty() {
                String::new()
            } else {
                format!(" in '{}'", location)
            };
            Err(CloudImagesError::validation(format!(
                "Unknown fields{} of {}: {}",
                at,
                kind,
                fields.join(", ")
            )))
        }
    }
}

fn load_list(registry: &Registry, value: Value, policy: UnknownPolicy) -> Result<AnyDocument> {
    let mut obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(CloudImagesError::validation("Document must be a JSON object")),
    };
    obj.remove("apiVersion");
    obj.remove("kind");

    let items = match obj.remove("items") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(CloudImagesError::validation("List items must be an array")),
    };
    if policy == UnknownPolicy::Raise {
        apply_policy(List::KIND, "", &mut obj, policy)?;
    }

    let items = items
        .into_iter()
        .map(|item| registry.load(item, policy))
        .collect::<Result<Vec<_>>>()?;
    Ok(AnyDocument::List(List::new(items)))
}

impl Serialize for AnyDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Registry::global()
            .dump(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AnyDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Registry::global()
            .load(value, UnknownPolicy::Raise)
            .map_err(serde::de::Error::custom)
    }
}

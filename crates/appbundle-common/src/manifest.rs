//! Schema-less Kubernetes manifests
//!
//! Component templates and Porch-rendered resources can be any kind, known
//! or unknown. [`Manifest`] keeps them as a JSON tree and exposes typed
//! accessors for the handful of fields the engine reads or writes.

use serde_json::{Map, Value};

use crate::crd::ResourceRef;
use crate::{yaml, Error};

/// A structured resource manifest of arbitrary kind
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    object: Map<String, Value>,
}

impl Manifest {
    /// Wrap an already-parsed resource
    ///
    /// Requires `apiVersion`, `kind` and `metadata.name`. `source` names the
    /// component (or file) in parse errors.
    pub fn from_value(source: &str, value: Value) -> Result<Self, Error> {
        let Value::Object(object) = value else {
            return Err(Error::manifest_parse(source, "manifest must be an object"));
        };
        let manifest = Self { object };
        for (field, present) in [
            ("apiVersion", manifest.str_at(&["apiVersion"]).is_some()),
            ("kind", manifest.str_at(&["kind"]).is_some()),
            ("metadata.name", manifest.str_at(&["metadata", "name"]).is_some()),
        ] {
            if !present {
                return Err(Error::manifest_parse(
                    source,
                    format!("manifest missing {field}"),
                ));
            }
        }
        Ok(manifest)
    }

    /// Parse a component template
    ///
    /// Templates are normally embedded objects. A string template is parsed
    /// as JSON or YAML text.
    pub fn from_template(component: &str, template: &Value) -> Result<Self, Error> {
        match template {
            Value::String(text) => Self::parse(component, text),
            other => Self::from_value(component, other.clone()),
        }
    }

    /// Parse a manifest from JSON or YAML text
    pub fn parse(source: &str, text: &str) -> Result<Self, Error> {
        let value: Value = if text.trim_start().starts_with('{') {
            serde_json::from_str(text).map_err(|e| Error::manifest_parse(source, e.to_string()))?
        } else {
            yaml::parse_yaml(text).map_err(|e| Error::manifest_parse(source, e.to_string()))?
        };
        Self::from_value(source, value)
    }

    /// The top-level object
    pub fn object(&self) -> &Map<String, Value> {
        &self.object
    }

    /// Copy of the manifest as a JSON value
    pub fn to_value(&self) -> Value {
        Value::Object(self.object.clone())
    }

    /// Consume the manifest, returning the JSON tree
    pub fn into_value(self) -> Value {
        Value::Object(self.object)
    }

    /// `apiVersion`
    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"]).unwrap_or_default()
    }

    /// `kind`
    pub fn kind(&self) -> &str {
        self.str_at(&["kind"]).unwrap_or_default()
    }

    /// `metadata.name`
    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"]).unwrap_or_default()
    }

    /// `metadata.namespace`, treating an empty string as unset
    pub fn namespace(&self) -> Option<&str> {
        self.str_at(&["metadata", "namespace"]).filter(|ns| !ns.is_empty())
    }

    /// Set `metadata.namespace`
    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    /// Set `metadata.namespace` only when unset
    pub fn default_namespace(&mut self, namespace: &str) {
        if self.namespace().is_none() && !namespace.is_empty() {
            self.set_namespace(namespace);
        }
    }

    /// `metadata.resourceVersion`
    pub fn resource_version(&self) -> Option<&str> {
        self.str_at(&["metadata", "resourceVersion"])
    }

    /// Set `metadata.resourceVersion`
    pub fn set_resource_version(&mut self, version: &str) {
        self.metadata_mut()
            .insert("resourceVersion".to_string(), Value::String(version.to_string()));
    }

    /// Look up an annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.str_at(&["metadata", "annotations", key])
    }

    /// Set an annotation, creating the map if needed
    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.string_map_mut("annotations")
            .insert(key.to_string(), Value::String(value.into()));
    }

    /// Look up a label
    pub fn label(&self, key: &str) -> Option<&str> {
        self.str_at(&["metadata", "labels", key])
    }

    /// Set a label, creating the map if needed
    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.string_map_mut("labels")
            .insert(key.to_string(), Value::String(value.into()));
    }

    /// Replace `metadata.ownerReferences`
    pub fn set_owner_references(&mut self, refs: Value) {
        self.metadata_mut().insert("ownerReferences".to_string(), refs);
    }

    /// `metadata.ownerReferences`, empty when unset
    pub fn owner_references(&self) -> &[Value] {
        self.slice_at(&["metadata", "ownerReferences"])
            .unwrap_or_default()
    }

    /// Nested string lookup
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.at(path).and_then(Value::as_str)
    }

    /// Nested integer lookup
    pub fn i64_at(&self, path: &[&str]) -> Option<i64> {
        self.at(path).and_then(Value::as_i64)
    }

    /// Nested list lookup
    pub fn slice_at(&self, path: &[&str]) -> Option<&[Value]> {
        self.at(path).and_then(Value::as_array).map(Vec::as_slice)
    }

    /// Nested value lookup
    pub fn at(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.object.get(*first)?, |v, key| v.get(key))
    }

    /// Status of the condition with the given type in `status.conditions`
    pub fn condition_status(&self, type_: &str) -> Option<&str> {
        self.slice_at(&["status", "conditions"])?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
            .and_then(|c| c.get("status").and_then(Value::as_str))
    }

    /// Returns true if condition `type_` has status "True"
    pub fn condition_true(&self, type_: &str) -> bool {
        self.condition_status(type_) == Some("True")
    }

    /// Message of the condition with the given type, if any
    pub fn condition_message(&self, type_: &str) -> Option<&str> {
        self.slice_at(&["status", "conditions"])?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
            .and_then(|c| c.get("message").and_then(Value::as_str))
    }

    /// Reference to this resource
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(
            self.api_version(),
            self.kind(),
            self.name(),
            self.namespace().map(str::to_string),
        )
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        child_object(&mut self.object, "metadata")
    }

    fn string_map_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        child_object(self.metadata_mut(), key)
    }
}

impl From<Manifest> for Value {
    fn from(manifest: Manifest) -> Self {
        manifest.into_value()
    }
}

/// Get (or create) an object-valued child, replacing non-object values
fn child_object<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just replaced with an object"),
    }
}

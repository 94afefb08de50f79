//! Template resources.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Map, Value, json};

/// What happens to the physical resource when it leaves the template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalPolicy {
    Delete,
    Retain,
}

/// How a resource type spells its `Tags` property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tagging {
    /// `[{"Key": k, "Value": v}, ...]`
    List,
    /// `{k: v, ...}`
    Map,
}

/// One entry of a template's `Resources` section
#[derive(Debug, Clone)]
pub struct Resource {
    pub resource_type: String,
    pub properties: Map<String, Value>,
    pub depends_on: BTreeSet<String>,
    pub removal_policy: Option<RemovalPolicy>,
    pub tagging: Option<Tagging>,
}

impl Resource {
    /// Create a resource. Non-object `properties` are treated as empty.
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        let properties = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: BTreeSet::new(),
            removal_policy: None,
            tagging: None,
        }
    }

    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = Some(policy);
        self
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.insert(logical_id.into());
        self
    }

    pub fn taggable(mut self, tagging: Tagging) -> Self {
        self.tagging = Some(tagging);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Render the resource, merging stack-wide tags the resource does not set itself.
    pub fn render(&self, stack_tags: &BTreeMap<String, String>) -> Value {
        let mut properties = self.properties.clone();

        if let Some(tagging) = self.tagging
            && !stack_tags.is_empty()
        {
            merge_tags(&mut properties, tagging, stack_tags);
        }

        let mut rendered = Map::new();
        rendered.insert("Type".to_string(), Value::String(self.resource_type.clone()));
        if !properties.is_empty() {
            rendered.insert("Properties".to_string(), Value::Object(properties));
        }
        if !self.depends_on.is_empty() {
            rendered.insert("DependsOn".to_string(), json!(self.depends_on));
        }
        if let Some(policy) = self.removal_policy {
            rendered.insert("DeletionPolicy".to_string(), json!(policy));
            rendered.insert("UpdateReplacePolicy".to_string(), json!(policy));
        }
        Value::Object(rendered)
    }
}

fn merge_tags(properties: &mut Map<String, Value>, tagging: Tagging, stack_tags: &BTreeMap<String, String>) {
    match tagging {
        Tagging::List => {
            let mut tags = match properties.remove("Tags") {
                Some(Value::Array(tags)) => tags,
                _ => Vec::new(),
            };
            for (key, value) in stack_tags {
                let present = tags.iter().any(|tag| tag.get("Key").and_then(Value::as_str) == Some(key));
                if !present {
                    tags.push(json!({ "Key": key, "Value": value }));
                }
            }
            tags.sort_by(|a, b| {
                let a = a.get("Key").and_then(Value::as_str).unwrap_or_default();
                let b = b.get("Key").and_then(Value::as_str).unwrap_or_default();
                a.cmp(b)
            });
            properties.insert("Tags".to_string(), Value::Array(tags));
        }
        Tagging::Map => {
            let mut tags = match properties.remove("Tags") {
                Some(Value::Object(tags)) => tags,
                _ => Map::new(),
            };
            for (key, value) in stack_tags {
                tags.entry(key.clone()).or_insert_with(|| Value::String(value.clone()));
            }
            properties.insert("Tags".to_string(), Value::Object(tags));
        }
    }
}

//! Stacks: one deployable template plus its assets.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::{InfraError, Result};

use super::expr::{ACCOUNT_ID, Expr, REGION};
use super::resource::Resource;

/// Environment variable naming the target account
pub const ACCOUNT_VAR: &str = "ECS_INFRA_ACCOUNT";

/// Environment variable naming the target region
pub const REGION_VAR: &str = "ECS_INFRA_REGION";

/// Target account and region. Either may be unknown, in which case the
/// corresponding pseudo parameter is emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            region: Some(region.into()),
        }
    }

    /// Read the environment from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the environment through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            account: read(ACCOUNT_VAR),
            region: read(REGION_VAR),
        }
    }

    /// Fill unset fields from `fallback`
    pub fn or(self, fallback: Environment) -> Self {
        Self {
            account: self.account.or(fallback.account),
            region: self.region.or(fallback.region),
        }
    }

    pub fn account(&self) -> Expr {
        match &self.account {
            Some(account) => Expr::lit(account),
            None => Expr::account_id(),
        }
    }

    pub fn region(&self) -> Expr {
        match &self.region {
            Some(region) => Expr::lit(region),
            None => Expr::region(),
        }
    }

    /// Build an `Fn::Sub` expression, substituting the account and region
    /// placeholders that are already known.
    pub fn sub(&self, template: &str) -> Expr {
        Expr::sub(self.substitute(template))
    }

    /// Substitute known account/region placeholders in a plain string
    pub fn substitute(&self, template: &str) -> String {
        let mut rendered = template.to_string();
        if let Some(account) = &self.account {
            rendered = rendered.replace(&format!("${{{ACCOUNT_ID}}}"), account);
        }
        if let Some(region) = &self.region {
            rendered = rendered.replace(&format!("${{{REGION}}}"), region);
        }
        rendered
    }

    pub fn require_account(&self) -> Result<&str> {
        self.account.as_deref().ok_or_else(|| {
            InfraError::UnresolvedEnvironment(format!("account is not set (export {ACCOUNT_VAR})"))
        })
    }

    pub fn require_region(&self) -> Result<&str> {
        self.region.as_deref().ok_or_else(|| {
            InfraError::UnresolvedEnvironment(format!("region is not set (export {REGION_VAR})"))
        })
    }
}

/// An entry of the template's `Outputs` section
#[derive(Debug, Clone)]
pub struct Output {
    pub value: Expr,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

impl Output {
    pub fn new(value: Expr) -> Self {
        Self {
            value,
            description: None,
            export_name: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_export(mut self, export_name: impl Into<String>) -> Self {
        self.export_name = Some(export_name.into());
        self
    }

    fn render(&self) -> Value {
        let mut rendered = Map::new();
        if let Some(description) = &self.description {
            rendered.insert("Description".to_string(), json!(description));
        }
        rendered.insert("Value".to_string(), self.value.to_json());
        if let Some(export_name) = &self.export_name {
            rendered.insert("Export".to_string(), json!({ "Name": export_name }));
        }
        Value::Object(rendered)
    }
}

/// A file that must be uploaded before the stack is deployed
#[derive(Debug, Clone)]
pub struct FileAsset {
    pub id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub sha256: String,
    pub bucket: Expr,
    pub object_key: String,
}

/// Strip everything CloudFormation does not accept in a logical ID
pub fn logical_id(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// One deployable unit
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    env: Environment,
    description: Option<String>,
    resources: BTreeMap<String, Resource>,
    outputs: BTreeMap<String, Output>,
    tags: BTreeMap<String, String>,
    assets: Vec<FileAsset>,
}

impl Stack {
    pub fn new(name: impl Into<String>, env: Environment) -> Self {
        Self {
            name: name.into(),
            env,
            description: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            tags: BTreeMap::new(),
            assets: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Add a resource and return its sanitized logical ID.
    pub fn add(&mut self, id: &str, resource: Resource) -> Result<String> {
        let logical = logical_id(id);
        if logical.is_empty() {
            return Err(InfraError::Config(format!(
                "'{}' does not contain any character usable in a logical ID",
                id
            )));
        }
        if self.resources.contains_key(&logical) {
            return Err(InfraError::DuplicateResource {
                stack: self.name.clone(),
                logical_id: logical,
            });
        }
        log::debug!("{}: adding {} {}", self.name, resource.resource_type, logical);
        self.resources.insert(logical.clone(), resource);
        Ok(logical)
    }

    pub fn add_output(&mut self, id: &str, output: Output) -> Result<()> {
        let logical = logical_id(id);
        if self.outputs.contains_key(&logical) {
            return Err(InfraError::DuplicateOutput {
                stack: self.name.clone(),
                output_id: logical,
            });
        }
        self.outputs.insert(logical, output);
        Ok(())
    }

    /// Export `value` under `export_name` and return the expression other
    /// stacks use to import it.
    pub fn export(&mut self, id: &str, value: Expr, export_name: impl Into<String>) -> Result<Expr> {
        let export_name = export_name.into();
        self.add_output(id, Output::new(value).with_export(export_name.clone()))?;
        Ok(Expr::import(export_name))
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn add_asset(&mut self, asset: FileAsset) {
        self.assets.push(asset);
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.resources.contains_key(logical_id)
    }

    pub fn resources(&self) -> impl Iterator<Item = (&String, &Resource)> {
        self.resources.iter()
    }

    /// All resources of one CloudFormation type, in logical ID order
    pub fn resources_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = (&'a String, &'a Resource)> {
        self.resources.iter().filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&String, &Output)> {
        self.outputs.iter()
    }

    pub fn output(&self, id: &str) -> Option<&Output> {
        self.outputs.get(id)
    }

    /// Export names defined by this stack
    pub fn export_names(&self) -> Vec<String> {
        self.outputs.values().filter_map(|o| o.export_name.clone()).collect()
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn assets(&self) -> &[FileAsset] {
        &self.assets
    }

    /// Render the CloudFormation template
    pub fn template(&self) -> Value {
        let mut template = Map::new();
        template.insert("AWSTemplateFormatVersion".to_string(), json!("2010-09-09"));
        if let Some(description) = &self.description {
            template.insert("Description".to_string(), json!(description));
        }

        let resources: Map<String, Value> = self
            .resources
            .iter()
            .map(|(id, resource)| (id.clone(), resource.render(&self.tags)))
            .collect();
        template.insert("Resources".to_string(), Value::Object(resources));

        if !self.outputs.is_empty() {
            let outputs: Map<String, Value> =
                self.outputs.iter().map(|(id, output)| (id.clone(), output.render())).collect();
            template.insert("Outputs".to_string(), Value::Object(outputs));
        }

        Value::Object(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stack() -> Stack {
        Stack::new("TestStack", Environment::new("123456789012", "us-west-2"))
    }

    #[test]
    fn test_logical_id_sanitizes() {
        assert_eq!(logical_id("TGLocalFor-Foo-bar"), "TGLocalForFoobar");
        assert_eq!(logical_id("ALB"), "ALB");
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut stack = stack();
        stack.add("Vpc", Resource::new("AWS::EC2::VPC", json!({}))).unwrap();
        let err = stack.add("Vpc", Resource::new("AWS::EC2::VPC", json!({}))).unwrap_err();
        assert!(matches!(err, InfraError::DuplicateResource { .. }));
    }

    #[test]
    fn test_add_rejects_sanitized_duplicates() {
        let mut stack = stack();
        stack.add("Rule-For-A", Resource::new("T", json!({}))).unwrap();
        assert!(stack.add("RuleForA", Resource::new("T", json!({}))).is_err());
    }

    #[test]
    fn test_add_rejects_empty_id() {
        let mut stack = stack();
        assert!(matches!(
            stack.add("--", Resource::new("T", json!({}))),
            Err(InfraError::Config(_))
        ));
    }

    #[test]
    fn test_export_returns_import() {
        let mut stack = stack();
        let imported = stack.export("ClusterName", Expr::lit("c"), "svc-cluster").unwrap();
        assert_eq!(imported, Expr::import("svc-cluster"));
        assert_eq!(stack.export_names(), vec!["svc-cluster".to_string()]);

        let template = stack.template();
        assert_eq!(template["Outputs"]["ClusterName"]["Export"]["Name"], json!("svc-cluster"));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let mut stack = stack();
        stack.add_output("Out", Output::new(Expr::lit("a"))).unwrap();
        assert!(matches!(
            stack.add_output("Out", Output::new(Expr::lit("b"))),
            Err(InfraError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_environment_from_lookup() {
        let vars: HashMap<&str, &str> = [(ACCOUNT_VAR, "111122223333"), (REGION_VAR, "")].into();
        let env = Environment::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.account.as_deref(), Some("111122223333"));
        assert!(env.region.is_none());
        assert_eq!(env.region(), Expr::region());
    }

    #[test]
    fn test_environment_or_fills_gaps() {
        let env = Environment { account: Some("1".into()), region: None }
            .or(Environment::new("2", "eu-west-1"));
        assert_eq!(env, Environment::new("1", "eu-west-1"));
    }

    #[test]
    fn test_environment_substitute() {
        let env = Environment { account: Some("123".into()), region: None };
        let expr = env.sub("arn:aws:logs:${AWS::Region}:${AWS::AccountId}:*");
        assert_eq!(expr, Expr::sub("arn:aws:logs:${AWS::Region}:123:*"));
        assert!(!expr.is_resolved());
    }

    #[test]
    fn test_require_account() {
        let env = Environment::default();
        assert!(matches!(env.require_account(), Err(InfraError::UnresolvedEnvironment(_))));
    }

    #[test]
    fn test_template_shape() {
        let mut stack = stack().with_description("demo");
        stack.add("Cluster", Resource::new("AWS::ECS::Cluster", json!({}))).unwrap();
        let template = stack.template();
        assert_eq!(template["AWSTemplateFormatVersion"], json!("2010-09-09"));
        assert_eq!(template["Description"], json!("demo"));
        assert_eq!(template["Resources"]["Cluster"]["Type"], json!("AWS::ECS::Cluster"));
        assert!(template.get("Outputs").is_none());
    }
}

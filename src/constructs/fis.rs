//! Fault Injection Simulator experiment templates.
//!
//! [`ExperimentTemplate`] mirrors `AWS::FIS::ExperimentTemplate`. The
//! descriptor types deserialize from configuration (camelCase keys) and are
//! checked by [`ExperimentTemplate::validate`] before anything is emitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{InfraError, Result};
use crate::template::{Expr, Resource, Stack, Tagging};

pub const ALARM_SOURCE: &str = "aws:cloudwatch:alarm";
pub const NO_STOP_CONDITION: &str = "none";

/// Resources an action runs against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentTarget {
    pub resource_type: String,
    pub resource_tags: BTreeMap<String, String>,
    pub resource_arns: Vec<String>,
    pub selection_mode: String,
    pub parameters: BTreeMap<String, String>,
}

impl ExperimentTarget {
    /// Every resource of `resource_type` carrying `key=value`
    pub fn tagged(resource_type: &str, key: &str, value: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            resource_tags: [(key.to_string(), value.to_string())].into(),
            selection_mode: "ALL".to_string(),
            ..Default::default()
        }
    }

    fn to_json(&self) -> Value {
        let mut target = json!({
            "ResourceType": self.resource_type,
            "SelectionMode": self.selection_mode,
        });
        if !self.resource_tags.is_empty() {
            target["ResourceTags"] = json!(self.resource_tags);
        }
        if !self.resource_arns.is_empty() {
            target["ResourceArns"] = json!(self.resource_arns);
        }
        if !self.parameters.is_empty() {
            target["Parameters"] = json!(self.parameters);
        }
        target
    }
}

/// `ALL`, `COUNT(n)` or `PERCENT(n)` with n in range
fn valid_selection_mode(mode: &str) -> bool {
    if mode == "ALL" {
        return true;
    }
    let numeric = |prefix: &str| {
        mode.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|n| n.parse::<u32>().ok())
    };
    match (numeric("COUNT("), numeric("PERCENT(")) {
        (Some(count), _) => count > 0,
        (_, Some(percent)) => (1..=100).contains(&percent),
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentAction {
    pub action_id: String,
    pub description: Option<String>,
    pub parameters: BTreeMap<String, String>,
    /// Target slot name (e.g. `Tasks`) to declared target key
    pub targets: BTreeMap<String, String>,
    pub start_after: Vec<String>,
}

impl ExperimentAction {
    fn to_json(&self) -> Value {
        let mut action = json!({ "ActionId": self.action_id });
        if let Some(description) = &self.description {
            action["Description"] = json!(description);
        }
        if !self.parameters.is_empty() {
            action["Parameters"] = json!(self.parameters);
        }
        if !self.targets.is_empty() {
            action["Targets"] = json!(self.targets);
        }
        if !self.start_after.is_empty() {
            action["StartAfter"] = json!(self.start_after);
        }
        action
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopCondition {
    pub source: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl StopCondition {
    pub fn none() -> Self {
        Self {
            source: NO_STOP_CONDITION.to_string(),
            value: None,
        }
    }

    pub fn alarm(alarm_arn: impl Into<String>) -> Self {
        Self {
            source: ALARM_SOURCE.to_string(),
            value: Some(alarm_arn.into()),
        }
    }

    fn to_json(&self) -> Value {
        let mut condition = json!({ "Source": self.source });
        if let Some(value) = &self.value {
            condition["Value"] = json!(value);
        }
        condition
    }
}

/// Dashboards whose widgets go into the experiment report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataSources {
    pub cloud_watch_dashboards: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportConfiguration {
    pub data_sources: Option<DataSources>,
    pub pre_experiment_duration: String,
    pub post_experiment_duration: String,
    pub bucket_name: Expr,
    pub prefix: String,
}

impl ReportConfiguration {
    fn to_json(&self) -> Value {
        let mut report = json!({
            "PreExperimentDuration": self.pre_experiment_duration,
            "PostExperimentDuration": self.post_experiment_duration,
            "Outputs": {
                "ExperimentReportS3Configuration": {
                    "BucketName": self.bucket_name,
                    "Prefix": self.prefix,
                },
            },
        });
        if let Some(sources) = &self.data_sources {
            report["DataSources"] = json!({
                "CloudWatchDashboards": sources
                    .cloud_watch_dashboards
                    .iter()
                    .map(|id| json!({ "DashboardIdentifier": Expr::sub(id) }))
                    .collect::<Vec<_>>(),
            });
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfiguration {
    pub log_group_arn: Expr,
    pub schema_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentOptions {
    pub account_targeting: Option<String>,
    pub empty_target_resolution_mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExperimentTemplate {
    pub description: String,
    pub role_arn: Expr,
    pub targets: BTreeMap<String, ExperimentTarget>,
    pub actions: BTreeMap<String, ExperimentAction>,
    pub stop_conditions: Vec<StopCondition>,
    pub report: Option<ReportConfiguration>,
    pub log: Option<LogConfiguration>,
    pub options: Option<ExperimentOptions>,
    pub tags: BTreeMap<String, String>,
}

impl ExperimentTemplate {
    /// Check the cross-references and value constraints FIS enforces at deploy time.
    pub fn validate(&self) -> Result<()> {
        if self.description.is_empty() {
            return Err(InfraError::InvalidExperiment("description must not be empty".to_string()));
        }
        if self.actions.is_empty() {
            return Err(InfraError::InvalidExperiment("at least one action is required".to_string()));
        }
        if self.stop_conditions.is_empty() {
            return Err(InfraError::InvalidExperiment(
                "at least one stop condition is required (use source 'none' for none)".to_string(),
            ));
        }

        for (name, target) in &self.targets {
            if target.resource_type.is_empty() {
                return Err(InfraError::InvalidExperiment(format!("target '{}' has no resource type", name)));
            }
            if target.resource_tags.is_empty() && target.resource_arns.is_empty() && target.parameters.is_empty() {
                return Err(InfraError::InvalidExperiment(format!(
                    "target '{}' needs resource tags, resource ARNs or parameters",
                    name
                )));
            }
            if !valid_selection_mode(&target.selection_mode) {
                return Err(InfraError::InvalidExperiment(format!(
                    "target '{}' has invalid selection mode '{}'",
                    name, target.selection_mode
                )));
            }
        }

        for (name, action) in &self.actions {
            if action.action_id.is_empty() {
                return Err(InfraError::InvalidExperiment(format!("action '{}' has no action id", name)));
            }
            for (slot, target) in &action.targets {
                if !self.targets.contains_key(target) {
                    return Err(InfraError::InvalidExperiment(format!(
                        "action '{}' binds {} to undeclared target '{}'",
                        name, slot, target
                    )));
                }
            }
            for previous in &action.start_after {
                if previous == name {
                    return Err(InfraError::InvalidExperiment(format!("action '{}' starts after itself", name)));
                }
                if !self.actions.contains_key(previous) {
                    return Err(InfraError::InvalidExperiment(format!(
                        "action '{}' starts after undeclared action '{}'",
                        name, previous
                    )));
                }
            }
        }

        for condition in &self.stop_conditions {
            match condition.source.as_str() {
                NO_STOP_CONDITION => {}
                ALARM_SOURCE if condition.value.as_deref().is_some_and(|v| !v.is_empty()) => {}
                ALARM_SOURCE => {
                    return Err(InfraError::InvalidExperiment(
                        "an alarm stop condition needs the alarm ARN as its value".to_string(),
                    ));
                }
                other => {
                    return Err(InfraError::InvalidExperiment(format!("unknown stop condition source '{}'", other)));
                }
            }
        }

        if let Some(report) = &self.report
            && let Some(sources) = &report.data_sources
            && sources.cloud_watch_dashboards.is_empty()
        {
            return Err(InfraError::Config(
                "report data sources must list at least one CloudWatch dashboard".to_string(),
            ));
        }
        Ok(())
    }

    fn properties(&self) -> Value {
        let mut properties = json!({
            "Description": self.description,
            "RoleArn": self.role_arn,
            "Targets": self.targets.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>(),
            "Actions": self.actions.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>(),
            "StopConditions": self.stop_conditions.iter().map(StopCondition::to_json).collect::<Vec<_>>(),
            "Tags": self.tags,
        });
        if let Some(report) = &self.report {
            properties["ExperimentReportConfiguration"] = report.to_json();
        }
        if let Some(log) = &self.log {
            properties["LogConfiguration"] = json!({
                "LogSchemaVersion": log.schema_version,
                "CloudWatchLogsConfiguration": { "LogGroupArn": log.log_group_arn },
            });
        }
        if let Some(options) = &self.options {
            let mut rendered = Map::new();
            if let Some(mode) = &options.account_targeting {
                rendered.insert("AccountTargeting".to_string(), json!(mode));
            }
            if let Some(mode) = &options.empty_target_resolution_mode {
                rendered.insert("EmptyTargetResolutionMode".to_string(), json!(mode));
            }
            if !rendered.is_empty() {
                properties["ExperimentOptions"] = Value::Object(rendered);
            }
        }
        properties
    }

    /// Validate, then emit the template and return its logical ID.
    pub fn build(&self, stack: &mut Stack, id: &str) -> Result<String> {
        self.validate()?;
        stack.add(
            id,
            Resource::new("AWS::FIS::ExperimentTemplate", self.properties()).taggable(Tagging::Map),
        )
    }
}

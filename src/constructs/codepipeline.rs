//! CodePipeline pipelines, stages and the actions this crate uses.

use serde_json::{Value, json};

use crate::error::{InfraError, Result};
use crate::template::{Expr, Resource, Stack, Tagging};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAction {
    pub name: String,
    pub category: &'static str,
    pub provider: &'static str,
    pub configuration: Value,
    pub input_artifacts: Vec<String>,
    pub output_artifacts: Vec<String>,
}

impl PipelineAction {
    /// S3 source for one object; change polling stays off.
    pub fn s3_source(name: &str, bucket_name: &Expr, object_key: &Expr, output: &str) -> Self {
        Self {
            name: name.to_string(),
            category: "Source",
            provider: "S3",
            configuration: json!({
                "S3Bucket": bucket_name,
                "S3ObjectKey": object_key,
                "PollForSourceChanges": "false",
            }),
            input_artifacts: Vec::new(),
            output_artifacts: vec![output.to_string()],
        }
    }

    /// ECS blue/green deploy driven by the app spec and task definition
    /// files of `input`.
    pub fn codedeploy_ecs(name: &str, application: &Expr, deployment_group: &Expr, input: &str, image_placeholder: &str) -> Self {
        Self {
            name: name.to_string(),
            category: "Deploy",
            provider: "CodeDeployToECS",
            configuration: json!({
                "ApplicationName": application,
                "DeploymentGroupName": deployment_group,
                "TaskDefinitionTemplateArtifact": input,
                "TaskDefinitionTemplatePath": "taskdef.json",
                "AppSpecTemplateArtifact": input,
                "AppSpecTemplatePath": "appspec.yaml",
                "Image1ArtifactName": input,
                "Image1ContainerName": image_placeholder,
            }),
            input_artifacts: vec![input.to_string()],
            output_artifacts: Vec::new(),
        }
    }

    fn to_json(&self) -> Value {
        let artifacts = |names: &[String]| names.iter().map(|n| json!({ "Name": n })).collect::<Vec<_>>();
        let mut action = json!({
            "Name": self.name,
            "ActionTypeId": {
                "Category": self.category,
                "Owner": "AWS",
                "Provider": self.provider,
                "Version": "1",
            },
            "Configuration": self.configuration,
            "RunOrder": 1,
        });
        if !self.input_artifacts.is_empty() {
            action["InputArtifacts"] = json!(artifacts(&self.input_artifacts));
        }
        if !self.output_artifacts.is_empty() {
            action["OutputArtifacts"] = json!(artifacts(&self.output_artifacts));
        }
        action
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<PipelineAction>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub role_arn: Expr,
    pub artifact_bucket: Expr,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRef {
    pub name: Expr,
    pub arn: Expr,
}

impl Pipeline {
    /// Check that every consumed artifact is produced by an earlier stage.
    pub fn validate(&self) -> Result<()> {
        if self.stages.len() < 2 {
            return Err(InfraError::Config(format!(
                "pipeline {} needs at least two stages",
                self.name
            )));
        }
        let mut produced: Vec<&str> = Vec::new();
        for stage in &self.stages {
            if stage.actions.is_empty() {
                return Err(InfraError::Config(format!("stage {} has no actions", stage.name)));
            }
            for action in &stage.actions {
                if let Some(missing) = action.input_artifacts.iter().find(|a| !produced.contains(&a.as_str())) {
                    return Err(InfraError::Config(format!(
                        "action {} consumes artifact {} that no earlier stage produces",
                        action.name, missing
                    )));
                }
            }
            produced.extend(stage.actions.iter().flat_map(|a| a.output_artifacts.iter().map(String::as_str)));
        }
        Ok(())
    }

    pub fn build(&self, stack: &mut Stack, id: &str, depends_on: &[String]) -> Result<PipelineRef> {
        self.validate()?;
        let stages: Vec<Value> = self
            .stages
            .iter()
            .map(|stage| {
                json!({
                    "Name": stage.name,
                    "Actions": stage.actions.iter().map(PipelineAction::to_json).collect::<Vec<_>>(),
                })
            })
            .collect();
        let mut resource = Resource::new(
            "AWS::CodePipeline::Pipeline",
            json!({
                "Name": self.name,
                "RoleArn": self.role_arn,
                "ArtifactStore": { "Type": "S3", "Location": self.artifact_bucket },
                "Stages": stages,
                "RestartExecutionOnUpdate": false,
            }),
        )
        .taggable(Tagging::List);
        for dependency in depends_on {
            resource = resource.depends_on(dependency.clone());
        }
        let logical = stack.add(id, resource)?;
        let env = stack.env();
        Ok(PipelineRef {
            name: Expr::reference(&logical),
            arn: Expr::join(
                "",
                vec![
                    Expr::lit("arn:aws:codepipeline:"),
                    env.region(),
                    Expr::lit(":"),
                    env.account(),
                    Expr::lit(":"),
                    Expr::reference(&logical),
                ],
            ),
        })
    }
}

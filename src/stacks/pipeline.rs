//! Two-stage release pipeline: the deployment bundle in S3 feeds a
//! CodeDeploy blue/green deployment.

use serde_json::json;

use crate::bundle::IMAGE_PLACEHOLDER;
use crate::constructs::bucket::{BucketProps, BucketRef, secure_bucket};
use crate::constructs::codepipeline::{Pipeline, PipelineAction, PipelineRef, Stage};
use crate::constructs::ecs::RepositoryRef;
use crate::constructs::iam::{PolicyStatement, Role};
use crate::error::Result;
use crate::template::{Expr, Output, Stack};

use super::service::appspec_key_export;

const SOURCE_OUTPUT: &str = "S3SourceOutput";

#[derive(Debug, Clone)]
pub struct PipelineProps {
    pub pipeline_name: String,
    pub service_name: String,
    pub artifact_bucket: BucketRef,
    pub application_name: String,
    pub deployment_group_name: String,
    pub repository: RepositoryRef,
}

pub fn build(stack: &mut Stack, props: &PipelineProps) -> Result<PipelineRef> {
    let env = stack.env().clone();
    let source_key = Expr::import(appspec_key_export(&props.service_name));
    let source_bucket = &props.artifact_bucket;

    let store = secure_bucket(stack, "ArtifactStore", BucketProps::default())?;

    let mut role = Role::assumed_by(&["codepipeline.amazonaws.com"]);
    role.add_to_policy(PolicyStatement::allow(&["s3:GetObject"]).on(source_bucket.object_arn(source_key.clone())));
    role.add_to_policy(PolicyStatement::allow(&["s3:ListBucket", "s3:GetBucketLocation"]).on(source_bucket.arn.clone()));
    role.add_to_policy(
        PolicyStatement::allow(&[
            "s3:GetObject",
            "s3:GetObjectVersion",
            "s3:GetBucketLocation",
            "s3:ListBucket",
            "s3:PutObject",
        ])
        .on(store.arn.clone())
        .on(store.objects_arn()),
    );
    role.add_to_policy(
        PolicyStatement::allow(&[
            "ecr:BatchCheckLayerAvailability",
            "ecr:GetDownloadUrlForLayer",
            "ecr:BatchGetImage",
        ])
        .on(props.repository.arn.clone()),
    );
    role.add_to_policy(PolicyStatement::allow(&["ecr:GetAuthorizationToken"]).on_all());
    role.add_to_policy(
        PolicyStatement::allow(&[
            "codedeploy:CreateDeployment",
            "codedeploy:GetApplication",
            "codedeploy:GetApplicationRevision",
            "codedeploy:GetDeployment",
            "codedeploy:GetDeploymentConfig",
            "codedeploy:RegisterApplicationRevision",
        ])
        .on(env.sub(&format!(
            "arn:aws:codedeploy:${{AWS::Region}}:${{AWS::AccountId}}:application:{}",
            props.application_name
        )))
        .on(env.sub(&format!(
            "arn:aws:codedeploy:${{AWS::Region}}:${{AWS::AccountId}}:deploymentgroup:{}/{}",
            props.application_name, props.deployment_group_name
        )))
        .on(env.sub("arn:aws:codedeploy:${AWS::Region}:${AWS::AccountId}:deploymentconfig:*")),
    );
    // Task definition registration has no resource-level permissions.
    role.add_to_policy(PolicyStatement::allow(&["ecs:RegisterTaskDefinition", "ecs:DescribeTaskDefinition"]).on_all());
    role.add_to_policy(
        PolicyStatement::allow(&["iam:PassRole"])
            .on_all()
            .with_condition(json!({
                "StringEqualsIfExists": { "iam:PassedToService": ["ecs-tasks.amazonaws.com"] },
            })),
    );
    let role = role.build(stack, "PipelineRole")?;
    let role_policy = format!("{}DefaultPolicy", role.logical_id.as_deref().unwrap_or("PipelineRole"));

    let pipeline = Pipeline {
        name: props.pipeline_name.clone(),
        role_arn: role.arn.clone(),
        artifact_bucket: store.name.clone(),
        stages: vec![
            Stage {
                name: "Source".to_string(),
                actions: vec![PipelineAction::s3_source(
                    "S3_Source",
                    &source_bucket.name,
                    &source_key,
                    SOURCE_OUTPUT,
                )],
            },
            Stage {
                name: "Deploy".to_string(),
                actions: vec![PipelineAction::codedeploy_ecs(
                    "BlueGreenDeploy",
                    &Expr::lit(&props.application_name),
                    &Expr::lit(&props.deployment_group_name),
                    SOURCE_OUTPUT,
                    IMAGE_PLACEHOLDER,
                )],
            },
        ],
    }
    .build(stack, "Pipeline", &[role_policy])?;

    stack.add_output(
        "PipelineName",
        Output::new(pipeline.name.clone()).with_description("ECS Blue/Green Pipeline Name"),
    )?;
    stack.add_output(
        "PipelineArn",
        Output::new(pipeline.arn.clone()).with_description("ECS Blue/Green Pipeline ARN"),
    )?;

    log::info!("{}: pipeline {} for {}", stack.name(), props.pipeline_name, props.service_name);
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Environment, Resource};

    fn props() -> PipelineProps {
        let env = Environment::new("123456789012", "us-west-2");
        PipelineProps {
            pipeline_name: "ecs-blue-green-pipeline".into(),
            service_name: "orders".into(),
            artifact_bucket: BucketRef::from_name("demo-deploy-artifacts-123456789012-us-west-2"),
            application_name: "orders-codedeploy-app".into(),
            deployment_group_name: "orders-deployment-group".into(),
            repository: RepositoryRef::from_name(&env, "demo-repository"),
        }
    }

    fn built() -> Stack {
        let mut stack = Stack::new("Pipeline", Environment::new("123456789012", "us-west-2"));
        build(&mut stack, &props()).unwrap();
        stack
    }

    fn statements(stack: &Stack) -> Vec<serde_json::Value> {
        let policy: &Resource = stack.resource("PipelineRoleDefaultPolicy").unwrap();
        policy.property("PolicyDocument").unwrap()["Statement"].as_array().unwrap().clone()
    }

    #[test]
    fn test_source_reads_imported_key() {
        let stack = built();
        let stages = stack.resource("Pipeline").unwrap().property("Stages").unwrap().clone();
        let source = &stages[0]["Actions"][0];
        assert_eq!(source["Name"], json!("S3_Source"));
        assert_eq!(source["Configuration"]["S3ObjectKey"], json!({"Fn::ImportValue": "orders-appspec-s3-key"}));
        assert_eq!(source["Configuration"]["S3Bucket"], json!("demo-deploy-artifacts-123456789012-us-west-2"));
        assert_eq!(stages[1]["Actions"][0]["Name"], json!("BlueGreenDeploy"));
    }

    #[test]
    fn test_get_object_scoped_to_key() {
        let stack = built();
        let statements = statements(&stack);
        assert_eq!(statements[0]["Action"], json!("s3:GetObject"));
        assert_eq!(
            statements[0]["Resource"],
            json!({"Fn::Join": ["", [
                "arn:aws:s3:::demo-deploy-artifacts-123456789012-us-west-2",
                "/",
                {"Fn::ImportValue": "orders-appspec-s3-key"}
            ]]})
        );
        assert_eq!(statements[1]["Action"], json!(["s3:ListBucket", "s3:GetBucketLocation"]));
    }

    #[test]
    fn test_no_bucket_policy() {
        let stack = built();
        assert_eq!(stack.resources_of_type("AWS::S3::BucketPolicy").count(), 0);
    }

    #[test]
    fn test_pipeline_waits_for_role_policy() {
        let stack = built();
        assert!(stack.resource("Pipeline").unwrap().depends_on.contains("PipelineRoleDefaultPolicy"));
        assert!(stack.output("PipelineName").is_some());
        assert!(stack.output("PipelineArn").is_some());
    }
}

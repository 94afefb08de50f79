//! Shared foundation of the blue/green scenario: the three ECS roles, the
//! VPC and the deployment-artifact bucket.
//!
//! Everything other stacks consume leaves this module by value. Roles are
//! handed out as plain strings (names, or an ARN template), the bucket by its
//! deterministic name and the VPC through its exports.

use serde_json::json;

use crate::constructs::bucket::{BucketProps, BucketRef, secure_bucket};
use crate::constructs::iam::{PolicyStatement, Role, aws_managed_policy};
use crate::constructs::network::{NetworkConfig, VpcRef, build_vpc};
use crate::error::Result;
use crate::template::{Output, Stack};

#[derive(Debug, Clone)]
pub struct FoundationProps {
    pub name: String,
    pub port: u16,
    pub service_name: String,
    pub network: NetworkConfig,
}

/// What the service and pipeline stacks need from the foundation
#[derive(Debug, Clone)]
pub struct FoundationOutputs {
    pub task_role_name: String,
    pub task_exec_role_name: String,
    /// ARN of the CodeDeploy service role; may still contain `${AWS::AccountId}`
    pub service_role_arn: String,
    pub artifact_bucket: BucketRef,
    pub vpc: VpcRef,
}

pub fn task_role_name(name: &str) -> String {
    format!("{}-ecs-task-role", name)
}

pub fn task_exec_role_name(name: &str) -> String {
    format!("{}-ecs-task-exec-role", name)
}

pub fn service_role_name(name: &str) -> String {
    format!("{}-ecs-service-role", name)
}

fn role_arn_template(role_name: &str) -> String {
    format!("arn:aws:iam::${{AWS::AccountId}}:role/{}", role_name)
}

fn elb_arn_template(resource: &str) -> String {
    format!(
        "arn:aws:elasticloadbalancing:${{AWS::Region}}:${{AWS::AccountId}}:{}",
        resource
    )
}

pub fn build(stack: &mut Stack, props: &FoundationProps) -> Result<FoundationOutputs> {
    let env = stack.env().clone();
    let task_role = task_role_name(&props.name);
    let task_exec_role = task_exec_role_name(&props.name);
    let service_role = service_role_name(&props.name);

    Role::assumed_by(&["ecs-tasks.amazonaws.com"])
        .named(&task_role)
        .described("IAM Role for ECS Task Definition")
        .build(stack, "TaskRole")?;

    Role::assumed_by(&["ecs-tasks.amazonaws.com"])
        .named(&task_exec_role)
        .described("IAM Role for ECS Task Execution")
        .with_managed_policy(aws_managed_policy("service-role/AmazonECSTaskExecutionRolePolicy"))
        .with_statement(
            PolicyStatement::allow(&[
                "ecr:GetAuthorizationToken",
                "ecr:BatchCheckLayerAvailability",
                "ecr:GetDownloadUrlForLayer",
                "ecr:BatchGetImage",
            ])
            .on_all(),
        )
        .build(stack, "TaskExecRole")?;

    // PassRole targets are built from the literal names so the service role
    // never depends on the other two role resources.
    let pass_targets = [&task_role, &task_exec_role].map(|name| env.sub(&role_arn_template(name)));
    Role::assumed_by(&["ecs.amazonaws.com", "codedeploy.amazonaws.com"])
        .named(&service_role)
        .described(format!("Service role for {} blue/green deployments", props.service_name))
        .with_managed_policy(aws_managed_policy("AWSCodeDeployRoleForECS"))
        .with_statement(
            PolicyStatement::allow(&[
                "elasticloadbalancing:DescribeListeners",
                "elasticloadbalancing:DescribeTargetGroups",
                "elasticloadbalancing:DescribeTargetHealth",
                "elasticloadbalancing:DescribeRules",
            ])
            .on_all(),
        )
        .with_statement(
            PolicyStatement::allow(&["elasticloadbalancing:RegisterTargets", "elasticloadbalancing:DeregisterTargets"])
                .on(env.sub(&elb_arn_template("targetgroup/*/*"))),
        )
        .with_statement(
            PolicyStatement::allow(&["elasticloadbalancing:ModifyListener"])
                .on(env.sub(&elb_arn_template("listener/app/*/*/*"))),
        )
        .with_statement(
            PolicyStatement::allow(&["elasticloadbalancing:ModifyRule"])
                .on(env.sub(&elb_arn_template("rule/app/*/*/*"))),
        )
        .with_statement({
            let [task, exec] = pass_targets;
            PolicyStatement::allow(&["iam:PassRole"])
                .on(task)
                .on(exec)
                .with_condition(json!({
                    "StringEquals": {
                        "iam:PassedToService": ["ecs.amazonaws.com", "codedeploy.amazonaws.com"],
                    },
                }))
        })
        .build(stack, "ServiceRole")?;

    let vpc = build_vpc(stack, "SkeletonVpc", &props.network)?;
    let vpc = vpc.export(stack, &props.name)?;

    let bucket_name = env.sub(&format!(
        "{}-deploy-artifacts-${{AWS::AccountId}}-${{AWS::Region}}",
        props.name
    ));
    let bucket = secure_bucket(stack, "ArtifactBucket", BucketProps::named(bucket_name.clone()))?;
    stack.add_output(
        "ArtifactBucketName",
        Output::new(bucket.name.clone()).with_description("Deployment artifact bucket"),
    )?;
    stack.add_output(
        "ServicePort",
        Output::new(props.port.to_string().into()).with_description(format!("Port served by {}", props.service_name)),
    )?;

    log::info!("{}: foundation for {} ({})", stack.name(), props.service_name, props.name);
    Ok(FoundationOutputs {
        task_role_name: task_role,
        task_exec_role_name: task_exec_role,
        service_role_arn: env.substitute(&role_arn_template(&service_role)),
        artifact_bucket: BucketRef::from_name(bucket_name),
        vpc,
    })
}

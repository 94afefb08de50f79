//! Blue/green ECS service: cluster, registry, task definition, ALB with a
//! production and a test listener, a CodeDeploy-controlled service and the
//! deployment group binding them, plus the deployment bundle the pipeline
//! starts from.

use crate::bundle::{self, BundleSpec};
use crate::config::DeploymentConfig;
use crate::constructs::codedeploy::{ALL_AT_ONCE, EcsDeploymentGroup, ecs_application};
use crate::constructs::ecs::{
    AwsLogs, ContainerDefinition, DeploymentController, FargateService, RepositoryRef, ServiceLoadBalancer,
    TaskDefinition, cluster, repository,
};
use crate::constructs::elb::{Action, HealthCheck, LoadBalancer, Protocol, TargetGroup, listener};
use crate::constructs::iam::RoleRef;
use crate::constructs::network::{IngressRule, Peer, allow_from, security_group};
use crate::error::Result;
use crate::template::{Expr, FileAsset, Stack};

use super::foundation::FoundationOutputs;

#[derive(Debug, Clone)]
pub struct ServiceProps {
    pub name: String,
    pub service_name: String,
    pub port: u16,
    pub test_port: u16,
    pub container_name: String,
    /// Image the service starts with, before the first pipeline run
    pub initial_image: String,
    pub image_tag: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
    pub health_check: HealthCheck,
    pub artifact_prefix: String,
}

impl From<&DeploymentConfig> for ServiceProps {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            name: config.name.clone(),
            service_name: config.service_name.clone(),
            port: config.port,
            test_port: config.test_port,
            container_name: config.container_name.clone(),
            initial_image: config.initial_image.clone(),
            image_tag: config.image_tag.clone(),
            cpu: config.cpu,
            memory_mib: config.memory_mib,
            desired_count: config.desired_count,
            health_check: config.health_check.clone(),
            artifact_prefix: config.artifact_prefix.clone(),
        }
    }
}

impl ServiceProps {
    pub fn repository_name(&self) -> String {
        format!("{}-repository", self.name)
    }

    pub fn application_name(&self) -> String {
        format!("{}-codedeploy-app", self.service_name)
    }

    pub fn deployment_group_name(&self) -> String {
        format!("{}-deployment-group", self.service_name)
    }

    pub fn task_family(&self) -> String {
        format!("{}-task", self.service_name)
    }
}

/// Export carrying the object key of the deployment bundle
pub fn appspec_key_export(service_name: &str) -> String {
    format!("{}-appspec-s3-key", service_name)
}

/// Names and handles the pipeline needs, all by value
#[derive(Debug, Clone)]
pub struct ServiceOutputs {
    pub application_name: String,
    pub deployment_group_name: String,
    pub repository: RepositoryRef,
    pub appspec_key_export: String,
    pub bundle_key: String,
}

pub fn build(stack: &mut Stack, foundation: &FoundationOutputs, props: &ServiceProps) -> Result<ServiceOutputs> {
    let env = stack.env().clone();
    let service = &props.service_name;
    // The bundle's task definition names concrete ARNs.
    let account = env.require_account()?;
    let region = env.require_region()?;

    let cluster = cluster(stack, "ServiceCluster", Some(&format!("{}-cluster", props.name)), true)?;
    let repo = repository(stack, "Repository", &props.repository_name())?;

    let task_role = RoleRef::from_name(&env, &foundation.task_role_name);
    let exec_role = RoleRef::from_name(&env, &foundation.task_exec_role_name);
    let mut task_definition = TaskDefinition::fargate(props.cpu, props.memory_mib, task_role, exec_role)
        .family(props.task_family())
        .fault_injection(true);
    let mut logging = AwsLogs::new(stack.name());
    logging.retention_days = 1;
    task_definition.add_container(
        ContainerDefinition::new(&props.container_name, props.initial_image.as_str())
            .port(props.port)
            .logging(logging),
    )?;
    let task_definition_ref = task_definition.build(stack, "TaskDefinition")?;

    let vpc = &foundation.vpc;
    let alb_sg = security_group(
        stack,
        "AlbSecurityGroup",
        vpc,
        &format!("Load balancer for {}", service),
        true,
        &[
            IngressRule::tcp(Peer::AnyIpv4, props.port, "Production traffic"),
            IngressRule::tcp(Peer::AnyIpv4, props.test_port, "Test traffic"),
        ],
    )?;
    let service_sg = security_group(stack, "ServiceSecurityGroup", vpc, &format!("Tasks of {}", service), true, &[])?;
    allow_from(stack, "ServiceFromAlb", &service_sg, &alb_sg, props.port, "Load balancer to service")?;

    let mut alb = LoadBalancer::application(true, vpc.public_subnets.clone(), vec![alb_sg.group_id.clone()]);
    alb.name = Some(format!("{}-alb", props.name));
    let alb = alb.build(stack, "ServiceAlb")?;

    // Both groups come from the same value so port and health check match.
    let group = TargetGroup::ip(props.port, vpc.vpc_id.clone()).health_check(props.health_check.clone());
    let blue = group.build(stack, "BlueTargetGroup")?;
    let green = group.build(stack, "GreenTargetGroup")?;

    let prod_listener = listener(stack, "ProdListener", &alb.arn, props.port, Protocol::Http, &Action::Forward(blue.arn.clone()))?;
    let test_listener = listener(
        stack,
        "TestListener",
        &alb.arn,
        props.test_port,
        Protocol::Http,
        &Action::Forward(green.arn.clone()),
    )?;

    let mut fargate = FargateService::new(cluster.name.clone(), task_definition_ref.arn.clone());
    fargate.service_name = Some(service.clone());
    fargate.desired_count = props.desired_count;
    fargate.subnets = vpc.private_subnets.clone();
    fargate.security_groups = vec![service_sg.group_id.clone()];
    fargate.controller = DeploymentController::CodeDeploy;
    fargate.load_balancers = vec![ServiceLoadBalancer {
        container_name: props.container_name.clone(),
        container_port: props.port,
        target_group_arn: blue.arn.clone(),
    }];
    fargate.depends_on = vec![prod_listener.clone(), test_listener.clone()];
    let ecs_service = fargate.build(stack, "Service")?;

    let application = ecs_application(stack, "CodeDeployApplication", &props.application_name())?;
    EcsDeploymentGroup {
        application_name: application,
        deployment_group_name: props.deployment_group_name(),
        service_role_arn: Expr::sub(&foundation.service_role_arn),
        cluster_name: cluster.name.clone(),
        service_name: ecs_service.name.clone(),
        blue_target_group: blue.name.clone(),
        green_target_group: green.name.clone(),
        prod_listener_arn: Expr::reference(&prod_listener),
        test_listener_arn: Expr::reference(&test_listener),
        deployment_config: ALL_AT_ONCE.to_string(),
        termination_wait_minutes: 5,
    }
    .build(stack, "DeploymentGroup")?;

    let bundle = bundle::render(&BundleSpec {
        family: props.task_family(),
        task_role_arn: format!("arn:aws:iam::{}:role/{}", account, foundation.task_role_name),
        execution_role_arn: format!("arn:aws:iam::{}:role/{}", account, foundation.task_exec_role_name),
        cpu: props.cpu,
        memory_mib: props.memory_mib,
        container_name: props.container_name.clone(),
        container_port: props.port,
        image_uri: format!(
            "{}.dkr.ecr.{}.amazonaws.com/{}:{}",
            account,
            region,
            props.repository_name(),
            props.image_tag
        ),
        log_group: None,
        region: region.to_string(),
    })?;
    let bundle_key = bundle.object_key(&props.artifact_prefix);
    stack.add_asset(FileAsset {
        id: "DeploymentBundle".to_string(),
        file_name: format!("{}.zip", bundle.sha256),
        bytes: bundle.bytes,
        sha256: bundle.sha256,
        bucket: foundation.artifact_bucket.name.clone(),
        object_key: bundle_key.clone(),
    });

    let key_export = appspec_key_export(service);
    stack.export("AppSpecS3Key", Expr::lit(&bundle_key), key_export.clone())?;
    stack.export("BlueTargetGroupArn", blue.arn.clone(), format!("{}-blue-tg", service))?;
    stack.export("GreenTargetGroupArn", green.arn.clone(), format!("{}-green-tg", service))?;
    stack.export("ProdListenerArn", Expr::reference(&prod_listener), format!("{}-prod-listener", service))?;
    stack.export("TestListenerArn", Expr::reference(&test_listener), format!("{}-test-listener", service))?;
    stack.export("ClusterName", cluster.name.clone(), format!("{}-cluster", service))?;
    stack.export("AlbArn", alb.arn.clone(), format!("{}-alb-arn", service))?;
    stack.export("CodeDeployApplication", Expr::lit(props.application_name()), format!("{}-codedeploy-app", service))?;
    stack.export(
        "DeploymentGroupName",
        Expr::lit(props.deployment_group_name()),
        format!("{}-deployment-group", service),
    )?;

    log::info!("{}: blue/green service {} with bundle {}", stack.name(), service, bundle_key);
    Ok(ServiceOutputs {
        application_name: props.application_name(),
        deployment_group_name: props.deployment_group_name(),
        repository: repo,
        appspec_key_export: key_export,
        bundle_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructs::bucket::BucketRef;
    use crate::constructs::network::VpcRef;
    use crate::error::InfraError;
    use crate::template::Environment;
    use serde_json::json;

    fn foundation() -> FoundationOutputs {
        FoundationOutputs {
            task_role_name: "demo-ecs-task-role".into(),
            task_exec_role_name: "demo-ecs-task-exec-role".into(),
            service_role_arn: "arn:aws:iam::123456789012:role/demo-ecs-service-role".into(),
            artifact_bucket: BucketRef::from_name("demo-deploy-artifacts-123456789012-us-west-2"),
            vpc: VpcRef {
                vpc_id: Expr::import("demo-vpc-id"),
                public_subnets: vec![Expr::import("demo-public-subnet-1"), Expr::import("demo-public-subnet-2")],
                private_subnets: vec![Expr::import("demo-private-subnet-1"), Expr::import("demo-private-subnet-2")],
            },
        }
    }

    fn props() -> ServiceProps {
        ServiceProps::from(&DeploymentConfig::default())
    }

    fn built() -> (Stack, ServiceOutputs) {
        let mut stack = Stack::new("Service", Environment::new("123456789012", "us-west-2"));
        let outputs = build(&mut stack, &foundation(), &props()).unwrap();
        (stack, outputs)
    }

    #[test]
    fn test_target_group_pair_matches() {
        let (stack, _) = built();
        let blue = stack.resource("BlueTargetGroup").unwrap();
        let green = stack.resource("GreenTargetGroup").unwrap();
        assert_eq!(blue.properties, green.properties);
        assert_eq!(blue.property("HealthCheckIntervalSeconds"), Some(&json!(15)));
        assert_eq!(blue.property("Matcher"), Some(&json!({"HttpCode": "200-399"})));
    }

    #[test]
    fn test_listeners_route_blue_and_green() {
        let (stack, _) = built();
        let prod = stack.resource("ProdListener").unwrap();
        assert_eq!(prod.property("Port"), Some(&json!(80)));
        assert_eq!(prod.property("DefaultActions").unwrap()[0]["TargetGroupArn"], json!({"Ref": "BlueTargetGroup"}));
        let test = stack.resource("TestListener").unwrap();
        assert_eq!(test.property("Port"), Some(&json!(8080)));
        assert_eq!(test.property("DefaultActions").unwrap()[0]["TargetGroupArn"], json!({"Ref": "GreenTargetGroup"}));
    }

    #[test]
    fn test_service_uses_codedeploy() {
        let (stack, _) = built();
        let service = stack.resource("Service").unwrap();
        assert_eq!(service.property("DeploymentController"), Some(&json!({"Type": "CODE_DEPLOY"})));
        assert_eq!(service.property("DesiredCount"), Some(&json!(2)));
        assert!(service.depends_on.contains("ProdListener"));
    }

    #[test]
    fn test_task_definition_uses_role_names() {
        let (stack, _) = built();
        let taskdef = stack.resource("TaskDefinition").unwrap();
        assert_eq!(
            taskdef.property("TaskRoleArn"),
            Some(&json!("arn:aws:iam::123456789012:role/demo-ecs-task-role"))
        );
        assert_eq!(taskdef.property("EnableFaultInjection"), Some(&json!(true)));
        assert_eq!(taskdef.property("Memory"), Some(&json!("512")));
    }

    #[test]
    fn test_exports_and_asset() {
        let (stack, outputs) = built();
        let names = stack.export_names();
        for suffix in [
            "appspec-s3-key",
            "blue-tg",
            "green-tg",
            "prod-listener",
            "test-listener",
            "cluster",
            "alb-arn",
            "codedeploy-app",
            "deployment-group",
        ] {
            assert!(names.contains(&format!("customer-portal-service-{}", suffix)), "{}", suffix);
        }
        assert_eq!(outputs.appspec_key_export, "customer-portal-service-appspec-s3-key");

        let asset = &stack.assets()[0];
        assert_eq!(asset.object_key, outputs.bundle_key);
        assert!(asset.object_key.starts_with("deployments/"));
        assert_eq!(stack.output("AppSpecS3Key").unwrap().value, Expr::lit(&outputs.bundle_key));
    }

    #[test]
    fn test_bundle_needs_environment() {
        let mut stack = Stack::new("Service", Environment::default());
        let result = build(&mut stack, &foundation(), &props());
        assert!(matches!(result, Err(InfraError::UnresolvedEnvironment(_))));
    }
}

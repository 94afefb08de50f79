//! Load-balanced Fargate services, optionally carrying an SSM agent sidecar
//! so FIS can run commands inside the tasks.

use crate::config::ServiceConfig;
use crate::constructs::ecs::{
    AwsLogs, ContainerDefinition, FargateService, ServiceLoadBalancer, ServiceRef, TaskDefinition, cluster,
};
use crate::constructs::elb::{
    Action, HealthCheck, LoadBalancer, LoadBalancerRef, Protocol, TargetGroup, TargetGroupRef, listener,
};
use crate::constructs::iam::{PolicyStatement, Role, RoleRef, aws_managed_policy, grant};
use crate::constructs::logs;
use crate::constructs::network::{IngressRule, NetworkConfig, Peer, VpcRef, allow_from, build_vpc, security_group};
use crate::error::{InfraError, Result};
use crate::template::{Expr, Output, Stack};

const SIDECAR_SCRIPT: &str = include_str!("../../assets/ssm-agent-sidecar.sh");

pub const SSM_AGENT_CONTAINER: &str = "amazon-ssm-agent";
pub const SSM_AGENT_IMAGE: &str = "public.ecr.aws/amazon-ssm-agent/amazon-ssm-agent:latest";
pub const FIS_TAG_KEY: &str = "FIS_ENABLED";

/// Container settings used when no task definition is supplied
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub image: String,
    pub container_name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone)]
pub struct LoadBalancedServiceProps {
    pub cluster: Expr,
    pub vpc: VpcRef,
    pub task_definition: Option<TaskDefinition>,
    pub image: Option<ImageOptions>,
    pub desired_count: u32,
    pub listener_port: u16,
    pub public_load_balancer: bool,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone)]
pub struct LoadBalancedService {
    pub service: ServiceRef,
    pub load_balancer: LoadBalancerRef,
    pub target_group: TargetGroupRef,
    /// Role the sidecar registers tasks under, when there is one
    pub ssm_role: Option<RoleRef>,
    pub internet_facing: bool,
}

/// ALB, listener, target group and a Fargate service with circuit-breaker
/// rollback and tags propagated from the service.
pub fn load_balanced_service(stack: &mut Stack, id: &str, props: LoadBalancedServiceProps) -> Result<LoadBalancedService> {
    let task_definition = match (props.task_definition, &props.image) {
        (Some(task_definition), _) => task_definition,
        (None, Some(image)) => default_task_definition(stack, id, image)?,
        (None, None) => {
            return Err(InfraError::Config(format!(
                "service {} needs either a task definition or image options",
                id
            )));
        }
    };
    let container = task_definition
        .default_container()
        .ok_or_else(|| InfraError::Config(format!("service {} has no essential container with a port", id)))?;
    let container_name = container.name.clone();
    let container_port = container.port_mappings[0];

    let lb_sg = security_group(
        stack,
        &format!("{}LBSecurityGroup", id),
        &props.vpc,
        &format!("Load balancer of {}", id),
        true,
        &[IngressRule::tcp(
            Peer::AnyIpv4,
            props.listener_port,
            format!("Allow from anyone on port {}", props.listener_port),
        )],
    )?;
    let service_sg = security_group(
        stack,
        &format!("{}ServiceSecurityGroup", id),
        &props.vpc,
        &format!("Tasks of {}", id),
        true,
        &[],
    )?;
    allow_from(
        stack,
        &format!("{}ServiceFromLB", id),
        &service_sg,
        &lb_sg,
        container_port,
        "Load balancer to target",
    )?;

    let subnets = if props.public_load_balancer {
        props.vpc.public_subnets.clone()
    } else {
        props.vpc.workload_subnets().to_vec()
    };
    let load_balancer = LoadBalancer::application(props.public_load_balancer, subnets, vec![lb_sg.group_id])
        .build(stack, &format!("{}LB", id))?;
    let target_group = TargetGroup::ip(container_port, props.vpc.vpc_id.clone())
        .health_check(props.health_check)
        .build(stack, &format!("{}TargetGroup", id))?;
    let listener = listener(
        stack,
        &format!("{}PublicListener", id),
        &load_balancer.arn,
        props.listener_port,
        Protocol::Http,
        &Action::Forward(target_group.arn.clone()),
    )?;

    let task_definition = task_definition.build(stack, &format!("{}TaskDef", id))?;
    let mut service = FargateService::new(props.cluster, task_definition.arn);
    service.desired_count = props.desired_count;
    service.subnets = props.vpc.workload_subnets().to_vec();
    service.security_groups = vec![service_sg.group_id];
    service.load_balancers = vec![ServiceLoadBalancer {
        container_name,
        container_port,
        target_group_arn: target_group.arn.clone(),
    }];
    service.circuit_breaker_rollback = true;
    service.propagate_tags_from_service = true;
    service.depends_on = vec![listener];
    let service = service.build(stack, &format!("{}Service", id))?;

    stack.add_output(&format!("{}LoadBalancerDNS", id), Output::new(load_balancer.dns_name.clone()))?;
    stack.add_output(
        &format!("{}ServiceURL", id),
        Output::new(Expr::join("", vec![Expr::lit("http://"), load_balancer.dns_name.clone()])),
    )?;

    Ok(LoadBalancedService {
        service,
        load_balancer,
        target_group,
        ssm_role: None,
        internet_facing: props.public_load_balancer,
    })
}

fn default_task_definition(stack: &mut Stack, id: &str, image: &ImageOptions) -> Result<TaskDefinition> {
    let task_role = Role::assumed_by(&["ecs-tasks.amazonaws.com"]).build(stack, &format!("{}TaskRole", id))?;
    let execution_role = Role::assumed_by(&["ecs-tasks.amazonaws.com"])
        .with_managed_policy(aws_managed_policy("service-role/AmazonECSTaskExecutionRolePolicy"))
        .build(stack, &format!("{}ExecutionRole", id))?;
    let mut task_definition = TaskDefinition::fargate(256, 512, task_role, execution_role);
    task_definition.add_container(
        ContainerDefinition::new(&image.container_name, image.image.as_str())
            .port(image.container_port)
            .logging(AwsLogs::new(id)),
    )?;
    Ok(task_definition)
}

/// The same service, plus an SSM agent sidecar when a task definition is
/// supplied. With the sidecar the load balancer is always internal.
pub fn sidecar_augmented_service(
    stack: &mut Stack,
    id: &str,
    mut props: LoadBalancedServiceProps,
) -> Result<LoadBalancedService> {
    let ssm_role = match props.task_definition.as_mut() {
        Some(task_definition) => {
            let role = attach_ssm_agent(stack, id, task_definition)?;
            props.public_load_balancer = false;
            Some(role)
        }
        None => None,
    };
    let mut service = load_balanced_service(stack, id, props)?;
    if ssm_role.is_some() {
        log::info!("{}: {} carries the SSM agent sidecar", stack.name(), id);
    }
    service.ssm_role = ssm_role;
    Ok(service)
}

fn attach_ssm_agent(stack: &mut Stack, id: &str, task_definition: &mut TaskDefinition) -> Result<RoleRef> {
    let ssm_role = Role::assumed_by(&["ssm.amazonaws.com"])
        .with_managed_policy(aws_managed_policy("AmazonSSMManagedInstanceCore"))
        .build(stack, &format!("{}SSMManagedInstanceRole", id))?;

    grant(
        stack,
        &format!("{}TaskRoleSsmPolicy", id),
        &task_definition.task_role,
        &[
            PolicyStatement::allow(&["ssm:CreateActivation", "ssm:AddTagsToResource"]).on_all(),
            PolicyStatement::allow(&["iam:PassRole"]).on(ssm_role.arn.clone()),
        ],
    )?;

    let mut sidecar = ContainerDefinition::new(SSM_AGENT_CONTAINER, SSM_AGENT_IMAGE);
    sidecar.essential = false;
    sidecar.cpu = Some(0);
    sidecar.entry_point = Some(Vec::new());
    sidecar.command = Some(vec!["/bin/bash".to_string(), "-c".to_string(), SIDECAR_SCRIPT.to_string()]);
    sidecar
        .environment
        .insert("MANAGED_INSTANCE_ROLE_NAME".to_string(), ssm_role.name.clone());
    let mut logging = AwsLogs::new(format!("{}-ssm-agent", id));
    logging.retention_days = 1;
    sidecar.logging = Some(logging);
    task_definition.add_container(sidecar)?;

    Ok(ssm_role)
}

/// The ECS service the fault-injection experiment targets. Everything in the
/// stack is tagged `FIS_ENABLED=true`.
pub fn build_ecs_service_stack(
    stack: &mut Stack,
    network: &NetworkConfig,
    config: &ServiceConfig,
) -> Result<LoadBalancedService> {
    stack.add_tag(FIS_TAG_KEY, "true");
    let vpc = build_vpc(stack, "Vpc", network)?;
    let cluster = cluster(stack, "Cluster", Some(&config.cluster_name), true)?;

    let image = ImageOptions {
        image: config.image.clone(),
        container_name: config.container_name.clone(),
        container_port: config.port,
    };
    let task_definition = if config.fault_injection_agent {
        let execution_role = Role::assumed_by(&["ecs-tasks.amazonaws.com"])
            .with_managed_policy(aws_managed_policy("service-role/AmazonECSTaskExecutionRolePolicy"))
            .build(stack, "ECSTaskExecutionRole")?;
        let task_role = Role::assumed_by(&["ecs-tasks.amazonaws.com"]).build(stack, "ECSTaskRole")?;
        let mut task_definition = TaskDefinition::fargate(config.cpu, config.memory_mib, task_role, execution_role)
            .fault_injection(true);
        let mut logging = AwsLogs::new(&config.container_name);
        logging.retention_days = logs::ONE_YEAR;
        task_definition.add_container(
            ContainerDefinition::new(&image.container_name, image.image.as_str())
                .port(image.container_port)
                .logging(logging),
        )?;
        Some(task_definition)
    } else {
        None
    };

    sidecar_augmented_service(
        stack,
        "SampleAppService",
        LoadBalancedServiceProps {
            cluster: cluster.name,
            vpc,
            task_definition,
            image: Some(image),
            desired_count: config.desired_count,
            listener_port: 80,
            public_load_balancer: true,
            health_check: HealthCheck::default(),
        },
    )
}

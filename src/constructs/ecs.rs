//! ECS clusters, ECR repositories, Fargate task definitions and services.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::{InfraError, Result};
use crate::template::{Environment, Expr, RemovalPolicy, Resource, Stack, Tagging};

use super::iam::RoleRef;
use super::logs::{self, LogGroupRef};

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRef {
    pub name: Expr,
    pub arn: Expr,
}

pub fn cluster(stack: &mut Stack, id: &str, name: Option<&str>, container_insights: bool) -> Result<ClusterRef> {
    let mut properties = json!({
        "ClusterSettings": [{
            "Name": "containerInsights",
            "Value": if container_insights { "enabled" } else { "disabled" },
        }],
    });
    if let Some(name) = name {
        properties["ClusterName"] = json!(name);
    }
    let logical = stack.add(id, Resource::new("AWS::ECS::Cluster", properties).taggable(Tagging::List))?;
    Ok(ClusterRef {
        name: Expr::reference(&logical),
        arn: Expr::get_att(&logical, "Arn"),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRef {
    pub name: Expr,
    pub arn: Expr,
    pub uri: Expr,
}

impl RepositoryRef {
    /// Refer to a repository by name, with ARN and URI built from the environment
    pub fn from_name(env: &Environment, name: &str) -> Self {
        Self {
            name: Expr::lit(name),
            arn: env.sub(&format!("arn:aws:ecr:${{AWS::Region}}:${{AWS::AccountId}}:repository/{}", name)),
            uri: env.sub(&format!("${{AWS::AccountId}}.dkr.ecr.${{AWS::Region}}.amazonaws.com/{}", name)),
        }
    }

    /// Image reference for `tag`
    pub fn image(&self, tag: &str) -> Expr {
        Expr::join(":", vec![self.uri.clone(), Expr::lit(tag)])
    }
}

/// Emit a repository that is destroyed, images included, with its stack.
pub fn repository(stack: &mut Stack, id: &str, name: &str) -> Result<RepositoryRef> {
    stack.add(
        id,
        Resource::new(
            "AWS::ECR::Repository",
            json!({ "RepositoryName": name, "EmptyOnDelete": true }),
        )
        .with_removal_policy(RemovalPolicy::Delete)
        .taggable(Tagging::List),
    )?;
    Ok(RepositoryRef::from_name(stack.env(), name))
}

/// Container log shipping through the awslogs driver
#[derive(Debug, Clone, PartialEq)]
pub struct AwsLogs {
    pub stream_prefix: String,
    pub retention_days: u32,
}

impl AwsLogs {
    pub fn new(stream_prefix: impl Into<String>) -> Self {
        Self {
            stream_prefix: stream_prefix.into(),
            retention_days: logs::ONE_MONTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: Expr,
    pub essential: bool,
    pub cpu: Option<u32>,
    pub memory_mib: Option<u32>,
    pub port_mappings: Vec<u16>,
    pub environment: BTreeMap<String, Expr>,
    pub entry_point: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub logging: Option<AwsLogs>,
}

impl ContainerDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<Expr>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            essential: true,
            cpu: None,
            memory_mib: None,
            port_mappings: Vec::new(),
            environment: BTreeMap::new(),
            entry_point: None,
            command: None,
            logging: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port_mappings.push(port);
        self
    }

    pub fn logging(mut self, logging: AwsLogs) -> Self {
        self.logging = Some(logging);
        self
    }

    fn render(&self, log_group: Option<&LogGroupRef>, region: &Expr) -> Value {
        let mut container = json!({
            "Name": self.name,
            "Image": self.image,
            "Essential": self.essential,
        });
        if let Some(cpu) = self.cpu {
            container["Cpu"] = json!(cpu);
        }
        if let Some(memory) = self.memory_mib {
            container["Memory"] = json!(memory);
        }
        if !self.port_mappings.is_empty() {
            container["PortMappings"] = json!(
                self.port_mappings
                    .iter()
                    .map(|port| json!({ "ContainerPort": port, "Protocol": "tcp" }))
                    .collect::<Vec<_>>()
            );
        }
        if !self.environment.is_empty() {
            container["Environment"] = json!(
                self.environment
                    .iter()
                    .map(|(name, value)| json!({ "Name": name, "Value": value }))
                    .collect::<Vec<_>>()
            );
        }
        if let Some(entry_point) = &self.entry_point {
            container["EntryPoint"] = json!(entry_point);
        }
        if let Some(command) = &self.command {
            container["Command"] = json!(command);
        }
        if let (Some(logging), Some(group)) = (&self.logging, log_group) {
            container["LogConfiguration"] = json!({
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": group.name,
                    "awslogs-stream-prefix": logging.stream_prefix,
                    "awslogs-region": region,
                },
            });
        }
        container
    }
}

/// Fargate task definition builder
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub family: Option<String>,
    pub cpu: u32,
    pub memory_mib: u32,
    pub task_role: RoleRef,
    pub execution_role: RoleRef,
    pub enable_fault_injection: bool,
    containers: Vec<ContainerDefinition>,
}

impl TaskDefinition {
    pub fn fargate(cpu: u32, memory_mib: u32, task_role: RoleRef, execution_role: RoleRef) -> Self {
        Self {
            family: None,
            cpu,
            memory_mib,
            task_role,
            execution_role,
            enable_fault_injection: false,
            containers: Vec::new(),
        }
    }

    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn fault_injection(mut self, enabled: bool) -> Self {
        self.enable_fault_injection = enabled;
        self
    }

    pub fn add_container(&mut self, container: ContainerDefinition) -> Result<()> {
        if self.containers.iter().any(|c| c.name == container.name) {
            return Err(InfraError::Config(format!(
                "container '{}' is already defined",
                container.name
            )));
        }
        self.containers.push(container);
        Ok(())
    }

    pub fn containers(&self) -> &[ContainerDefinition] {
        &self.containers
    }

    /// First essential container that exposes a port
    pub fn default_container(&self) -> Option<&ContainerDefinition> {
        self.containers
            .iter()
            .find(|c| c.essential && !c.port_mappings.is_empty())
    }

    /// Emit the task definition plus one log group per logging container.
    pub fn build(&self, stack: &mut Stack, id: &str) -> Result<TaskDefinitionRef> {
        if self.containers.is_empty() {
            return Err(InfraError::Config(format!("task definition {} has no containers", id)));
        }
        let region = stack.env().region();
        let mut containers = Vec::with_capacity(self.containers.len());
        for container in &self.containers {
            let group = match &container.logging {
                Some(logging) => Some(logs::log_group(
                    stack,
                    &format!("{}{}LogGroup", id, container.name),
                    None,
                    logging.retention_days,
                    RemovalPolicy::Retain,
                )?),
                None => None,
            };
            containers.push(container.render(group.as_ref(), &region));
        }

        let mut properties = json!({
            "Cpu": self.cpu.to_string(),
            "Memory": self.memory_mib.to_string(),
            "NetworkMode": "awsvpc",
            "RequiresCompatibilities": ["FARGATE"],
            "TaskRoleArn": self.task_role.arn,
            "ExecutionRoleArn": self.execution_role.arn,
            "ContainerDefinitions": containers,
        });
        if let Some(family) = &self.family {
            properties["Family"] = json!(family);
        }
        if self.enable_fault_injection {
            properties["EnableFaultInjection"] = json!(true);
        }
        let logical = stack.add(
            id,
            Resource::new("AWS::ECS::TaskDefinition", properties).taggable(Tagging::List),
        )?;
        Ok(TaskDefinitionRef {
            arn: Expr::reference(&logical),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinitionRef {
    pub arn: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentController {
    Ecs,
    CodeDeploy,
}

/// Target group attachment of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceLoadBalancer {
    pub container_name: String,
    pub container_port: u16,
    pub target_group_arn: Expr,
}

#[derive(Debug, Clone)]
pub struct FargateService {
    pub service_name: Option<String>,
    pub cluster: Expr,
    pub task_definition: Expr,
    pub desired_count: u32,
    pub subnets: Vec<Expr>,
    pub security_groups: Vec<Expr>,
    pub assign_public_ip: bool,
    pub controller: DeploymentController,
    pub load_balancers: Vec<ServiceLoadBalancer>,
    pub circuit_breaker_rollback: bool,
    pub propagate_tags_from_service: bool,
    pub enable_execute_command: bool,
    /// Resources (typically listeners) the service must wait for
    pub depends_on: Vec<String>,
}

impl FargateService {
    pub fn new(cluster: Expr, task_definition: Expr) -> Self {
        Self {
            service_name: None,
            cluster,
            task_definition,
            desired_count: 1,
            subnets: Vec::new(),
            security_groups: Vec::new(),
            assign_public_ip: false,
            controller: DeploymentController::Ecs,
            load_balancers: Vec::new(),
            circuit_breaker_rollback: false,
            propagate_tags_from_service: false,
            enable_execute_command: false,
            depends_on: Vec::new(),
        }
    }

    pub fn build(&self, stack: &mut Stack, id: &str) -> Result<ServiceRef> {
        if self.subnets.is_empty() {
            return Err(InfraError::Config(format!("service {} has no subnets", id)));
        }
        let mut properties = json!({
            "Cluster": self.cluster,
            "TaskDefinition": self.task_definition,
            "DesiredCount": self.desired_count,
            "LaunchType": "FARGATE",
            "NetworkConfiguration": {
                "AwsvpcConfiguration": {
                    "AssignPublicIp": if self.assign_public_ip { "ENABLED" } else { "DISABLED" },
                    "Subnets": self.subnets,
                    "SecurityGroups": self.security_groups,
                },
            },
            "EnableECSManagedTags": false,
        });
        if let Some(name) = &self.service_name {
            properties["ServiceName"] = json!(name);
        }
        match self.controller {
            DeploymentController::CodeDeploy => {
                properties["DeploymentController"] = json!({ "Type": "CODE_DEPLOY" });
            }
            DeploymentController::Ecs => {
                properties["DeploymentConfiguration"] = json!({
                    "MaximumPercent": 200,
                    "MinimumHealthyPercent": 50,
                    "DeploymentCircuitBreaker": {
                        "Enable": self.circuit_breaker_rollback,
                        "Rollback": self.circuit_breaker_rollback,
                    },
                });
            }
        }
        if !self.load_balancers.is_empty() {
            properties["LoadBalancers"] = json!(
                self.load_balancers
                    .iter()
                    .map(|lb| json!({
                        "ContainerName": lb.container_name,
                        "ContainerPort": lb.container_port,
                        "TargetGroupArn": lb.target_group_arn,
                    }))
                    .collect::<Vec<_>>()
            );
            properties["HealthCheckGracePeriodSeconds"] = json!(60);
        }
        if self.propagate_tags_from_service {
            properties["PropagateTags"] = json!("SERVICE");
        }
        if self.enable_execute_command {
            properties["EnableExecuteCommand"] = json!(true);
        }

        let mut resource = Resource::new("AWS::ECS::Service", properties).taggable(Tagging::List);
        for dependency in &self.depends_on {
            resource = resource.depends_on(dependency.clone());
        }
        let logical = stack.add(id, resource)?;
        Ok(ServiceRef {
            name: Expr::get_att(&logical, "Name"),
            arn: Expr::reference(&logical),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRef {
    pub name: Expr,
    pub arn: Expr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new("123456789012", "us-west-2")
    }

    fn roles() -> (RoleRef, RoleRef) {
        (RoleRef::from_name(&env(), "task"), RoleRef::from_name(&env(), "exec"))
    }

    #[test]
    fn test_repository_ref_by_name() {
        let repo = RepositoryRef::from_name(&env(), "web");
        assert_eq!(repo.arn.as_literal().unwrap(), "arn:aws:ecr:us-west-2:123456789012:repository/web");
        assert_eq!(
            repo.image("latest").as_literal().unwrap(),
            "123456789012.dkr.ecr.us-west-2.amazonaws.com/web:latest"
        );
    }

    #[test]
    fn test_repository_destroyed_with_stack() {
        let mut stack = Stack::new("Ecs", env());
        repository(&mut stack, "Repo", "web").unwrap();
        let rendered = stack.resource("Repo").unwrap().render(&Default::default());
        assert_eq!(rendered["Properties"]["EmptyOnDelete"], json!(true));
        assert_eq!(rendered["DeletionPolicy"], json!("Delete"));
    }

    #[test]
    fn test_task_definition_build() {
        let mut stack = Stack::new("Ecs", env());
        let (task, exec) = roles();
        let mut taskdef = TaskDefinition::fargate(256, 512, task, exec).family("web").fault_injection(true);
        taskdef
            .add_container(ContainerDefinition::new("web", "nginx:latest").port(80).logging(AwsLogs::new("web")))
            .unwrap();
        let built = taskdef.build(&mut stack, "TaskDef").unwrap();
        assert_eq!(built.arn, Expr::reference("TaskDef"));

        let resource = stack.resource("TaskDef").unwrap();
        assert_eq!(resource.property("Cpu"), Some(&json!("256")));
        assert_eq!(resource.property("Memory"), Some(&json!("512")));
        assert_eq!(resource.property("EnableFaultInjection"), Some(&json!(true)));
        assert_eq!(
            resource.property("TaskRoleArn"),
            Some(&json!("arn:aws:iam::123456789012:role/task"))
        );
        let container = &resource.property("ContainerDefinitions").unwrap()[0];
        assert_eq!(container["PortMappings"][0]["ContainerPort"], json!(80));
        assert_eq!(container["LogConfiguration"]["Options"]["awslogs-group"], json!({"Ref": "TaskDefwebLogGroup"}));
        assert_eq!(container["LogConfiguration"]["Options"]["awslogs-region"], json!("us-west-2"));
        assert!(stack.contains("TaskDefwebLogGroup"));
    }

    #[test]
    fn test_duplicate_container_rejected() {
        let (task, exec) = roles();
        let mut taskdef = TaskDefinition::fargate(256, 512, task, exec);
        taskdef.add_container(ContainerDefinition::new("web", "a")).unwrap();
        assert!(taskdef.add_container(ContainerDefinition::new("web", "b")).is_err());
    }

    #[test]
    fn test_empty_task_definition_rejected() {
        let mut stack = Stack::new("Ecs", env());
        let (task, exec) = roles();
        assert!(TaskDefinition::fargate(256, 512, task, exec).build(&mut stack, "Empty").is_err());
    }

    #[test]
    fn test_code_deploy_service() {
        let mut stack = Stack::new("Ecs", env());
        let mut service = FargateService::new(Expr::reference("Cluster"), Expr::reference("TaskDef"));
        service.subnets = vec![Expr::lit("subnet-1")];
        service.controller = DeploymentController::CodeDeploy;
        service.depends_on = vec!["ProdListener".to_string()];
        service.load_balancers.push(ServiceLoadBalancer {
            container_name: "web".into(),
            container_port: 80,
            target_group_arn: Expr::reference("BlueTg"),
        });
        let built = service.build(&mut stack, "Service").unwrap();
        assert_eq!(built.name, Expr::get_att("Service", "Name"));

        let rendered = stack.resource("Service").unwrap().render(&Default::default());
        assert_eq!(rendered["Properties"]["DeploymentController"]["Type"], json!("CODE_DEPLOY"));
        assert!(rendered["Properties"].get("DeploymentConfiguration").is_none());
        assert_eq!(rendered["DependsOn"], json!(["ProdListener"]));
    }

    #[test]
    fn test_ecs_service_circuit_breaker() {
        let mut stack = Stack::new("Ecs", env());
        let mut service = FargateService::new(Expr::reference("Cluster"), Expr::reference("TaskDef"));
        service.subnets = vec![Expr::lit("subnet-1")];
        service.circuit_breaker_rollback = true;
        service.propagate_tags_from_service = true;
        service.build(&mut stack, "Service").unwrap();
        let resource = stack.resource("Service").unwrap();
        assert_eq!(
            resource.property("DeploymentConfiguration").unwrap()["DeploymentCircuitBreaker"]["Rollback"],
            json!(true)
        );
        assert_eq!(resource.property("PropagateTags"), Some(&json!("SERVICE")));
    }
}

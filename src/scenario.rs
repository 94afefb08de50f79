//! Deployment scenarios: each wires the stack builders into one app.

use std::fmt;

use clap::ValueEnum;

use crate::config::Config;
use crate::constructs::network::build_vpc;
use crate::error::Result;
use crate::stacks::agent_service::build_ecs_service_stack;
use crate::stacks::fault_injection::{CpuStressExperiment, build_foundation, load_trust_policy};
use crate::stacks::foundation::{self, FoundationProps};
use crate::stacks::ingress::IngressController;
use crate::stacks::pipeline::{self, PipelineProps};
use crate::stacks::service::{self, ServiceProps};
use crate::template::{App, Environment, Expr};

pub const FOUNDATION_STACK: &str = "EcsFoundationStack";
pub const SERVICE_STACK: &str = "EcsBlueGreenServiceStack";
pub const PIPELINE_STACK: &str = "EcsBlueGreenPipelineStack";
pub const ECS_SERVICE_STACK: &str = "ECSServiceStack";
pub const FIS_STACK: &str = "FaultInjectionStack";
pub const INGRESS_STACK: &str = "IngressControllerStack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Foundation, blue/green service and release pipeline
    BlueGreen,
    /// Tagged ECS service plus a CPU-stress experiment against it
    FaultInjection,
    /// Shared ALB routing paths to ALBs elsewhere
    Ingress,
}

impl Scenario {
    pub fn all() -> [Scenario; 3] {
        [Scenario::BlueGreen, Scenario::FaultInjection, Scenario::Ingress]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::BlueGreen => "blue-green",
            Scenario::FaultInjection => "fault-injection",
            Scenario::Ingress => "ingress",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::BlueGreen => "ECS blue/green deployment with CodeDeploy and CodePipeline",
            Scenario::FaultInjection => "ECS service with an FIS CPU-stress experiment",
            Scenario::Ingress => "Path-based ingress controller in front of remote ALBs",
        }
    }

    /// Stacks this scenario defines under `config`, in declaration order
    pub fn stack_names(&self, config: &Config) -> Vec<&'static str> {
        match self {
            Scenario::BlueGreen if config.pipeline.enabled => vec![FOUNDATION_STACK, SERVICE_STACK, PIPELINE_STACK],
            Scenario::BlueGreen => vec![FOUNDATION_STACK, SERVICE_STACK],
            Scenario::FaultInjection => vec![ECS_SERVICE_STACK, FIS_STACK],
            Scenario::Ingress => vec![INGRESS_STACK],
        }
    }

    pub fn build(&self, config: &Config, env: Environment) -> Result<App> {
        log::info!("Building scenario {}", self.name());
        let mut app = App::new(env);
        match self {
            Scenario::BlueGreen => blue_green(&mut app, config)?,
            Scenario::FaultInjection => fault_injection(&mut app, config)?,
            Scenario::Ingress => ingress(&mut app, config)?,
        }
        Ok(app)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn blue_green(app: &mut App, config: &Config) -> Result<()> {
    let deployment = &config.deployment;

    let mut foundation_stack = app
        .new_stack(FOUNDATION_STACK)
        .with_description("Roles, network and artifact bucket for ECS blue/green deployments");
    let foundation = foundation::build(
        &mut foundation_stack,
        &FoundationProps {
            name: deployment.name.clone(),
            port: deployment.port,
            service_name: deployment.service_name.clone(),
            network: config.network.clone(),
        },
    )?;
    app.add_stack(foundation_stack)?;

    let mut service_stack = app
        .new_stack(SERVICE_STACK)
        .with_description("ECS service with CodeDeploy blue/green deployment group");
    let service = service::build(&mut service_stack, &foundation, &ServiceProps::from(deployment))?;
    app.add_stack(service_stack)?;

    if !config.pipeline.enabled {
        log::info!("Pipeline disabled, skipping {}", PIPELINE_STACK);
        return Ok(());
    }

    let mut pipeline_stack = app
        .new_stack(PIPELINE_STACK)
        .with_description("CodePipeline releasing the deployment bundle through CodeDeploy");
    pipeline::build(
        &mut pipeline_stack,
        &PipelineProps {
            pipeline_name: config.pipeline.name.clone(),
            service_name: deployment.service_name.clone(),
            artifact_bucket: foundation.artifact_bucket,
            application_name: service.application_name,
            deployment_group_name: service.deployment_group_name,
            repository: service.repository,
        },
    )?;
    app.add_stack(pipeline_stack)
}

fn fault_injection(app: &mut App, config: &Config) -> Result<()> {
    let mut ecs_stack = app.new_stack(ECS_SERVICE_STACK);
    build_ecs_service_stack(&mut ecs_stack, &config.network, &config.service)?;
    app.add_stack(ecs_stack)?;

    let fis = &config.fault_injection;
    let mut fis_stack = app
        .new_stack(FIS_STACK)
        .with_description("FIS role, report bucket and CPU-stress experiment template");
    let trust_policy = load_trust_policy(fis.trust_policy.as_deref())?;
    let foundation = build_foundation(&mut fis_stack, trust_policy)?;
    CpuStressExperiment {
        targets: fis.targets.clone(),
        actions: fis.actions.clone(),
        stop_conditions: fis.stop_conditions.clone(),
        report: fis.report.clone(),
        options: fis.options.clone(),
    }
    .build(&mut fis_stack, &fis.experiment_id, &foundation.role, &foundation.report_bucket)?;
    app.add_stack(fis_stack)
}

fn ingress(app: &mut App, config: &Config) -> Result<()> {
    let ingress = &config.ingress;
    let mut stack = app.new_stack(INGRESS_STACK);

    let vpc = match &ingress.vpc {
        Some(existing) => existing.to_ref(),
        None => build_vpc(&mut stack, "IngressVpc", &config.network)?,
    };
    let mut controller = IngressController::new(&mut stack, &ingress.name, vpc, ingress.first_priority)?;

    for route in &ingress.routes {
        let destination = if route.destination.starts_with("arn:") {
            Expr::lit(&route.destination)
        } else {
            // Exported by a stack deployed outside this app.
            app.allow_external_import(&route.destination);
            Expr::import(&route.destination)
        };
        let added = match route.priority {
            Some(priority) => controller.add_route_with_priority(&mut stack, &route.path, destination, priority)?,
            None => controller.add_route(&mut stack, &route.path, destination)?,
        };
        log::debug!("Route {} -> {} at priority {}", added.path, route.destination, added.priority);
    }

    app.add_stack(stack)
}

//! Path-routed ingress in front of other services' load balancers.
//!
//! One internet-facing ALB answers 404 by default. Each route adds a
//! listener rule splitting traffic between a local and a remote IP target
//! group, an internal NLB fronting the destination ALB, and a scheduled
//! Lambda that keeps the local group registered with the destination's
//! current addresses.

use crate::constructs::elb::{
    Action, LoadBalancer, LoadBalancerRef, MAX_RULE_PRIORITY, Protocol, TargetGroup, TargetGroupRef, listener,
    listener_rule,
};
use crate::constructs::iam::{PolicyStatement, Role, aws_managed_policy};
use crate::constructs::lambda::{FunctionRef, InlineFunction, invoke_permission, json_string, schedule_rule};
use crate::constructs::logs::{self, log_group};
use crate::constructs::network::{IngressRule, Peer, VpcRef, security_group};
use crate::error::{InfraError, Result};
use crate::template::{Expr, Output, RemovalPolicy, Stack, logical_id};

const UPDATE_TARGETS_CODE: &str = include_str!("../../assets/lambda/update_targets.py");
const FUNCTION_PREFIX: &str = "IngressControllerUpdateTargetsFor";
const MAX_FUNCTION_NAME: usize = 64;
const ROUTE_PORT: u16 = 80;
const LOCAL_WEIGHT: u32 = 90;
const REMOTE_WEIGHT: u32 = 10;
const REFRESH_MINUTES: u32 = 5;

/// Derive a route's resource name: drop one leading `/`, turn every other
/// non-alphanumeric into `-` and capitalise the first character.
pub fn derive_name(path: &str) -> Result<String> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let replaced: String = trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut chars = replaced.chars();
    let name = match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => return Err(InfraError::InvalidRoute(format!("path '{}' derives an empty name", path))),
    };
    if logical_id(&name).is_empty() {
        return Err(InfraError::InvalidRoute(format!(
            "path '{}' has no alphanumeric characters",
            path
        )));
    }
    Ok(name)
}

/// Everything one route emitted
#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub name: String,
    pub priority: u32,
    pub local_target_group: TargetGroupRef,
    pub remote_target_group: TargetGroupRef,
    pub nlb: LoadBalancerRef,
    pub function: FunctionRef,
}

#[derive(Debug)]
pub struct IngressController {
    id: String,
    vpc: VpcRef,
    load_balancer: LoadBalancerRef,
    listener_arn: Expr,
    next_priority: u32,
    routes: Vec<Route>,
}

impl IngressController {
    /// Emit the shared ALB, its security group and the 404 listener.
    pub fn new(stack: &mut Stack, id: &str, vpc: VpcRef, first_priority: u32) -> Result<Self> {
        if !(1..=MAX_RULE_PRIORITY).contains(&first_priority) {
            return Err(InfraError::InvalidRoute(format!(
                "first priority {} is outside 1..={}",
                first_priority, MAX_RULE_PRIORITY
            )));
        }
        let sg = security_group(
            stack,
            &format!("{}IngressControllerALBSG", id),
            &vpc,
            "Ingress controller load balancer",
            true,
            &[IngressRule::tcp(Peer::AnyIpv4, ROUTE_PORT, "Allow HTTP from anywhere")],
        )?;
        let mut alb = LoadBalancer::application(true, vpc.public_subnets.clone(), vec![sg.group_id]);
        alb.name = Some("CustomIngressControllerALB".to_string());
        let load_balancer = alb.build(stack, &format!("{}ALB", id))?;
        let listener = listener(
            stack,
            &format!("{}Listener", id),
            &load_balancer.arn,
            ROUTE_PORT,
            Protocol::Http,
            &Action::FixedResponse {
                status_code: 404,
                content_type: "text/plain".to_string(),
                body: "Resource Not Found".to_string(),
            },
        )?;
        stack.add_output(
            &format!("{}LoadBalancerDns", id),
            Output::new(load_balancer.dns_name.clone()).with_description("Ingress controller DNS name"),
        )?;

        Ok(Self {
            id: id.to_string(),
            vpc,
            load_balancer,
            listener_arn: Expr::reference(listener),
            next_priority: first_priority,
            routes: Vec::new(),
        })
    }

    pub fn load_balancer(&self) -> &LoadBalancerRef {
        &self.load_balancer
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Add a route at the next free priority
    pub fn add_route(&mut self, stack: &mut Stack, path: &str, destination_alb_arn: Expr) -> Result<&Route> {
        let mut priority = self.next_priority;
        while self.routes.iter().any(|r| r.priority == priority) {
            priority += 1;
        }
        self.add_route_with_priority(stack, path, destination_alb_arn, priority)
    }

    /// Add a route at an explicit priority
    pub fn add_route_with_priority(
        &mut self,
        stack: &mut Stack,
        path: &str,
        destination_alb_arn: Expr,
        priority: u32,
    ) -> Result<&Route> {
        let name = self.check_route(path, priority)?;
        let route = self.emit_route(stack, path, name, priority, destination_alb_arn)?;
        log::info!("{}: route {} -> {} (priority {})", stack.name(), path, route.name, priority);
        self.next_priority = self.next_priority.max(priority + 1);
        self.routes.push(route);
        Ok(&self.routes[self.routes.len() - 1])
    }

    /// Everything that can be rejected is rejected here, before any resource is added.
    fn check_route(&self, path: &str, priority: u32) -> Result<String> {
        let name = derive_name(path)?;
        if let Some(existing) = self
            .routes
            .iter()
            .find(|r| r.name == name || logical_id(&r.name) == logical_id(&name))
        {
            return Err(InfraError::RouteNameCollision {
                path: path.to_string(),
                existing: existing.path.clone(),
                derived: name,
            });
        }
        if !(1..=MAX_RULE_PRIORITY).contains(&priority) {
            return Err(InfraError::InvalidRoute(format!(
                "priority {} for '{}' is outside 1..={}",
                priority, path, MAX_RULE_PRIORITY
            )));
        }
        if let Some(existing) = self.routes.iter().find(|r| r.priority == priority) {
            return Err(InfraError::PriorityCollision {
                priority,
                path: path.to_string(),
                existing: existing.path.clone(),
            });
        }
        if FUNCTION_PREFIX.len() + name.len() > MAX_FUNCTION_NAME {
            return Err(InfraError::InvalidRoute(format!(
                "path '{}' is too long for a function name",
                path
            )));
        }
        Ok(name)
    }

    fn emit_route(
        &self,
        stack: &mut Stack,
        path: &str,
        name: String,
        priority: u32,
        destination: Expr,
    ) -> Result<Route> {
        let id = &self.id;
        let vpc_id = self.vpc.vpc_id.clone();

        let local = TargetGroup::ip(ROUTE_PORT, vpc_id.clone()).build(stack, &format!("{}TGLocalFor{}", id, name))?;
        let remote = TargetGroup::ip(ROUTE_PORT, vpc_id.clone()).build(stack, &format!("{}TGRemoteFor{}", id, name))?;
        listener_rule(
            stack,
            &format!("{}RuleFor{}", id, name),
            &self.listener_arn,
            priority,
            &[path.to_string()],
            &Action::WeightedForward(vec![
                (local.arn.clone(), LOCAL_WEIGHT),
                (remote.arn.clone(), REMOTE_WEIGHT),
            ]),
        )?;

        let nlb = LoadBalancer::network(false, self.vpc.private_subnets.clone())
            .build(stack, &format!("{}NLBFor{}", id, name))?;
        let nlb_target = TargetGroup::alb(ROUTE_PORT, vpc_id, destination.clone())
            .build(stack, &format!("{}NLBTargetFor{}", id, name))?;
        listener(
            stack,
            &format!("{}NLBListenerFor{}", id, name),
            &nlb.arn,
            ROUTE_PORT,
            Protocol::Tcp,
            &Action::Forward(nlb_target.arn.clone()),
        )?;

        let function_name = format!("{}{}", FUNCTION_PREFIX, name);
        let lambda_sg = security_group(
            stack,
            &format!("{}LambdaSGFor{}", id, name),
            &self.vpc,
            &format!("Security group for lambda updating target group for {}", path),
            true,
            &[],
        )?;
        let role = Role::assumed_by(&["lambda.amazonaws.com"])
            .with_managed_policy(aws_managed_policy("service-role/AWSLambdaBasicExecutionRole"))
            .with_managed_policy(aws_managed_policy("service-role/AWSLambdaVPCAccessExecutionRole"))
            .with_statement(PolicyStatement::allow(&["elasticloadbalancing:DescribeLoadBalancers"]).on(destination.clone()))
            .with_statement(
                PolicyStatement::allow(&[
                    "elasticloadbalancing:RegisterTargets",
                    "elasticloadbalancing:DeregisterTargets",
                ])
                .on(local.arn.clone()),
            )
            .with_statement(PolicyStatement::allow(&["elasticloadbalancing:DescribeTargetHealth"]).on_all())
            .build(stack, &format!("{}UpdateTargetsRoleFor{}", id, name))?;
        let role_policy = format!("{}DefaultPolicy", role.logical_id.clone().unwrap_or_default());

        let log = log_group(
            stack,
            &format!("{}LogGroupFor{}", id, function_name),
            Some(&format!("/aws/lambda/{}", function_name)),
            logs::ONE_WEEK,
            RemovalPolicy::Delete,
        )?;
        let function = InlineFunction::python(UPDATE_TARGETS_CODE, role.arn.clone())
            .named(&function_name)
            .timeout_secs(60)
            .in_vpc(self.vpc.private_subnets.clone(), vec![lambda_sg.group_id])
            .build(stack, &format!("{}UpdateTargetGroupFunctionFor{}", id, name), &[role_policy, log.logical_id])?;

        let input = json_string(&[
            ("TargetGroupArn", local.arn.clone()),
            ("TargetNlbDns", nlb.dns_name.clone()),
            ("DestinationAlbArn", destination),
        ]);
        let rule = schedule_rule(
            stack,
            &format!("{}ScheduleRuleFor{}", id, name),
            REFRESH_MINUTES,
            &function.arn,
            input,
        )?;
        invoke_permission(
            stack,
            &format!("{}InvokePermissionFor{}", id, name),
            &function.arn,
            "events.amazonaws.com",
            Some(Expr::get_att(rule, "Arn")),
        )?;

        Ok(Route {
            path: path.to_string(),
            name,
            priority,
            local_target_group: local,
            remote_target_group: remote,
            nlb,
            function,
        })
    }
}

//! Application and network load balancers, target groups, listeners and rules.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{InfraError, Result};
use crate::template::{Expr, Resource, Stack, Tagging};

/// Target health check policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub path: String,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub healthy_http_codes: String,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 5,
            path: "/".to_string(),
            healthy_threshold: 2,
            unhealthy_threshold: 5,
            healthy_http_codes: "200-399".to_string(),
        }
    }
}

impl HealthCheck {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs >= self.interval_secs {
            return Err(InfraError::Config(format!(
                "health check timeout ({}s) must be shorter than the interval ({}s)",
                self.timeout_secs, self.interval_secs
            )));
        }
        if !self.path.starts_with('/') {
            return Err(InfraError::Config(format!(
                "health check path '{}' must start with '/'",
                self.path
            )));
        }
        Ok(())
    }

    fn apply(&self, properties: &mut Value) {
        properties["HealthCheckEnabled"] = json!(true);
        properties["HealthCheckIntervalSeconds"] = json!(self.interval_secs);
        properties["HealthCheckTimeoutSeconds"] = json!(self.timeout_secs);
        properties["HealthCheckPath"] = json!(self.path);
        properties["HealthyThresholdCount"] = json!(self.healthy_threshold);
        properties["UnhealthyThresholdCount"] = json!(self.unhealthy_threshold);
        properties["Matcher"] = json!({ "HttpCode": self.healthy_http_codes });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tcp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Tcp => "TCP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Ip,
    Alb,
}

#[derive(Debug, Clone)]
pub struct TargetGroup {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub vpc_id: Expr,
    pub health_check: Option<HealthCheck>,
    pub targets: Vec<Expr>,
}

impl TargetGroup {
    pub fn ip(port: u16, vpc_id: Expr) -> Self {
        Self {
            name: None,
            port,
            protocol: Protocol::Http,
            target_type: TargetType::Ip,
            vpc_id,
            health_check: None,
            targets: Vec::new(),
        }
    }

    /// TCP group whose single target is an application load balancer
    pub fn alb(port: u16, vpc_id: Expr, alb_arn: Expr) -> Self {
        Self {
            protocol: Protocol::Tcp,
            target_type: TargetType::Alb,
            targets: vec![alb_arn],
            ..Self::ip(port, vpc_id)
        }
    }

    pub fn health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn build(&self, stack: &mut Stack, id: &str) -> Result<TargetGroupRef> {
        if let Some(name) = &self.name
            && name.len() > 32
        {
            return Err(InfraError::Config(format!(
                "target group name '{}' is longer than 32 characters",
                name
            )));
        }
        let mut properties = json!({
            "Port": self.port,
            "Protocol": self.protocol.as_str(),
            "TargetType": match self.target_type {
                TargetType::Ip => "ip",
                TargetType::Alb => "alb",
            },
            "VpcId": self.vpc_id,
        });
        if let Some(name) = &self.name {
            properties["Name"] = json!(name);
        }
        if let Some(health_check) = &self.health_check {
            health_check.validate()?;
            health_check.apply(&mut properties);
        }
        if !self.targets.is_empty() {
            properties["Targets"] = json!(
                self.targets
                    .iter()
                    .map(|target| json!({ "Id": target, "Port": self.port }))
                    .collect::<Vec<_>>()
            );
        }
        let logical = stack.add(
            id,
            Resource::new("AWS::ElasticLoadBalancingV2::TargetGroup", properties).taggable(Tagging::List),
        )?;
        Ok(TargetGroupRef {
            arn: Expr::reference(&logical),
            name: Expr::get_att(&logical, "TargetGroupName"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroupRef {
    pub arn: Expr,
    pub name: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerKind {
    Application,
    Network,
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub kind: LoadBalancerKind,
    pub name: Option<String>,
    pub internet_facing: bool,
    pub subnets: Vec<Expr>,
    pub security_groups: Vec<Expr>,
}

impl LoadBalancer {
    pub fn application(internet_facing: bool, subnets: Vec<Expr>, security_groups: Vec<Expr>) -> Self {
        Self {
            kind: LoadBalancerKind::Application,
            name: None,
            internet_facing,
            subnets,
            security_groups,
        }
    }

    pub fn network(internet_facing: bool, subnets: Vec<Expr>) -> Self {
        Self {
            kind: LoadBalancerKind::Network,
            name: None,
            internet_facing,
            subnets,
            security_groups: Vec::new(),
        }
    }

    pub fn build(&self, stack: &mut Stack, id: &str) -> Result<LoadBalancerRef> {
        if self.subnets.is_empty() {
            return Err(InfraError::Config(format!("load balancer {} has no subnets", id)));
        }
        let mut properties = json!({
            "Type": match self.kind {
                LoadBalancerKind::Application => "application",
                LoadBalancerKind::Network => "network",
            },
            "Scheme": if self.internet_facing { "internet-facing" } else { "internal" },
            "Subnets": self.subnets,
        });
        if !self.security_groups.is_empty() {
            properties["SecurityGroups"] = json!(self.security_groups);
        }
        if let Some(name) = &self.name {
            properties["Name"] = json!(name);
        }
        let logical = stack.add(
            id,
            Resource::new("AWS::ElasticLoadBalancingV2::LoadBalancer", properties).taggable(Tagging::List),
        )?;
        Ok(LoadBalancerRef {
            arn: Expr::reference(&logical),
            dns_name: Expr::get_att(&logical, "DNSName"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerRef {
    pub arn: Expr,
    pub dns_name: Expr,
}

/// What a listener or rule does with a request
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Forward(Expr),
    WeightedForward(Vec<(Expr, u32)>),
    FixedResponse {
        status_code: u16,
        content_type: String,
        body: String,
    },
}

impl Action {
    fn to_json(&self) -> Value {
        match self {
            Action::Forward(target_group) => json!({ "Type": "forward", "TargetGroupArn": target_group }),
            Action::WeightedForward(groups) => json!({
                "Type": "forward",
                "ForwardConfig": {
                    "TargetGroups": groups
                        .iter()
                        .map(|(arn, weight)| json!({ "TargetGroupArn": arn, "Weight": weight }))
                        .collect::<Vec<_>>(),
                },
            }),
            Action::FixedResponse {
                status_code,
                content_type,
                body,
            } => json!({
                "Type": "fixed-response",
                "FixedResponseConfig": {
                    "StatusCode": status_code.to_string(),
                    "ContentType": content_type,
                    "MessageBody": body,
                },
            }),
        }
    }
}

/// Emit a listener and return its logical ID (its `Ref` is the ARN).
pub fn listener(
    stack: &mut Stack,
    id: &str,
    load_balancer_arn: &Expr,
    port: u16,
    protocol: Protocol,
    default_action: &Action,
) -> Result<String> {
    stack.add(
        id,
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": load_balancer_arn,
                "Port": port,
                "Protocol": protocol.as_str(),
                "DefaultActions": [default_action.to_json()],
            }),
        ),
    )
}

pub const MAX_RULE_PRIORITY: u32 = 50_000;

/// Path-pattern listener rule
pub fn listener_rule(
    stack: &mut Stack,
    id: &str,
    listener_arn: &Expr,
    priority: u32,
    path_patterns: &[String],
    action: &Action,
) -> Result<String> {
    if !(1..=MAX_RULE_PRIORITY).contains(&priority) {
        return Err(InfraError::InvalidRoute(format!(
            "rule priority {} is outside 1..={}",
            priority, MAX_RULE_PRIORITY
        )));
    }
    stack.add(
        id,
        Resource::new(
            "AWS::ElasticLoadBalancingV2::ListenerRule",
            json!({
                "ListenerArn": listener_arn,
                "Priority": priority,
                "Conditions": [{
                    "Field": "path-pattern",
                    "PathPatternConfig": { "Values": path_patterns },
                }],
                "Actions": [action.to_json()],
            }),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Environment;

    fn stack() -> Stack {
        Stack::new("Elb", Environment::default())
    }

    #[test]
    fn test_health_check_defaults_rendered() {
        let mut stack = stack();
        TargetGroup::ip(80, Expr::lit("vpc-1"))
            .health_check(HealthCheck::default())
            .build(&mut stack, "Blue")
            .unwrap();
        let blue = stack.resource("Blue").unwrap();
        assert_eq!(blue.property("HealthCheckIntervalSeconds"), Some(&json!(15)));
        assert_eq!(blue.property("HealthCheckTimeoutSeconds"), Some(&json!(5)));
        assert_eq!(blue.property("HealthyThresholdCount"), Some(&json!(2)));
        assert_eq!(blue.property("UnhealthyThresholdCount"), Some(&json!(5)));
        assert_eq!(blue.property("Matcher"), Some(&json!({"HttpCode": "200-399"})));
        assert_eq!(blue.property("TargetType"), Some(&json!("ip")));
    }

    #[test]
    fn test_health_check_validation() {
        let bad = HealthCheck {
            timeout_secs: 30,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad_path = HealthCheck {
            path: "health".into(),
            ..Default::default()
        };
        assert!(bad_path.validate().is_err());
    }

    #[test]
    fn test_alb_target_group() {
        let mut stack = stack();
        TargetGroup::alb(80, Expr::lit("vpc-1"), Expr::lit("arn:alb"))
            .build(&mut stack, "Nlb Tg")
            .unwrap();
        let tg = stack.resource("NlbTg").unwrap();
        assert_eq!(tg.property("Protocol"), Some(&json!("TCP")));
        assert_eq!(tg.property("Targets"), Some(&json!([{"Id": "arn:alb", "Port": 80}])));
    }

    #[test]
    fn test_fixed_response_listener() {
        let mut stack = stack();
        let action = Action::FixedResponse {
            status_code: 404,
            content_type: "text/plain".into(),
            body: "Resource Not Found".into(),
        };
        listener(&mut stack, "Http", &Expr::reference("Alb"), 80, Protocol::Http, &action).unwrap();
        let listener = stack.resource("Http").unwrap();
        assert_eq!(
            listener.property("DefaultActions").unwrap()[0]["FixedResponseConfig"],
            json!({"StatusCode": "404", "ContentType": "text/plain", "MessageBody": "Resource Not Found"})
        );
    }

    #[test]
    fn test_weighted_rule_and_priority_range() {
        let mut stack = stack();
        let action = Action::WeightedForward(vec![(Expr::reference("Local"), 90), (Expr::reference("Remote"), 10)]);
        listener_rule(&mut stack, "Rule", &Expr::reference("Http"), 1, &["/a*".to_string()], &action).unwrap();
        let rule = stack.resource("Rule").unwrap();
        assert_eq!(
            rule.property("Actions").unwrap()[0]["ForwardConfig"]["TargetGroups"][1]["Weight"],
            json!(10)
        );
        assert!(matches!(
            listener_rule(&mut stack, "Zero", &Expr::reference("Http"), 0, &[], &action),
            Err(InfraError::InvalidRoute(_))
        ));
        assert!(listener_rule(&mut stack, "High", &Expr::reference("Http"), 50_001, &[], &action).is_err());
    }

    #[test]
    fn test_internal_network_load_balancer() {
        let mut stack = stack();
        let nlb = LoadBalancer::network(false, vec![Expr::lit("subnet-1")]).build(&mut stack, "Nlb").unwrap();
        assert_eq!(nlb.dns_name, Expr::get_att("Nlb", "DNSName"));
        let resource = stack.resource("Nlb").unwrap();
        assert_eq!(resource.property("Scheme"), Some(&json!("internal")));
        assert_eq!(resource.property("Type"), Some(&json!("network")));
        assert!(resource.property("SecurityGroups").is_none());
    }
}

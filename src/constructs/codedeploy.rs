//! CodeDeploy applications and ECS blue/green deployment groups.

use serde_json::json;

use crate::error::Result;
use crate::template::{Expr, Resource, Stack, Tagging};

pub const ALL_AT_ONCE: &str = "CodeDeployDefault.ECSAllAtOnce";

/// Emit an ECS-platform application and return its name
pub fn ecs_application(stack: &mut Stack, id: &str, name: &str) -> Result<Expr> {
    let logical = stack.add(
        id,
        Resource::new(
            "AWS::CodeDeploy::Application",
            json!({ "ApplicationName": name, "ComputePlatform": "ECS" }),
        )
        .taggable(Tagging::List),
    )?;
    Ok(Expr::reference(logical))
}

/// Everything a blue/green deployment group binds together
#[derive(Debug, Clone)]
pub struct EcsDeploymentGroup {
    pub application_name: Expr,
    pub deployment_group_name: String,
    pub service_role_arn: Expr,
    pub cluster_name: Expr,
    pub service_name: Expr,
    pub blue_target_group: Expr,
    pub green_target_group: Expr,
    pub prod_listener_arn: Expr,
    pub test_listener_arn: Expr,
    pub deployment_config: String,
    /// Minutes to keep the old task set after traffic moves
    pub termination_wait_minutes: u32,
}

impl EcsDeploymentGroup {
    pub fn build(&self, stack: &mut Stack, id: &str) -> Result<Expr> {
        let logical = stack.add(
            id,
            Resource::new(
                "AWS::CodeDeploy::DeploymentGroup",
                json!({
                    "ApplicationName": self.application_name,
                    "DeploymentGroupName": self.deployment_group_name,
                    "ServiceRoleArn": self.service_role_arn,
                    "DeploymentConfigName": self.deployment_config,
                    "DeploymentStyle": {
                        "DeploymentType": "BLUE_GREEN",
                        "DeploymentOption": "WITH_TRAFFIC_CONTROL",
                    },
                    "BlueGreenDeploymentConfiguration": {
                        "DeploymentReadyOption": { "ActionOnTimeout": "CONTINUE_DEPLOYMENT", "WaitTimeInMinutes": 0 },
                        "TerminateBlueInstancesOnDeploymentSuccess": {
                            "Action": "TERMINATE",
                            "TerminationWaitTimeInMinutes": self.termination_wait_minutes,
                        },
                    },
                    "AutoRollbackConfiguration": {
                        "Enabled": true,
                        "Events": ["DEPLOYMENT_FAILURE", "DEPLOYMENT_STOP_ON_REQUEST"],
                    },
                    "ECSServices": [{
                        "ClusterName": self.cluster_name,
                        "ServiceName": self.service_name,
                    }],
                    "LoadBalancerInfo": {
                        "TargetGroupPairInfoList": [{
                            "TargetGroups": [
                                { "Name": self.blue_target_group },
                                { "Name": self.green_target_group },
                            ],
                            "ProdTrafficRoute": { "ListenerArns": [self.prod_listener_arn] },
                            "TestTrafficRoute": { "ListenerArns": [self.test_listener_arn] },
                        }],
                    },
                }),
            )
            .taggable(Tagging::List),
        )?;
        log::debug!("{}: deployment group {} ({})", stack.name(), self.deployment_group_name, logical);
        Ok(Expr::lit(&self.deployment_group_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Environment;
    use serde_json::json;

    #[test]
    fn test_deployment_group_binds_pairs() {
        let mut stack = Stack::new("Cd", Environment::default());
        let app = ecs_application(&mut stack, "App", "web-app").unwrap();
        let group = EcsDeploymentGroup {
            application_name: app,
            deployment_group_name: "web-dg".into(),
            service_role_arn: Expr::lit("arn:aws:iam::1:role/svc"),
            cluster_name: Expr::reference("Cluster"),
            service_name: Expr::get_att("Service", "Name"),
            blue_target_group: Expr::get_att("Blue", "TargetGroupName"),
            green_target_group: Expr::get_att("Green", "TargetGroupName"),
            prod_listener_arn: Expr::reference("Prod"),
            test_listener_arn: Expr::reference("Test"),
            deployment_config: ALL_AT_ONCE.into(),
            termination_wait_minutes: 0,
        };
        let name = group.build(&mut stack, "Dg").unwrap();
        assert_eq!(name, Expr::lit("web-dg"));

        let dg = stack.resource("Dg").unwrap();
        assert_eq!(dg.property("ApplicationName"), Some(&json!({"Ref": "App"})));
        assert_eq!(dg.property("DeploymentConfigName"), Some(&json!("CodeDeployDefault.ECSAllAtOnce")));
        let pair = &dg.property("LoadBalancerInfo").unwrap()["TargetGroupPairInfoList"][0];
        assert_eq!(pair["ProdTrafficRoute"]["ListenerArns"], json!([{"Ref": "Prod"}]));
        assert_eq!(pair["TargetGroups"][1]["Name"], json!({"Fn::GetAtt": ["Green", "TargetGroupName"]}));
        assert_eq!(dg.property("AutoRollbackConfiguration").unwrap()["Enabled"], json!(true));
    }
}

//! Fault Injection Simulator foundation and the ECS CPU-stress experiment.
//!
//! The experiment never looks its role or report bucket up: both are passed
//! in as the typed handles [`build_foundation`] returns.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constructs::bucket::{BucketProps, BucketRef, secure_bucket};
use crate::constructs::fis::{
    DataSources, ExperimentAction, ExperimentOptions, ExperimentTarget, ExperimentTemplate, LogConfiguration,
    ReportConfiguration, StopCondition,
};
use crate::constructs::iam::{PolicyStatement, Role, RoleRef, aws_managed_policy, grant};
use crate::constructs::logs::{self, log_group};
use crate::error::{InfraError, Result};
use crate::template::{Environment, Expr, RemovalPolicy, Stack, logical_id};

const DEFAULT_TRUST_POLICY: &str = include_str!("../../assets/fis-role-trust-policy.json");

pub const CPU_STRESS_ACTION_ID: &str = "aws:ecs:task-cpu-stress";
pub const CPU_STRESS_ACTION_DESCRIPTION: &str = "Stress CPU on ECS tasks";
pub const CPU_STRESS_DESCRIPTION: &str = "ECS CPU Stress Test Experiment Template";
pub const CPU_STRESS_NAME_TAG: &str = "my-ecs-cpu-stress-exp";
pub const REPORT_PREFIX: &str = "ecs-cpu-stress-test-reports";

/// Role the FIS service assumes to run experiments
#[derive(Debug, Clone, PartialEq)]
pub struct FisRole(RoleRef);

impl FisRole {
    pub fn arn(&self) -> &Expr {
        &self.0.arn
    }

    pub fn role(&self) -> &RoleRef {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct FisFoundation {
    pub role: FisRole,
    pub report_bucket: BucketRef,
}

/// Parse the role trust policy from `path`, or the bundled default
pub fn load_trust_policy(path: Option<&Path>) -> Result<Value> {
    let raw = match path {
        Some(path) => fs::read_to_string(path)?,
        None => DEFAULT_TRUST_POLICY.to_string(),
    };
    Ok(serde_json::from_str(&raw)?)
}

/// Emit the FIS execution role and the experiment report bucket.
pub fn build_foundation(stack: &mut Stack, trust_policy: Value) -> Result<FisFoundation> {
    let bucket_name = stack
        .env()
        .sub("fis-experiment-report-bucket-${AWS::AccountId}-${AWS::Region}");
    let bucket = secure_bucket(stack, "FISExperimentReportBucket", BucketProps::named(bucket_name))?;

    let role = Role::with_trust_document(trust_policy)
        .with_managed_policy(aws_managed_policy("service-role/AWSFaultInjectionSimulatorECSAccess"))
        .with_statement(
            PolicyStatement::allow(&[
                "logs:CreateLogDelivery",
                "logs:CreateLogStream",
                "logs:PutLogEvents",
                "logs:CreateLogGroup",
                "logs:DescribeLogGroups",
                "logs:DescribeLogStreams",
            ])
            .on_all(),
        )
        .with_statement(PolicyStatement::allow(&["logs:PutResourcePolicy", "logs:DescribeResourcePolicies"]).on_all())
        .with_statement(PolicyStatement::allow(&["ecs:DescribeTasks"]).on_all())
        .with_statement(PolicyStatement::allow(&["ssm:SendCommand", "ssm:ListCommands", "ssm:CancelCommand"]).on_all())
        .with_statement(
            PolicyStatement::allow(&["s3:PutObject", "s3:GetObject", "s3:GetBucketLocation", "s3:ListBucket"])
                .on(bucket.arn.clone())
                .on(bucket.objects_arn()),
        )
        .build(stack, "FISRole")?;

    Ok(FisFoundation {
        role: FisRole(role),
        report_bucket: bucket,
    })
}

/// One CPU-stress action. The action id and description are fixed, so
/// configuration cannot name them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct CpuStressAction {
    pub parameters: BTreeMap<String, String>,
    pub targets: BTreeMap<String, String>,
    pub start_after: Vec<String>,
}

impl Default for CpuStressAction {
    fn default() -> Self {
        Self {
            parameters: [
                ("duration".to_string(), "PT5M".to_string()),
                ("percent".to_string(), "80".to_string()),
            ]
            .into(),
            targets: [("Tasks".to_string(), "ecsTaskTarget".to_string())].into(),
            start_after: Vec::new(),
        }
    }
}

impl CpuStressAction {
    fn to_action(&self) -> ExperimentAction {
        ExperimentAction {
            action_id: CPU_STRESS_ACTION_ID.to_string(),
            description: Some(CPU_STRESS_ACTION_DESCRIPTION.to_string()),
            parameters: self.parameters.clone(),
            targets: self.targets.clone(),
            start_after: self.start_after.clone(),
        }
    }
}

/// Report settings a caller may choose; where the report goes is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ReportOptions {
    pub data_sources: Option<DataSources>,
    pub pre_experiment_duration: String,
    pub post_experiment_duration: String,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            data_sources: None,
            pre_experiment_duration: "PT15M".to_string(),
            post_experiment_duration: "PT15M".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuStressExperiment {
    pub targets: BTreeMap<String, ExperimentTarget>,
    pub actions: BTreeMap<String, CpuStressAction>,
    pub stop_conditions: Vec<StopCondition>,
    pub report: Option<ReportOptions>,
    pub options: Option<ExperimentOptions>,
}

impl CpuStressExperiment {
    fn template(
        &self,
        env: &Environment,
        role: &FisRole,
        bucket: &BucketRef,
        log_group_arn: Expr,
    ) -> ExperimentTemplate {
        ExperimentTemplate {
            description: CPU_STRESS_DESCRIPTION.to_string(),
            role_arn: role.arn().clone(),
            targets: self.targets.clone(),
            actions: self.actions.iter().map(|(name, a)| (name.clone(), a.to_action())).collect(),
            stop_conditions: self.stop_conditions.clone(),
            report: self.report.as_ref().map(|report| ReportConfiguration {
                data_sources: report.data_sources.as_ref().map(|sources| DataSources {
                    cloud_watch_dashboards: sources.cloud_watch_dashboards.iter().map(|id| env.substitute(id)).collect(),
                }),
                pre_experiment_duration: report.pre_experiment_duration.clone(),
                post_experiment_duration: report.post_experiment_duration.clone(),
                bucket_name: bucket.name.clone(),
                prefix: REPORT_PREFIX.to_string(),
            }),
            log: Some(LogConfiguration {
                log_group_arn,
                schema_version: 1,
            }),
            options: self.options.clone(),
            tags: [("Name".to_string(), CPU_STRESS_NAME_TAG.to_string())].into(),
        }
    }

    fn dashboards(&self) -> Option<&[String]> {
        self.report
            .as_ref()
            .and_then(|r| r.data_sources.as_ref())
            .map(|d| d.cloud_watch_dashboards.as_slice())
    }

    /// Validate, then emit the log group, dashboard grants and the template.
    pub fn build(&self, stack: &mut Stack, id: &str, role: &FisRole, bucket: &BucketRef) -> Result<String> {
        if self.dashboards().is_some_and(<[String]>::is_empty) {
            return Err(InfraError::Config(format!(
                "experiment {} lists report data sources without any dashboard",
                id
            )));
        }

        let log_id = format!("{}LogGroup", id);
        let env = stack.env().clone();
        let template = self.template(&env, role, bucket, Expr::get_att(logical_id(&log_id), "Arn"));
        template.validate()?;

        log_group(
            stack,
            &log_id,
            Some(&format!("/aws/fis/{}", id)),
            logs::ONE_WEEK,
            RemovalPolicy::Delete,
        )?;

        // Granted on the identifier exactly as the report renders it.
        let first_dashboard = template
            .report
            .as_ref()
            .and_then(|r| r.data_sources.as_ref())
            .and_then(|d| d.cloud_watch_dashboards.first())
            .map(Expr::sub);
        if let Some(dashboard) = first_dashboard {
            grant(
                stack,
                &format!("{}DashboardPolicy", id),
                role.role(),
                &[
                    PolicyStatement::allow(&["cloudwatch:GetDashboard"]).on(dashboard),
                    PolicyStatement::allow(&["cloudwatch:GetMetricWidgetImage"]).on_all(),
                ],
            )?;
        }

        let logical = template.build(stack, id)?;
        log::info!("{}: CPU stress experiment {}", stack.name(), logical);
        Ok(logical)
    }
}

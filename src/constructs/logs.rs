//! CloudWatch log groups.

use serde_json::json;

use crate::error::Result;
use crate::template::{Expr, RemovalPolicy, Resource, Stack, Tagging};

pub const ONE_WEEK: u32 = 7;
pub const ONE_MONTH: u32 = 30;
pub const ONE_YEAR: u32 = 365;

/// Retention periods CloudWatch accepts
const RETENTION_DAYS: &[u32] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922, 3288, 3653,
];

#[derive(Debug, Clone, PartialEq)]
pub struct LogGroupRef {
    pub logical_id: String,
    pub name: Expr,
    pub arn: Expr,
}

/// Emit a log group. An unnamed group gets a generated name.
pub fn log_group(
    stack: &mut Stack,
    id: &str,
    name: Option<&str>,
    retention_days: u32,
    removal: RemovalPolicy,
) -> Result<LogGroupRef> {
    if !RETENTION_DAYS.contains(&retention_days) {
        return Err(crate::error::InfraError::Config(format!(
            "{} days is not a valid log retention period",
            retention_days
        )));
    }
    let mut properties = json!({ "RetentionInDays": retention_days });
    if let Some(name) = name {
        properties["LogGroupName"] = json!(name);
    }
    let logical = stack.add(
        id,
        Resource::new("AWS::Logs::LogGroup", properties)
            .with_removal_policy(removal)
            .taggable(Tagging::List),
    )?;
    Ok(LogGroupRef {
        name: Expr::reference(&logical),
        arn: Expr::get_att(&logical, "Arn"),
        logical_id: logical,
    })
}

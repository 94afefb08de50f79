//! IAM roles, policy statements and grants.
//!
//! Roles are emitted as `AWS::IAM::Role` with their statements in a separate
//! `AWS::IAM::Policy`. Grants made after a role exists (or to a role that
//! lives in another stack and is only known by name) are emitted as their own
//! `AWS::IAM::Policy` attached by role name, so no stack ever needs a live
//! handle on a role it does not own.

use serde_json::{Value, json};

use crate::error::Result;
use crate::template::{Environment, Expr, Resource, Stack, Tagging};

/// Policy document version used everywhere
pub const POLICY_VERSION: &str = "2012-10-17";

/// ARN of an AWS managed policy, e.g. `service-role/AmazonECSTaskExecutionRolePolicy`
pub fn aws_managed_policy(name: &str) -> Expr {
    Expr::lit(format!("arn:aws:iam::aws:policy/{}", name))
}

/// One `Allow` statement of a policy document
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<Expr>,
    pub condition: Option<Value>,
}

impl PolicyStatement {
    pub fn allow(actions: &[&str]) -> Self {
        Self {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources: Vec::new(),
            condition: None,
        }
    }

    pub fn on(mut self, resource: impl Into<Expr>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn on_all(self) -> Self {
        self.on("*")
    }

    pub fn with_condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn to_json(&self) -> Value {
        let mut statement = json!({
            "Effect": "Allow",
            "Action": one_or_many(self.actions.iter().map(|a| json!(a)).collect()),
            "Resource": one_or_many(self.resources.iter().map(Expr::to_json).collect()),
        });
        if let Some(condition) = &self.condition {
            statement["Condition"] = condition.clone();
        }
        statement
    }
}

fn one_or_many(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.remove(0)
    } else {
        Value::Array(values)
    }
}

/// Render statements as a policy document
pub fn policy_document(statements: &[PolicyStatement]) -> Value {
    json!({
        "Version": POLICY_VERSION,
        "Statement": statements.iter().map(PolicyStatement::to_json).collect::<Vec<_>>(),
    })
}

/// Trust policy letting the given service principals assume a role
pub fn service_trust_policy(services: &[&str]) -> Value {
    let principals: Vec<Value> = services.iter().map(|s| json!(s)).collect();
    json!({
        "Version": POLICY_VERSION,
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": one_or_many(principals) },
            "Action": "sts:AssumeRole",
        }],
    })
}

/// A role known by value: name and ARN, plus its logical ID when it is
/// defined in the stack at hand.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRef {
    pub logical_id: Option<String>,
    pub name: Expr,
    pub arn: Expr,
}

impl RoleRef {
    /// Refer to a role owned elsewhere by its literal name
    pub fn from_name(env: &Environment, name: &str) -> Self {
        Self {
            logical_id: None,
            name: Expr::lit(name),
            arn: env.sub(&format!("arn:aws:iam::${{AWS::AccountId}}:role/{}", name)),
        }
    }
}

/// Role builder
#[derive(Debug, Clone)]
pub struct Role {
    role_name: Option<String>,
    description: Option<String>,
    trust: Value,
    managed_policies: Vec<Expr>,
    statements: Vec<PolicyStatement>,
}

impl Role {
    pub fn assumed_by(services: &[&str]) -> Self {
        Self::with_trust_document(service_trust_policy(services))
    }

    /// Use a complete trust document instead of a principal list
    pub fn with_trust_document(trust: Value) -> Self {
        Self {
            role_name: None,
            description: None,
            trust,
            managed_policies: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.role_name = Some(name.into());
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_managed_policy(mut self, arn: impl Into<Expr>) -> Self {
        self.managed_policies.push(arn.into());
        self
    }

    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn add_to_policy(&mut self, statement: PolicyStatement) {
        self.statements.push(statement);
    }

    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    /// Emit the role (and its default policy when it has statements)
    pub fn build(self, stack: &mut Stack, id: &str) -> Result<RoleRef> {
        let mut properties = json!({ "AssumeRolePolicyDocument": self.trust });
        if let Some(name) = &self.role_name {
            properties["RoleName"] = json!(name);
        }
        if let Some(description) = &self.description {
            properties["Description"] = json!(description);
        }
        if !self.managed_policies.is_empty() {
            properties["ManagedPolicyArns"] = json!(self.managed_policies);
        }

        let logical = stack.add(id, Resource::new("AWS::IAM::Role", properties).taggable(Tagging::List))?;
        let role = RoleRef {
            logical_id: Some(logical.clone()),
            name: Expr::reference(&logical),
            arn: Expr::get_att(&logical, "Arn"),
        };

        if !self.statements.is_empty() {
            grant(stack, &format!("{}DefaultPolicy", logical), &role, &self.statements)?;
        }
        Ok(role)
    }
}

/// Attach `statements` to `role` through a standalone policy resource.
pub fn grant(stack: &mut Stack, id: &str, role: &RoleRef, statements: &[PolicyStatement]) -> Result<String> {
    let policy_name = crate::template::logical_id(id);
    stack.add(
        id,
        Resource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyName": policy_name,
                "PolicyDocument": policy_document(statements),
                "Roles": [role.name],
            }),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> Stack {
        Stack::new("IamTest", Environment::new("123456789012", "us-west-2"))
    }

    #[test]
    fn test_single_action_renders_as_string() {
        let stmt = PolicyStatement::allow(&["s3:GetObject"]).on("arn:aws:s3:::b/k");
        let rendered = stmt.to_json();
        assert_eq!(rendered["Action"], json!("s3:GetObject"));
        assert_eq!(rendered["Resource"], json!("arn:aws:s3:::b/k"));
        assert_eq!(rendered["Effect"], json!("Allow"));
        assert!(rendered.get("Condition").is_none());
    }

    #[test]
    fn test_multiple_actions_render_as_list() {
        let stmt = PolicyStatement::allow(&["s3:ListBucket", "s3:GetBucketLocation"]).on_all();
        assert_eq!(stmt.to_json()["Action"], json!(["s3:ListBucket", "s3:GetBucketLocation"]));
    }

    #[test]
    fn test_condition_rendered() {
        let stmt = PolicyStatement::allow(&["iam:PassRole"])
            .on("arn:aws:iam::1:role/r")
            .with_condition(json!({"StringEquals": {"iam:PassedToService": ["ecs.amazonaws.com"]}}));
        assert_eq!(
            stmt.to_json()["Condition"]["StringEquals"]["iam:PassedToService"],
            json!(["ecs.amazonaws.com"])
        );
    }

    #[test]
    fn test_trust_policy_principals() {
        let single = service_trust_policy(&["ecs-tasks.amazonaws.com"]);
        assert_eq!(single["Statement"][0]["Principal"]["Service"], json!("ecs-tasks.amazonaws.com"));

        let composite = service_trust_policy(&["ecs.amazonaws.com", "codedeploy.amazonaws.com"]);
        assert_eq!(
            composite["Statement"][0]["Principal"]["Service"],
            json!(["ecs.amazonaws.com", "codedeploy.amazonaws.com"])
        );
    }

    #[test]
    fn test_role_build_emits_role_and_default_policy() {
        let mut stack = stack();
        let role = Role::assumed_by(&["lambda.amazonaws.com"])
            .named("fn-role")
            .with_managed_policy(aws_managed_policy("service-role/AWSLambdaBasicExecutionRole"))
            .with_statement(PolicyStatement::allow(&["ec2:DescribeNetworkInterfaces"]).on_all())
            .build(&mut stack, "FnRole")
            .unwrap();

        assert_eq!(role.arn, Expr::get_att("FnRole", "Arn"));
        let rendered = stack.resource("FnRole").unwrap().render(&Default::default());
        assert_eq!(rendered["Properties"]["RoleName"], json!("fn-role"));
        assert_eq!(
            rendered["Properties"]["ManagedPolicyArns"],
            json!(["arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"])
        );

        let policy = stack.resource("FnRoleDefaultPolicy").unwrap();
        assert_eq!(policy.resource_type, "AWS::IAM::Policy");
        assert_eq!(policy.property("Roles"), Some(&json!([{"Ref": "FnRole"}])));
    }

    #[test]
    fn test_role_without_statements_has_no_policy() {
        let mut stack = stack();
        Role::assumed_by(&["ecs-tasks.amazonaws.com"]).build(&mut stack, "TaskRole").unwrap();
        assert!(stack.resource("TaskRoleDefaultPolicy").is_none());
    }

    #[test]
    fn test_role_ref_from_name_is_by_value() {
        let env = Environment::new("123456789012", "us-west-2");
        let role = RoleRef::from_name(&env, "demo-ecs-task-role");
        assert_eq!(role.name, Expr::lit("demo-ecs-task-role"));
        assert_eq!(role.arn.as_literal().unwrap(), "arn:aws:iam::123456789012:role/demo-ecs-task-role");
        assert!(role.logical_id.is_none());
    }

    #[test]
    fn test_grant_attaches_by_name() {
        let mut stack = stack();
        let env = stack.env().clone();
        let role = RoleRef::from_name(&env, "imported");
        grant(&mut stack, "ImportedGrant", &role, &[PolicyStatement::allow(&["ssm:CreateActivation"]).on_all()])
            .unwrap();
        let policy = stack.resource("ImportedGrant").unwrap();
        assert_eq!(policy.property("Roles"), Some(&json!(["imported"])));
    }
}

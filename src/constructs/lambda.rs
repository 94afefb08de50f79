//! Inline-code Lambda functions, schedules and invoke permissions.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::Result;
use crate::template::{Expr, Resource, Stack, Tagging};

pub const PYTHON_RUNTIME: &str = "python3.12";

/// A function whose source is embedded in the template (`Code.ZipFile`)
#[derive(Debug, Clone)]
pub struct InlineFunction {
    pub function_name: Option<String>,
    pub runtime: String,
    pub handler: String,
    pub code: String,
    pub timeout_secs: u32,
    pub memory_mib: u32,
    pub role_arn: Expr,
    pub environment: BTreeMap<String, Expr>,
    pub subnets: Vec<Expr>,
    pub security_groups: Vec<Expr>,
}

impl InlineFunction {
    pub fn python(code: impl Into<String>, role_arn: Expr) -> Self {
        Self {
            function_name: None,
            runtime: PYTHON_RUNTIME.to_string(),
            handler: "index.handler".to_string(),
            code: code.into(),
            timeout_secs: 3,
            memory_mib: 128,
            role_arn,
            environment: BTreeMap::new(),
            subnets: Vec::new(),
            security_groups: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn in_vpc(mut self, subnets: Vec<Expr>, security_groups: Vec<Expr>) -> Self {
        self.subnets = subnets;
        self.security_groups = security_groups;
        self
    }

    /// Emit the function. `depends_on` lists resources (usually the role's
    /// policy) that must exist before the function is created.
    pub fn build(&self, stack: &mut Stack, id: &str, depends_on: &[String]) -> Result<FunctionRef> {
        let mut properties = json!({
            "Runtime": self.runtime,
            "Handler": self.handler,
            "Code": { "ZipFile": self.code },
            "Timeout": self.timeout_secs,
            "MemorySize": self.memory_mib,
            "Role": self.role_arn,
        });
        if let Some(name) = &self.function_name {
            properties["FunctionName"] = json!(name);
        }
        if !self.environment.is_empty() {
            properties["Environment"] = json!({ "Variables": self.environment });
        }
        if !self.subnets.is_empty() {
            properties["VpcConfig"] = json!({
                "SubnetIds": self.subnets,
                "SecurityGroupIds": self.security_groups,
            });
        }

        let mut resource = Resource::new("AWS::Lambda::Function", properties).taggable(Tagging::List);
        for dependency in depends_on {
            resource = resource.depends_on(dependency.clone());
        }
        let logical = stack.add(id, resource)?;
        Ok(FunctionRef {
            name: Expr::reference(&logical),
            arn: Expr::get_att(&logical, "Arn"),
            logical_id: logical,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRef {
    pub logical_id: String,
    pub name: Expr,
    pub arn: Expr,
}

/// Build a JSON object string whose values may be unresolved expressions.
/// Renders as a literal when every value is known, else as `Fn::Join`.
/// Keys and known values are JSON-escaped; tokens resolve to ARNs and names.
pub fn json_string(fields: &[(&str, Expr)]) -> Expr {
    let mut parts = vec![Expr::lit("{")];
    for (i, (key, value)) in fields.iter().enumerate() {
        let separator = if i == 0 { "" } else { "," };
        let key = Value::from(*key);
        match value.as_literal() {
            Some(literal) => parts.push(Expr::lit(format!("{}{}:{}", separator, key, Value::from(literal)))),
            None => {
                parts.push(Expr::lit(format!("{}{}:\"", separator, key)));
                parts.push(value.clone());
                parts.push(Expr::lit("\""));
            }
        }
    }
    parts.push(Expr::lit("}"));
    Expr::join("", parts)
}

/// EventBridge rule invoking `target_arn` on a fixed rate
pub fn schedule_rule(
    stack: &mut Stack,
    id: &str,
    rate_minutes: u32,
    target_arn: &Expr,
    input: Expr,
) -> Result<String> {
    let unit = if rate_minutes == 1 { "minute" } else { "minutes" };
    stack.add(
        id,
        Resource::new(
            "AWS::Events::Rule",
            json!({
                "ScheduleExpression": format!("rate({} {})", rate_minutes, unit),
                "State": "ENABLED",
                "Targets": [{
                    "Arn": target_arn,
                    "Id": "Target0",
                    "Input": input,
                }],
            }),
        ),
    )
}

/// Allow `principal` to invoke the function, optionally scoped to a source ARN
pub fn invoke_permission(
    stack: &mut Stack,
    id: &str,
    function_arn: &Expr,
    principal: &str,
    source_arn: Option<Expr>,
) -> Result<String> {
    let mut properties = json!({
        "Action": "lambda:InvokeFunction",
        "FunctionName": function_arn,
        "Principal": principal,
    });
    if let Some(source_arn) = source_arn {
        properties["SourceArn"] = source_arn.to_json();
    }
    stack.add(id, Resource::new("AWS::Lambda::Permission", properties))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Environment;

    #[test]
    fn test_json_string_literal() {
        let input = json_string(&[("a", Expr::lit("1")), ("b", Expr::lit("2"))]);
        let literal = input.as_literal().unwrap();
        assert_eq!(literal, r#"{"a":"1","b":"2"}"#);
        let parsed: serde_json::Value = serde_json::from_str(&literal).unwrap();
        assert_eq!(parsed["b"], json!("2"));
    }

    #[test]
    fn test_json_string_escapes_literals() {
        let input = json_string(&[("path", Expr::lit(r#"/a"b\c"#)), ("note", Expr::reference("Nlb"))]);
        let parts = match &input {
            Expr::Join(_, parts) => parts.clone(),
            other => panic!("expected join, got {:?}", other),
        };
        assert_eq!(parts[1], Expr::lit(r#""path":"/a\"b\\c""#));

        let literal = json_string(&[("path", Expr::lit(r#"/a"b\c"#))]).as_literal().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&literal).unwrap();
        assert_eq!(parsed["path"], json!(r#"/a"b\c"#));
    }

    #[test]
    fn test_json_string_with_tokens() {
        let input = json_string(&[("TargetGroupARN", Expr::reference("Tg"))]);
        assert!(!input.is_resolved());
        assert_eq!(
            input.to_json(),
            json!({"Fn::Join": ["", ["{", "\"TargetGroupARN\":\"", {"Ref": "Tg"}, "\"", "}"]]})
        );
    }

    #[test]
    fn test_function_build() {
        let mut stack = Stack::new("Fn", Environment::default());
        let function = InlineFunction::python("def handler(e, c): pass", Expr::get_att("Role", "Arn"))
            .named("refresh")
            .timeout_secs(60)
            .in_vpc(vec![Expr::lit("subnet-1")], vec![Expr::lit("sg-1")])
            .build(&mut stack, "Refresh", &["RoleDefaultPolicy".to_string()])
            .unwrap();
        assert_eq!(function.arn, Expr::get_att("Refresh", "Arn"));

        let rendered = stack.resource("Refresh").unwrap().render(&Default::default());
        assert_eq!(rendered["Properties"]["Timeout"], json!(60));
        assert_eq!(rendered["Properties"]["Handler"], json!("index.handler"));
        assert_eq!(rendered["Properties"]["VpcConfig"]["SubnetIds"], json!(["subnet-1"]));
        assert_eq!(rendered["DependsOn"], json!(["RoleDefaultPolicy"]));
    }

    #[test]
    fn test_schedule_rule_rate() {
        let mut stack = Stack::new("Fn", Environment::default());
        schedule_rule(&mut stack, "Every5", 5, &Expr::get_att("Fn", "Arn"), Expr::lit("{}")).unwrap();
        schedule_rule(&mut stack, "Every1", 1, &Expr::get_att("Fn", "Arn"), Expr::lit("{}")).unwrap();
        assert_eq!(
            stack.resource("Every5").unwrap().property("ScheduleExpression"),
            Some(&json!("rate(5 minutes)"))
        );
        assert_eq!(
            stack.resource("Every1").unwrap().property("ScheduleExpression"),
            Some(&json!("rate(1 minute)"))
        );
    }
}

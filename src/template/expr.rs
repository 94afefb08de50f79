//! CloudFormation intrinsic expressions.
//!
//! An [`Expr`] is any value a template property can hold: a literal string or
//! one of the intrinsic functions the builders need. Expressions serialize to
//! the JSON shape CloudFormation expects, so they can be dropped straight into
//! `serde_json::json!` property objects.

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// Pseudo parameter for the deploying account
pub const ACCOUNT_ID: &str = "AWS::AccountId";

/// Pseudo parameter for the deploying region
pub const REGION: &str = "AWS::Region";

/// A CloudFormation value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Plain string
    Literal(String),
    /// `{"Ref": id}`
    Ref(String),
    /// `{"Fn::GetAtt": [id, attribute]}`
    GetAtt(String, String),
    /// `{"Fn::Join": [separator, parts]}`
    Join(String, Vec<Expr>),
    /// `{"Fn::Sub": template}`
    Sub(String),
    /// `{"Fn::ImportValue": name}`
    ImportValue(String),
    /// `{"Fn::Select": [index, list]}`
    Select(usize, Box<Expr>),
    /// `{"Fn::GetAZs": ""}`
    GetAzs,
}

impl Expr {
    pub fn lit(value: impl Into<String>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn reference(logical_id: impl Into<String>) -> Self {
        Expr::Ref(logical_id.into())
    }

    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Expr::GetAtt(logical_id.into(), attribute.into())
    }

    pub fn join(separator: impl Into<String>, parts: Vec<Expr>) -> Self {
        Expr::Join(separator.into(), parts)
    }

    pub fn sub(template: impl Into<String>) -> Self {
        Expr::Sub(template.into())
    }

    pub fn import(export_name: impl Into<String>) -> Self {
        Expr::ImportValue(export_name.into())
    }

    pub fn account_id() -> Self {
        Expr::Ref(ACCOUNT_ID.to_string())
    }

    pub fn region() -> Self {
        Expr::Ref(REGION.to_string())
    }

    /// The `index`-th availability zone of the stack's region
    pub fn availability_zone(index: usize) -> Self {
        Expr::Select(index, Box::new(Expr::GetAzs))
    }

    /// True when the value is known at composition time.
    pub fn is_resolved(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Sub(template) => !template.contains("${"),
            Expr::Join(_, parts) => parts.iter().all(Expr::is_resolved),
            _ => false,
        }
    }

    /// The concrete string, if the value is resolved
    pub fn as_literal(&self) -> Option<String> {
        match self {
            Expr::Literal(value) => Some(value.clone()),
            Expr::Sub(template) if !template.contains("${") => Some(template.clone()),
            Expr::Join(separator, parts) => {
                let resolved: Option<Vec<String>> = parts.iter().map(Expr::as_literal).collect();
                resolved.map(|parts| parts.join(separator))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        if let Some(literal) = self.as_literal() {
            return Value::String(literal);
        }
        match self {
            Expr::Literal(value) => Value::String(value.clone()),
            Expr::Ref(id) => json!({ "Ref": id }),
            Expr::GetAtt(id, attribute) => json!({ "Fn::GetAtt": [id, attribute] }),
            Expr::Join(separator, parts) => {
                let parts: Vec<Value> = parts.iter().map(Expr::to_json).collect();
                json!({ "Fn::Join": [separator, parts] })
            }
            Expr::Sub(template) => json!({ "Fn::Sub": template }),
            Expr::ImportValue(name) => json!({ "Fn::ImportValue": name }),
            Expr::Select(index, list) => json!({ "Fn::Select": [index.to_string(), list.to_json()] }),
            Expr::GetAzs => json!({ "Fn::GetAZs": "" }),
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(value.to_string())
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Literal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_serializes_as_string() {
        assert_eq!(Expr::lit("abc").to_json(), json!("abc"));
    }

    #[test]
    fn test_ref_and_get_att() {
        assert_eq!(Expr::reference("Vpc").to_json(), json!({"Ref": "Vpc"}));
        assert_eq!(
            Expr::get_att("Role", "Arn").to_json(),
            json!({"Fn::GetAtt": ["Role", "Arn"]})
        );
    }

    #[test]
    fn test_sub_without_placeholders_is_literal() {
        let expr = Expr::sub("arn:aws:iam::123456789012:role/x");
        assert!(expr.is_resolved());
        assert_eq!(expr.to_json(), json!("arn:aws:iam::123456789012:role/x"));
    }

    #[test]
    fn test_sub_with_placeholder_is_unresolved() {
        let expr = Expr::sub("arn:aws:iam::${AWS::AccountId}:role/x");
        assert!(!expr.is_resolved());
        assert_eq!(expr.to_json(), json!({"Fn::Sub": "arn:aws:iam::${AWS::AccountId}:role/x"}));
    }

    #[test]
    fn test_join_of_literals_collapses() {
        let expr = Expr::join("/", vec![Expr::lit("a"), Expr::lit("b")]);
        assert_eq!(expr.to_json(), json!("a/b"));
    }

    #[test]
    fn test_join_with_import_stays_intrinsic() {
        let expr = Expr::join("", vec![Expr::lit("arn:aws:s3:::bucket/"), Expr::import("svc-key")]);
        assert!(!expr.is_resolved());
        assert_eq!(
            expr.to_json(),
            json!({"Fn::Join": ["", ["arn:aws:s3:::bucket/", {"Fn::ImportValue": "svc-key"}]]})
        );
    }

    #[test]
    fn test_availability_zone_select() {
        assert_eq!(
            Expr::availability_zone(1).to_json(),
            json!({"Fn::Select": ["1", {"Fn::GetAZs": ""}]})
        );
    }

    #[test]
    fn test_expr_inside_json_macro() {
        let vpc = Expr::reference("Vpc");
        let props = json!({ "VpcId": vpc });
        assert_eq!(props["VpcId"], json!({"Ref": "Vpc"}));
    }
}

//! S3 buckets with enforced safety defaults.
//!
//! Every bucket this crate creates blocks all public access, carries no
//! explicit encryption configuration, is deleted with its stack and is
//! emptied on teardown by a shared custom resource. Extra properties passed by
//! the caller are applied first and the defaults are re-imposed on top, so no
//! override can switch them off.

use serde_json::{Map, Value, json};

use crate::error::Result;
use crate::template::{Expr, RemovalPolicy, Resource, Stack, Tagging};

use super::iam::{PolicyStatement, Role, RoleRef, aws_managed_policy, grant};
use super::lambda::{FunctionRef, InlineFunction};

const AUTO_DELETE_CODE: &str = include_str!("../../assets/lambda/empty_bucket.py");
const AUTO_DELETE_PROVIDER: &str = "AutoDeleteObjectsProvider";
const AUTO_DELETE_ROLE: &str = "AutoDeleteObjectsProviderRole";
pub const AUTO_DELETE_TYPE: &str = "Custom::S3AutoDeleteObjects";

#[derive(Debug, Clone, Default)]
pub struct BucketProps {
    pub bucket_name: Option<Expr>,
    pub versioned: bool,
    /// Additional raw properties; the safety defaults win over these
    pub overrides: Map<String, Value>,
}

impl BucketProps {
    pub fn named(name: impl Into<Expr>) -> Self {
        Self {
            bucket_name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// A bucket known by value
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRef {
    pub logical_id: Option<String>,
    pub name: Expr,
    pub arn: Expr,
}

impl BucketRef {
    /// Refer to a bucket by name only
    pub fn from_name(name: impl Into<Expr>) -> Self {
        let name = name.into();
        Self {
            logical_id: None,
            arn: Expr::join("", vec![Expr::lit("arn:aws:s3:::"), name.clone()]),
            name,
        }
    }

    /// The same bucket without any tie to the defining stack's logical IDs
    pub fn by_value(&self) -> Result<BucketRef> {
        match self.name.as_literal() {
            Some(name) => Ok(BucketRef::from_name(name)),
            None => Err(crate::error::InfraError::Config(
                "bucket must have a literal name to be shared across stacks".to_string(),
            )),
        }
    }

    /// ARN of every object in the bucket
    pub fn objects_arn(&self) -> Expr {
        self.object_arn(Expr::lit("*"))
    }

    pub fn object_arn(&self, key: Expr) -> Expr {
        Expr::join("", vec![self.arn.clone(), Expr::lit("/"), key])
    }
}

/// Create a bucket with the enforced defaults.
pub fn secure_bucket(stack: &mut Stack, id: &str, props: BucketProps) -> Result<BucketRef> {
    let mut properties = props.overrides;
    properties.remove("BucketEncryption");
    properties.insert(
        "PublicAccessBlockConfiguration".to_string(),
        json!({
            "BlockPublicAcls": true,
            "BlockPublicPolicy": true,
            "IgnorePublicAcls": true,
            "RestrictPublicBuckets": true,
        }),
    );
    if let Some(name) = &props.bucket_name {
        properties.insert("BucketName".to_string(), name.to_json());
    }
    if props.versioned {
        properties.insert("VersioningConfiguration".to_string(), json!({ "Status": "Enabled" }));
    }

    let logical = stack.add(
        id,
        Resource::new("AWS::S3::Bucket", Value::Object(properties))
            .with_removal_policy(RemovalPolicy::Delete)
            .taggable(Tagging::List),
    )?;
    let bucket = BucketRef {
        logical_id: Some(logical.clone()),
        name: Expr::reference(&logical),
        arn: Expr::get_att(&logical, "Arn"),
    };

    auto_delete_objects(stack, &logical, &bucket)?;
    Ok(match &props.bucket_name {
        Some(name) if name.is_resolved() => BucketRef {
            name: name.clone(),
            ..bucket
        },
        _ => bucket,
    })
}

fn auto_delete_objects(stack: &mut Stack, logical: &str, bucket: &BucketRef) -> Result<()> {
    let (role, provider) = auto_delete_provider(stack)?;
    let policy = grant(
        stack,
        &format!("{}AutoDeletePolicy", logical),
        &role,
        &[PolicyStatement::allow(&["s3:GetBucket*", "s3:List*", "s3:DeleteObject*"])
            .on(bucket.arn.clone())
            .on(bucket.objects_arn())],
    )?;
    stack.add(
        &format!("{}AutoDeleteObjects", logical),
        Resource::new(
            AUTO_DELETE_TYPE,
            json!({
                "ServiceToken": provider.arn,
                "BucketName": bucket.name,
            }),
        )
        .with_removal_policy(RemovalPolicy::Delete)
        .depends_on(policy),
    )?;
    Ok(())
}

/// The provider function is shared by every bucket of a stack.
fn auto_delete_provider(stack: &mut Stack) -> Result<(RoleRef, FunctionRef)> {
    let role = RoleRef {
        logical_id: Some(AUTO_DELETE_ROLE.to_string()),
        name: Expr::reference(AUTO_DELETE_ROLE),
        arn: Expr::get_att(AUTO_DELETE_ROLE, "Arn"),
    };
    let function = FunctionRef {
        logical_id: AUTO_DELETE_PROVIDER.to_string(),
        name: Expr::reference(AUTO_DELETE_PROVIDER),
        arn: Expr::get_att(AUTO_DELETE_PROVIDER, "Arn"),
    };
    if stack.contains(AUTO_DELETE_PROVIDER) {
        return Ok((role, function));
    }

    Role::assumed_by(&["lambda.amazonaws.com"])
        .with_managed_policy(aws_managed_policy("service-role/AWSLambdaBasicExecutionRole"))
        .build(stack, AUTO_DELETE_ROLE)?;
    InlineFunction::python(AUTO_DELETE_CODE, role.arn.clone())
        .timeout_secs(900)
        .build(stack, AUTO_DELETE_PROVIDER, &[])?;
    Ok((role, function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Environment;

    fn stack() -> Stack {
        Stack::new("Buckets", Environment::new("123456789012", "us-west-2"))
    }

    #[test]
    fn test_defaults_enforced() {
        let mut stack = stack();
        let bucket = secure_bucket(&mut stack, "Artifacts", BucketProps::default()).unwrap();
        assert_eq!(bucket.name, Expr::reference("Artifacts"));

        let rendered = stack.resource("Artifacts").unwrap().render(&Default::default());
        let block = &rendered["Properties"]["PublicAccessBlockConfiguration"];
        for flag in ["BlockPublicAcls", "BlockPublicPolicy", "IgnorePublicAcls", "RestrictPublicBuckets"] {
            assert_eq!(block[flag], json!(true), "{flag}");
        }
        assert!(rendered["Properties"].get("BucketEncryption").is_none());
        assert_eq!(rendered["DeletionPolicy"], json!("Delete"));
        assert_eq!(rendered["UpdateReplacePolicy"], json!("Delete"));

        let custom = stack.resource("ArtifactsAutoDeleteObjects").unwrap();
        assert_eq!(custom.resource_type, AUTO_DELETE_TYPE);
        assert_eq!(custom.property("BucketName"), Some(&json!({"Ref": "Artifacts"})));
    }

    #[test]
    fn test_overrides_cannot_disable_defaults() {
        let mut stack = stack();
        let mut overrides = Map::new();
        overrides.insert("BucketEncryption".into(), json!({"ServerSideEncryptionConfiguration": []}));
        overrides.insert(
            "PublicAccessBlockConfiguration".into(),
            json!({"BlockPublicAcls": false, "BlockPublicPolicy": false}),
        );
        overrides.insert("ObjectLockEnabled".into(), json!(false));
        secure_bucket(
            &mut stack,
            "Loose",
            BucketProps {
                overrides,
                ..Default::default()
            },
        )
        .unwrap();

        let resource = stack.resource("Loose").unwrap();
        assert!(resource.property("BucketEncryption").is_none());
        assert_eq!(
            resource.property("PublicAccessBlockConfiguration").unwrap()["BlockPublicPolicy"],
            json!(true)
        );
        assert_eq!(resource.property("ObjectLockEnabled"), Some(&json!(false)));
    }

    #[test]
    fn test_provider_shared_between_buckets() {
        let mut stack = stack();
        secure_bucket(&mut stack, "One", BucketProps::default()).unwrap();
        secure_bucket(&mut stack, "Two", BucketProps { versioned: true, ..Default::default() }).unwrap();
        assert_eq!(stack.resources_of_type("AWS::Lambda::Function").count(), 1);
        assert_eq!(stack.resources_of_type(AUTO_DELETE_TYPE).count(), 2);
        assert_eq!(
            stack.resource("Two").unwrap().property("VersioningConfiguration"),
            Some(&json!({"Status": "Enabled"}))
        );
    }

    #[test]
    fn test_named_bucket_is_by_value() {
        let mut stack = stack();
        let bucket = secure_bucket(&mut stack, "Named", BucketProps::named("my-artifacts")).unwrap();
        assert_eq!(bucket.name, Expr::lit("my-artifacts"));
        let shared = bucket.by_value().unwrap();
        assert!(shared.logical_id.is_none());
        assert_eq!(shared.arn.as_literal().unwrap(), "arn:aws:s3:::my-artifacts");
        assert_eq!(
            shared.object_arn(Expr::lit("a/b.zip")).as_literal().unwrap(),
            "arn:aws:s3:::my-artifacts/a/b.zip"
        );
    }

    #[test]
    fn test_unnamed_bucket_cannot_be_shared() {
        let mut stack = stack();
        let bucket = secure_bucket(&mut stack, "Anon", BucketProps::default()).unwrap();
        assert!(bucket.by_value().is_err());
    }
}

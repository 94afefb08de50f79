//! Deployment artifact bundle: the `appspec.yaml`, `taskdef.json` and
//! `imageDetail.json` a CodeDeploy ECS action reads, zipped and keyed by
//! content hash.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::Result;

/// Placeholder CodeDeploy replaces with the registered task definition ARN
pub const TASK_DEFINITION_PLACEHOLDER: &str = "<TASK_DEFINITION>";

/// Placeholder name the pipeline substitutes with the image URI
pub const IMAGE_PLACEHOLDER: &str = "IMAGE1_NAME";

pub const APPSPEC_FILE: &str = "appspec.yaml";
pub const TASKDEF_FILE: &str = "taskdef.json";
pub const IMAGE_DETAIL_FILE: &str = "imageDetail.json";

/// CodeDeploy application specification for an ECS service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    /// Always the string `"0.0"`; a float here is rejected by CodeDeploy.
    pub version: String,
    #[serde(rename = "Resources")]
    pub resources: Vec<BTreeMap<String, TargetService>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetService {
    #[serde(rename = "Type")]
    pub kind: String,
    pub properties: TargetServiceProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetServiceProperties {
    pub task_definition: String,
    pub load_balancer_info: LoadBalancerInfo,
    pub platform_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadBalancerInfo {
    pub container_name: String,
    pub container_port: u16,
}

impl AppSpec {
    pub fn ecs(container_name: &str, container_port: u16) -> Self {
        let target = TargetService {
            kind: "AWS::ECS::Service".to_string(),
            properties: TargetServiceProperties {
                task_definition: TASK_DEFINITION_PLACEHOLDER.to_string(),
                load_balancer_info: LoadBalancerInfo {
                    container_name: container_name.to_string(),
                    container_port,
                },
                platform_version: "LATEST".to_string(),
            },
        };
        Self {
            version: "0.0".to_string(),
            resources: vec![[("TargetService".to_string(), target)].into()],
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Inputs of the task definition template
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSpec {
    pub family: String,
    pub task_role_arn: String,
    pub execution_role_arn: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_name: String,
    pub container_port: u16,
    pub image_uri: String,
    pub log_group: Option<String>,
    pub region: String,
}

/// A rendered, zipped bundle
#[derive(Debug, Clone)]
pub struct Bundle {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

impl Bundle {
    /// Object key under `prefix`, derived from the content hash
    pub fn object_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}.zip", self.sha256)
        } else {
            format!("{}/{}.zip", prefix, self.sha256)
        }
    }
}

pub fn taskdef_json(spec: &BundleSpec) -> Result<String> {
    let mut container = json!({
        "name": spec.container_name,
        "image": format!("<{}>", IMAGE_PLACEHOLDER),
        "essential": true,
        "portMappings": [{ "containerPort": spec.container_port, "hostPort": spec.container_port, "protocol": "tcp" }],
    });
    if let Some(group) = &spec.log_group {
        container["logConfiguration"] = json!({
            "logDriver": "awslogs",
            "options": {
                "awslogs-group": group,
                "awslogs-region": spec.region,
                "awslogs-stream-prefix": spec.family,
            },
        });
    }
    let taskdef = json!({
        "family": spec.family,
        "taskRoleArn": spec.task_role_arn,
        "executionRoleArn": spec.execution_role_arn,
        "networkMode": "awsvpc",
        "requiresCompatibilities": ["FARGATE"],
        "cpu": spec.cpu.to_string(),
        "memory": spec.memory_mib.to_string(),
        "containerDefinitions": [container],
    });
    Ok(serde_json::to_string_pretty(&taskdef)?)
}

pub fn image_detail_json(image_uri: &str) -> Result<String> {
    Ok(serde_json::to_string_pretty(&json!({ "ImageURI": image_uri }))?)
}

/// Render the three documents and zip them. Entry order, timestamps and
/// permissions are fixed, so equal inputs give byte-identical archives.
pub fn render(spec: &BundleSpec) -> Result<Bundle> {
    let files = [
        (APPSPEC_FILE, AppSpec::ecs(&spec.container_name, spec.container_port).to_yaml()?),
        (TASKDEF_FILE, taskdef_json(spec)?),
        (IMAGE_DETAIL_FILE, image_detail_json(&spec.image_uri)?),
    ];

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in &files {
        writer.start_file(*name, options)?;
        writer.write_all(contents.as_bytes())?;
    }
    let bytes = writer.finish()?.into_inner();

    let sha256 = hex::encode(Sha256::digest(&bytes));
    log::debug!("bundle {} ({} bytes)", sha256, bytes.len());
    Ok(Bundle { bytes, sha256 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn spec() -> BundleSpec {
        BundleSpec {
            family: "demo".into(),
            task_role_arn: "arn:aws:iam::123456789012:role/demo-ecs-task-role".into(),
            execution_role_arn: "arn:aws:iam::123456789012:role/demo-ecs-task-exec-role".into(),
            cpu: 256,
            memory_mib: 512,
            container_name: "customer-portal".into(),
            container_port: 80,
            image_uri: "123456789012.dkr.ecr.us-west-2.amazonaws.com/demo-repository:latest".into(),
            log_group: None,
            region: "us-west-2".into(),
        }
    }

    #[test]
    fn test_appspec_version_is_string() {
        let yaml = AppSpec::ecs("customer-portal", 80).to_yaml().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["version"], serde_yaml::Value::String("0.0".to_string()));

        let round_trip: AppSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(round_trip.version, "0.0");
    }

    #[test]
    fn test_appspec_target_service() {
        let yaml = AppSpec::ecs("customer-portal", 80).to_yaml().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let target = &parsed["Resources"][0]["TargetService"];
        assert_eq!(target["Type"].as_str(), Some("AWS::ECS::Service"));
        assert_eq!(target["Properties"]["TaskDefinition"].as_str(), Some("<TASK_DEFINITION>"));
        assert_eq!(target["Properties"]["LoadBalancerInfo"]["ContainerPort"].as_u64(), Some(80));
        assert_eq!(target["Properties"]["PlatformVersion"].as_str(), Some("LATEST"));
    }

    #[test]
    fn test_taskdef_shape() {
        let taskdef: serde_json::Value = serde_json::from_str(&taskdef_json(&spec()).unwrap()).unwrap();
        assert_eq!(taskdef["cpu"], json!("256"));
        assert_eq!(taskdef["memory"], json!("512"));
        assert_eq!(taskdef["networkMode"], json!("awsvpc"));
        assert_eq!(taskdef["containerDefinitions"][0]["image"], json!("<IMAGE1_NAME>"));
        assert!(taskdef["containerDefinitions"][0].get("logConfiguration").is_none());
    }

    #[test]
    fn test_bundle_is_deterministic() {
        let first = render(&spec()).unwrap();
        let second = render(&spec()).unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.sha256.len(), 64);

        let mut changed = spec();
        changed.image_uri.push_str("-2");
        assert_ne!(render(&changed).unwrap().sha256, first.sha256);
    }

    #[test]
    fn test_bundle_contents() {
        let bundle = render(&spec()).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bundle.bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        let mut detail = String::new();
        archive.by_name(IMAGE_DETAIL_FILE).unwrap().read_to_string(&mut detail).unwrap();
        let detail: serde_json::Value = serde_json::from_str(&detail).unwrap();
        assert_eq!(detail["ImageURI"], json!(spec().image_uri));
    }

    #[test]
    fn test_object_key() {
        let bundle = Bundle {
            bytes: vec![],
            sha256: "abc".into(),
        };
        assert_eq!(bundle.object_key("/deploy/"), "deploy/abc.zip");
        assert_eq!(bundle.object_key(""), "abc.zip");
    }
}

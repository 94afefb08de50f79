use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constructs::elb::HealthCheck;
use crate::constructs::fis::{ExperimentOptions, ExperimentTarget, StopCondition};
use crate::constructs::network::{NetworkConfig, VpcRef};
use crate::stacks::fault_injection::{CpuStressAction, ReportOptions};
use crate::template::{Environment, Expr};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub environment: EnvironmentConfig,
    pub network: NetworkConfig,
    pub deployment: DeploymentConfig,
    pub pipeline: PipelineConfig,
    pub service: ServiceConfig,
    pub fault_injection: FaultInjectionConfig,
    pub ingress: IngressConfig,
}

/// Fallback account/region, used when the environment variables are unset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl EnvironmentConfig {
    pub fn to_environment(&self) -> Environment {
        Environment {
            account: self.account.clone(),
            region: self.region.clone(),
        }
    }
}

/// The blue/green scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub name: String,
    pub service_name: String,
    pub port: u16,
    pub test_port: u16,
    pub container_name: String,
    pub initial_image: String,
    pub image_tag: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
    pub health_check: HealthCheck,
    pub artifact_prefix: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            name: "demo".to_string(),
            service_name: "customer-portal-service".to_string(),
            port: 80,
            test_port: 8080,
            container_name: "customer-portal".to_string(),
            initial_image: "amazon/amazon-ecs-sample".to_string(),
            image_tag: "latest".to_string(),
            cpu: 256,
            memory_mib: 512,
            desired_count: 2,
            health_check: HealthCheck::default(),
            artifact_prefix: "deployments".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "ecs-blue-green-pipeline".to_string(),
        }
    }
}

/// The ECS service targeted by the fault-injection scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub fault_injection_agent: bool,
    pub cluster_name: String,
    pub container_name: String,
    pub image: String,
    pub port: u16,
    pub cpu: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            fault_injection_agent: true,
            cluster_name: "service-cluster".to_string(),
            container_name: "app".to_string(),
            image: "amazon/amazon-ecs-sample".to_string(),
            port: 80,
            cpu: 256,
            memory_mib: 512,
            desired_count: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    /// Trust policy for the FIS role; the bundled one when unset
    pub trust_policy: Option<PathBuf>,
    pub experiment_id: String,
    pub targets: BTreeMap<String, ExperimentTarget>,
    pub actions: BTreeMap<String, CpuStressAction>,
    pub stop_conditions: Vec<StopCondition>,
    pub report: Option<ReportOptions>,
    pub options: Option<ExperimentOptions>,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            trust_policy: None,
            experiment_id: "EcsCpuStressFisExperiment".to_string(),
            targets: [(
                "ecsTaskTarget".to_string(),
                ExperimentTarget::tagged("aws:ecs:task", "FIS_ENABLED", "true"),
            )]
            .into(),
            actions: [("ecsCpuStressAction".to_string(), CpuStressAction::default())].into(),
            stop_conditions: vec![StopCondition::none()],
            report: None,
            options: None,
        }
    }
}

/// A VPC that already exists, referenced by ID
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExistingVpc {
    pub vpc_id: String,
    pub public_subnets: Vec<String>,
    pub private_subnets: Vec<String>,
}

impl ExistingVpc {
    pub fn to_ref(&self) -> VpcRef {
        let ids = |subnets: &[String]| subnets.iter().map(Expr::lit).collect();
        VpcRef {
            vpc_id: Expr::lit(&self.vpc_id),
            public_subnets: ids(&self.public_subnets),
            private_subnets: ids(&self.private_subnets),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,
    /// Destination ALB: an ARN, or the name of an export holding one
    pub destination: String,
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub name: String,
    pub first_priority: u32,
    /// Existing VPC to use; a new one is built from `network` when unset
    pub vpc: Option<ExistingVpc>,
    pub routes: Vec<RouteConfig>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            name: "MyIngressController".to_string(),
            first_priority: 1,
            vpc: None,
            routes: vec![RouteConfig {
                path: "/accounts".to_string(),
                destination: "customer-portal-service-alb-arn".to_string(),
                priority: None,
            }],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            environment: EnvironmentConfig::default(),
            network: NetworkConfig::default(),
            deployment: DeploymentConfig::default(),
            pipeline: PipelineConfig::default(),
            service: ServiceConfig::default(),
            fault_injection: FaultInjectionConfig::default(),
            ingress: IngressConfig::default(),
        }
    }
}

/// Lowercase alphanumerics and hyphens, starting with a letter
fn valid_resource_prefix(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try local location: ./<project>.yml
        let local_config = PathBuf::from(format!("{}.yml", project_name));
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid config")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings that cannot produce a deployable template
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;

        let deployment = &self.deployment;
        for (field, value) in [("name", &deployment.name), ("service_name", &deployment.service_name)] {
            if !valid_resource_prefix(value) {
                bail!(
                    "deployment.{} '{}' must be lowercase letters, digits and hyphens",
                    field,
                    value
                );
            }
        }
        if deployment.port == deployment.test_port {
            bail!("deployment.port and deployment.test_port must differ (both {})", deployment.port);
        }
        if deployment.desired_count == 0 {
            bail!("deployment.desired_count must be at least 1");
        }
        deployment.health_check.validate()?;

        if self.pipeline.enabled && self.pipeline.name.is_empty() {
            bail!("pipeline.name must not be empty");
        }

        if let Some(report) = &self.fault_injection.report
            && let Some(sources) = &report.data_sources
            && sources.cloud_watch_dashboards.is_empty()
        {
            bail!("fault_injection.report.data_sources lists no dashboards");
        }
        if let Some(path) = &self.fault_injection.trust_policy
            && !path.exists()
        {
            bail!("fault_injection.trust_policy {} does not exist", path.display());
        }

        for route in &self.ingress.routes {
            if !route.path.starts_with('/') {
                bail!("ingress route '{}' must start with '/'", route.path);
            }
            if route.destination.is_empty() {
                bail!("ingress route '{}' has no destination", route.path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.deployment.port, 80);
        assert_eq!(config.deployment.test_port, 8080);
        assert!(config.pipeline.enabled);
        assert!(config.service.fault_injection_agent);
        assert_eq!(config.fault_injection.experiment_id, "EcsCpuStressFisExperiment");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
deployment:
  name: shop
pipeline:
  enabled: false
"#,
        );
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.deployment.name, "shop");
        assert_eq!(config.deployment.service_name, "customer-portal-service");
        assert!(!config.pipeline.enabled);
        assert_eq!(config.network.cidr, "172.31.0.0/16");
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let path = PathBuf::from("/nonexistent/ecs-infra.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_same_ports_rejected() {
        let mut config = Config::default();
        config.deployment.test_port = config.deployment.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_uppercase_name_rejected() {
        let mut config = Config::default();
        config.deployment.name = "Demo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_action_id_field_rejected() {
        let file = write_config(
            r#"
fault_injection:
  actions:
    stress:
      actionId: aws:ecs:task-kill-process
      targets:
        Tasks: ecsTaskTarget
"#,
        );
        assert!(Config::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_empty_dashboards_rejected() {
        let file = write_config(
            r#"
fault_injection:
  report:
    dataSources:
      cloudWatchDashboards: []
"#,
        );
        assert!(Config::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_ingress_routes() {
        let file = write_config(
            r#"
ingress:
  first_priority: 10
  routes:
    - path: /orders
      destination: arn:aws:elasticloadbalancing:us-west-2:123456789012:loadbalancer/app/orders/abc
    - path: /accounts
      destination: accounts-alb-arn
      priority: 5
"#,
        );
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.ingress.first_priority, 10);
        assert_eq!(config.ingress.routes.len(), 2);
        assert_eq!(config.ingress.routes[1].priority, Some(5));
    }

    #[test]
    fn test_relative_route_rejected() {
        let mut config = Config::default();
        config.ingress.routes[0].path = "accounts".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_existing_vpc_ref() {
        let vpc = ExistingVpc {
            vpc_id: "vpc-1".into(),
            public_subnets: vec!["subnet-a".into()],
            private_subnets: vec!["subnet-b".into(), "subnet-c".into()],
        };
        let vpc = vpc.to_ref();
        assert_eq!(vpc.vpc_id, Expr::lit("vpc-1"));
        assert_eq!(vpc.private_subnets.len(), 2);
    }
}

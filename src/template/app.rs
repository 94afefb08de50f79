//! The app: a set of stacks synthesized together.
//!
//! Synthesis validates what the deploy tool would otherwise only discover
//! mid-rollout: references that escape their stack, imports nobody exports,
//! export name clashes and import cycles between stacks. Stacks are then
//! written in an order where every exporter precedes its importers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{InfraError, Result};

use super::expr::Expr;
use super::refs;
use super::stack::{Environment, Stack};

/// Summary of one synthesis run
#[derive(Debug, Clone)]
pub struct SynthReport {
    pub out_dir: PathBuf,
    /// Stack names in deploy order
    pub stack_order: Vec<String>,
    /// Every file written
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ManifestStack {
    name: String,
    template: String,
    environment: Environment,
    dependencies: Vec<String>,
    exports: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ManifestAsset {
    id: String,
    stack: String,
    path: String,
    sha256: String,
    bucket: Expr,
    key: String,
}

/// A set of stacks that are synthesized together
#[derive(Debug, Clone, Default)]
pub struct App {
    env: Environment,
    stacks: Vec<Stack>,
    external_imports: BTreeSet<String>,
}

impl App {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            stacks: Vec::new(),
            external_imports: BTreeSet::new(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// A stack in this app's environment, not yet added
    pub fn new_stack(&self, name: impl Into<String>) -> Stack {
        Stack::new(name, self.env.clone())
    }

    pub fn add_stack(&mut self, stack: Stack) -> Result<()> {
        if self.stack(stack.name()).is_some() {
            return Err(InfraError::Config(format!("stack '{}' is defined twice", stack.name())));
        }
        log::info!("Registered stack {}", stack.name());
        self.stacks.push(stack);
        Ok(())
    }

    /// Allow imports of an export that lives outside this app
    pub fn allow_external_import(&mut self, export_name: impl Into<String>) {
        self.external_imports.insert(export_name.into());
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name() == name)
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Every export name mapped to the stack that owns it
    pub fn exports(&self) -> Result<BTreeMap<String, String>> {
        let mut exports: BTreeMap<String, String> = BTreeMap::new();
        for stack in &self.stacks {
            for name in stack.export_names() {
                if let Some(first) = exports.get(&name) {
                    return Err(InfraError::DuplicateExport {
                        name,
                        first: first.clone(),
                        second: stack.name().to_string(),
                    });
                }
                exports.insert(name, stack.name().to_string());
            }
        }
        Ok(exports)
    }

    /// Stack names each stack depends on through imports, validating
    /// local references along the way.
    pub fn dependencies(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let exports = self.exports()?;
        let mut dependencies = BTreeMap::new();

        for stack in &self.stacks {
            let found = refs::collect(&stack.template());

            for target in &found.local {
                if !target.starts_with("AWS::") && !stack.contains(target) {
                    return Err(InfraError::DanglingReference {
                        stack: stack.name().to_string(),
                        target: target.clone(),
                    });
                }
            }

            for (_, resource) in stack.resources() {
                if let Some(missing) = resource.depends_on.iter().find(|id| !stack.contains(id)) {
                    return Err(InfraError::DanglingReference {
                        stack: stack.name().to_string(),
                        target: missing.clone(),
                    });
                }
            }

            let mut depends = BTreeSet::new();
            for name in &found.imports {
                match exports.get(name) {
                    Some(owner) => {
                        depends.insert(owner.clone());
                    }
                    None if self.external_imports.contains(name) => {}
                    None => {
                        return Err(InfraError::UnknownImport {
                            stack: stack.name().to_string(),
                            name: name.clone(),
                        });
                    }
                }
            }
            dependencies.insert(stack.name().to_string(), depends);
        }

        Ok(dependencies)
    }

    /// Validate the app and return stack names in deploy order.
    pub fn deploy_order(&self) -> Result<Vec<String>> {
        let dependencies = self.dependencies()?;
        let names: Vec<String> = self.stacks.iter().map(|s| s.name().to_string()).collect();
        topological_order(&names, &dependencies)
    }

    /// Validate, then write templates, manifest and assets to `out_dir`.
    pub fn synth(&self, out_dir: &Path) -> Result<SynthReport> {
        let dependencies = self.dependencies()?;
        let names: Vec<String> = self.stacks.iter().map(|s| s.name().to_string()).collect();
        let order = topological_order(&names, &dependencies)?;

        fs::create_dir_all(out_dir)?;
        let mut files = Vec::new();
        let mut manifest_stacks = Vec::new();
        let mut manifest_assets = Vec::new();

        for name in &order {
            let Some(stack) = self.stack(name) else {
                continue;
            };
            let template_file = format!("{}.template.json", stack.name());
            let template_path = out_dir.join(&template_file);
            fs::write(&template_path, serde_json::to_string_pretty(&stack.template())?)?;
            log::info!("Wrote {}", template_path.display());
            files.push(template_path);

            for asset in stack.assets() {
                let relative = format!("assets/{}", asset.file_name);
                let asset_path = out_dir.join(&relative);
                if let Some(parent) = asset_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&asset_path, &asset.bytes)?;
                log::info!("Wrote asset {} ({} bytes)", asset_path.display(), asset.bytes.len());
                files.push(asset_path);
                manifest_assets.push(ManifestAsset {
                    id: asset.id.clone(),
                    stack: stack.name().to_string(),
                    path: relative,
                    sha256: asset.sha256.clone(),
                    bucket: asset.bucket.clone(),
                    key: asset.object_key.clone(),
                });
            }

            manifest_stacks.push(ManifestStack {
                name: stack.name().to_string(),
                template: template_file,
                environment: stack.env().clone(),
                dependencies: dependencies.get(name).map(|d| d.iter().cloned().collect()).unwrap_or_default(),
                exports: stack.export_names(),
            });
        }

        let manifest_path = out_dir.join("manifest.json");
        let manifest: Value = json!({ "version": "1", "stacks": manifest_stacks });
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
        files.push(manifest_path);

        if !manifest_assets.is_empty() {
            let assets_path = out_dir.join("assets.json");
            let assets: Value = json!({ "version": "1", "files": manifest_assets });
            fs::write(&assets_path, serde_json::to_string_pretty(&assets)?)?;
            files.push(assets_path);
        }

        Ok(SynthReport {
            out_dir: out_dir.to_path_buf(),
            stack_order: order,
            files,
        })
    }
}

/// Kahn's algorithm over `names`, keeping declaration order among ready stacks.
fn topological_order(names: &[String], dependencies: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut order = Vec::with_capacity(names.len());

    while order.len() < names.len() {
        let ready = names.iter().find(|name| {
            !placed.contains(*name)
                && dependencies
                    .get(*name)
                    .is_none_or(|deps| deps.iter().all(|d| placed.contains(d)))
        });
        match ready {
            Some(name) => {
                placed.insert(name.clone());
                order.push(name.clone());
            }
            None => {
                let remaining: Vec<&String> = names.iter().filter(|n| !placed.contains(*n)).collect();
                return Err(InfraError::DependencyCycle(find_cycle(&remaining, dependencies)));
            }
        }
    }

    Ok(order)
}

/// Follow dependency edges among `remaining` until a stack repeats.
fn find_cycle(remaining: &[&String], dependencies: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let Some(start) = remaining.first() else {
        return Vec::new();
    };
    let mut path: Vec<String> = vec![(*start).clone()];
    loop {
        let Some(current) = path.last() else {
            return path;
        };
        let next = dependencies
            .get(current)
            .and_then(|deps| deps.iter().find(|d| remaining.contains(d)));
        let Some(next) = next else {
            return path;
        };
        if let Some(pos) = path.iter().position(|p| p == next) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(next.clone());
            return cycle;
        }
        path.push(next.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::resource::Resource;
    use tempfile::TempDir;

    fn env() -> Environment {
        Environment::new("123456789012", "us-west-2")
    }

    fn exporter(name: &str, export: &str) -> Stack {
        let mut stack = Stack::new(name, env());
        stack.add("Bucket", Resource::new("AWS::S3::Bucket", json!({}))).unwrap();
        stack.export("BucketName", Expr::reference("Bucket"), export).unwrap();
        stack
    }

    fn importer(name: &str, import: &str) -> Stack {
        let mut stack = Stack::new(name, env());
        stack
            .add("Queue", Resource::new("AWS::SQS::Queue", json!({ "QueueName": Expr::import(import) })))
            .unwrap();
        stack
    }

    #[test]
    fn test_deploy_order_places_exporter_first() {
        let mut app = App::new(env());
        app.add_stack(importer("Consumer", "shared-bucket")).unwrap();
        app.add_stack(exporter("Producer", "shared-bucket")).unwrap();
        assert_eq!(app.deploy_order().unwrap(), vec!["Producer", "Consumer"]);
    }

    #[test]
    fn test_unknown_import_rejected() {
        let mut app = App::new(env());
        app.add_stack(importer("Consumer", "missing")).unwrap();
        assert!(matches!(app.deploy_order(), Err(InfraError::UnknownImport { .. })));
    }

    #[test]
    fn test_external_import_allowed() {
        let mut app = App::new(env());
        app.add_stack(importer("Consumer", "from-elsewhere")).unwrap();
        app.allow_external_import("from-elsewhere");
        assert_eq!(app.deploy_order().unwrap(), vec!["Consumer"]);
    }

    #[test]
    fn test_duplicate_export_rejected() {
        let mut app = App::new(env());
        app.add_stack(exporter("A", "same")).unwrap();
        app.add_stack(exporter("B", "same")).unwrap();
        assert!(matches!(app.exports(), Err(InfraError::DuplicateExport { .. })));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut stack = Stack::new("Lonely", env());
        stack
            .add("Sg", Resource::new("AWS::EC2::SecurityGroup", json!({ "VpcId": Expr::reference("Vpc") })))
            .unwrap();
        let mut app = App::new(env());
        app.add_stack(stack).unwrap();
        match app.deploy_order() {
            Err(InfraError::DanglingReference { target, .. }) => assert_eq!(target, "Vpc"),
            other => panic!("expected dangling reference, got {:?}", other),
        }
    }

    #[test]
    fn test_depends_on_missing_resource_rejected() {
        let mut stack = Stack::new("Ordered", env());
        stack.add("Bucket", Resource::new("AWS::S3::Bucket", json!({}))).unwrap();
        stack
            .add("Queue", Resource::new("AWS::SQS::Queue", json!({})).depends_on("BucketPolicy"))
            .unwrap();
        let mut app = App::new(env());
        app.add_stack(stack).unwrap();
        match app.synth(TempDir::new().unwrap().path()) {
            Err(InfraError::DanglingReference { target, .. }) => assert_eq!(target, "BucketPolicy"),
            other => panic!("expected dangling reference, got {:?}", other),
        }
    }

    #[test]
    fn test_depends_on_existing_resource_accepted() {
        let mut stack = Stack::new("Ordered", env());
        stack.add("Bucket", Resource::new("AWS::S3::Bucket", json!({}))).unwrap();
        stack
            .add("Queue", Resource::new("AWS::SQS::Queue", json!({})).depends_on("Bucket"))
            .unwrap();
        let mut app = App::new(env());
        app.add_stack(stack).unwrap();
        assert_eq!(app.deploy_order().unwrap(), vec!["Ordered"]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut a = exporter("A", "a-out");
        a.add("Topic", Resource::new("AWS::SNS::Topic", json!({ "TopicName": Expr::import("b-out") })))
            .unwrap();
        let mut b = exporter("B", "b-out");
        b.add("Topic", Resource::new("AWS::SNS::Topic", json!({ "TopicName": Expr::import("a-out") })))
            .unwrap();

        let mut app = App::new(env());
        app.add_stack(a).unwrap();
        app.add_stack(b).unwrap();
        match app.deploy_order() {
            Err(InfraError::DependencyCycle(cycle)) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"A".to_string()));
                assert!(cycle.contains(&"B".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_import_is_a_cycle() {
        let mut stack = exporter("Self", "self-out");
        stack
            .add("Topic", Resource::new("AWS::SNS::Topic", json!({ "TopicName": Expr::import("self-out") })))
            .unwrap();
        let mut app = App::new(env());
        app.add_stack(stack).unwrap();
        assert!(matches!(app.deploy_order(), Err(InfraError::DependencyCycle(_))));
    }

    #[test]
    fn test_duplicate_stack_rejected() {
        let mut app = App::new(env());
        app.add_stack(Stack::new("S", env())).unwrap();
        assert!(app.add_stack(Stack::new("S", env())).is_err());
    }

    #[test]
    fn test_synth_writes_templates_and_manifest() {
        let temp = TempDir::new().unwrap();
        let mut app = App::new(env());
        app.add_stack(importer("Consumer", "shared")).unwrap();
        app.add_stack(exporter("Producer", "shared")).unwrap();

        let report = app.synth(temp.path()).unwrap();
        assert_eq!(report.stack_order, vec!["Producer", "Consumer"]);
        assert!(temp.path().join("Producer.template.json").exists());
        assert!(temp.path().join("Consumer.template.json").exists());
        assert!(!temp.path().join("assets.json").exists());

        let manifest: Value =
            serde_json::from_str(&fs::read_to_string(temp.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["stacks"][0]["name"], json!("Producer"));
        assert_eq!(manifest["stacks"][1]["dependencies"], json!(["Producer"]));
        assert_eq!(manifest["stacks"][0]["environment"]["region"], json!("us-west-2"));
    }
}

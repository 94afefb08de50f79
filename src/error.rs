//! Error types for ecs-infra
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while composing or synthesizing stacks
#[derive(Debug, Error)]
pub enum InfraError {
    /// A logical ID was added twice to the same stack
    #[error("Duplicate resource '{logical_id}' in stack {stack}")]
    DuplicateResource { stack: String, logical_id: String },

    /// An output ID was added twice to the same stack
    #[error("Duplicate output '{output_id}' in stack {stack}")]
    DuplicateOutput { stack: String, output_id: String },

    /// Two stacks export the same name
    #[error("Export '{name}' is defined by both {first} and {second}")]
    DuplicateExport { name: String, first: String, second: String },

    /// A Ref/GetAtt names something that is not in the same stack
    #[error("Stack {stack} references '{target}' which is not defined in that stack")]
    DanglingReference { stack: String, target: String },

    /// Fn::ImportValue names an export nobody provides
    #[error("Stack {stack} imports '{name}' but no stack exports it")]
    UnknownImport { stack: String, name: String },

    /// Import/export edges form a cycle
    #[error("Dependency cycle between stacks: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Two ingress paths derive the same resource name
    #[error("Route '{path}' derives name '{derived}' already used by route '{existing}'")]
    RouteNameCollision { path: String, existing: String, derived: String },

    /// Two listener rules were given the same priority
    #[error("Listener rule priority {priority} for '{path}' is already used by '{existing}'")]
    PriorityCollision { priority: u32, path: String, existing: String },

    /// An ingress path or priority that cannot be turned into a rule
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Experiment template violates a structural invariant
    #[error("Invalid experiment: {0}")]
    InvalidExperiment(String),

    /// Caller-supplied configuration rejected at composition time
    #[error("Configuration error: {0}")]
    Config(String),

    /// CIDR/subnet layout problem
    #[error("Network error: {0}")]
    Network(String),

    /// A value needed at synth time depends on an unknown account or region
    #[error("Unresolved environment: {0}")]
    UnresolvedEnvironment(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Zip archive error
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Result type alias for ecs-infra operations
pub type Result<T> = std::result::Result<T, InfraError>;

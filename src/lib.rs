//! ecs-infra - CloudFormation synthesis for ECS deployment scenarios
//!
//! Builds typed stacks (foundation, blue/green service, release pipeline,
//! fault injection, ingress) and writes them out as templates plus a
//! manifest ordered by cross-stack dependencies.

pub mod bundle;
pub mod config;
pub mod constructs;
pub mod error;
pub mod scenario;
pub mod stacks;
pub mod template;

pub use error::{InfraError, Result};

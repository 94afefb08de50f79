//! Template model: expressions, resources, stacks and the app that
//! synthesizes them into CloudFormation templates.

mod app;
mod expr;
pub mod refs;
mod resource;
mod stack;

pub use app::{App, SynthReport};
pub use expr::{ACCOUNT_ID, Expr, REGION};
pub use resource::{RemovalPolicy, Resource, Tagging};
pub use stack::{ACCOUNT_VAR, Environment, FileAsset, Output, REGION_VAR, Stack, logical_id};

//! Stack builders, one per deployable unit.

pub mod agent_service;
pub mod fault_injection;
pub mod foundation;
pub mod ingress;
pub mod pipeline;
pub mod service;

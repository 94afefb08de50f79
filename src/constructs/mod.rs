//! Resource builders. Each builder validates its inputs, emits resources into
//! one stack and hands back references by value.

pub mod bucket;
pub mod codedeploy;
pub mod codepipeline;
pub mod ecs;
pub mod elb;
pub mod fis;
pub mod iam;
pub mod lambda;
pub mod logs;
pub mod network;

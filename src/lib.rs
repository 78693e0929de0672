//! Tandem - paired generate-and-review orchestration for automated change requests

pub mod analyst;
pub mod capability;
pub mod commands;
pub mod config;
pub mod error;
pub mod model;
pub mod navigator;
pub mod pair;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod verify;
pub mod workflow;

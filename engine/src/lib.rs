//! Workbench engine library
//!
//! Runs benchmark profiles on one or more machines: components are created
//! from a declarative profile, driven through their lifecycle by the
//! [`ProfileExecutor`], and coordinate across machines through a small HTTP
//! control plane.

pub mod api;
pub mod component;
pub mod config;
pub mod error;
pub mod executor;
pub mod firewall;
pub mod layout;
pub mod packages;
pub mod parser;
pub mod process;
pub mod profile;
pub mod publisher;
pub mod retry;
pub mod telemetry;
pub mod timing;
pub mod workloads;

// Re-export commonly used types
pub use component::{Component, ComponentHost, ComponentRegistry, ComponentStage, RunContext};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, Result};
pub use executor::{ExecutionEvent, ExecutionObserver, ExecutionOptions, ProfileExecutor, RunReport, RunStatus};
pub use layout::{ClientInstance, EnvironmentLayout, Role};
pub use profile::{ExecutionProfile, ParameterValue, Parameters, ProfileElement};
pub use telemetry::EngineMetrics;
pub use timing::{DeterminismScope, ProfileTiming};

//! # sopflow Core
//!
//! Core library for sopflow: a compiler for the standard-operating-procedure
//! workflow DSL and a durable executor that walks a caller through it one
//! step at a time.

pub mod config;
pub mod error;
pub mod workflow;

// Re-export commonly used types at the crate root.
pub use config::{ExecutorConfig, SopConfig, StoreConfig, load_config};
pub use error::{ConfigError, Result, StoreError, WorkflowError};
pub use workflow::{
    CapabilityHook, CapabilityRegistry, Command, FlowDefinition, HookKind, OpResult, StateStore,
    StatusReport, WorkflowExecutor, WorkflowState, WorkflowStatus, parse_flow, validate_flow,
};

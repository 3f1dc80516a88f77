// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Provision
//!
//! A declarative, dependency-aware infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Resources are declared in a YAML file. Attributes may reference
//! attributes of other resources; those references define a dependency
//! graph. Each run:
//!
//! 1. builds the graph and rejects unresolved references and cycles,
//! 2. diffs it against the last applied state into an ordered plan,
//! 3. executes the plan against providers with bounded parallelism,
//!    committing each resource's state as soon as its action succeeds.
//!
//! A failed action blocks only the actions that depend on it.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, expressions and validation
//! - [`graph`]: Dependency graph construction
//! - [`planner`]: Diff computation and plan execution
//! - [`provider`]: Provider interface and built-in backends
//! - [`state`]: State storage backends (local, S3)
//! - [`reconciler`]: Plan, apply and destroy runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: demo
//!
//! resources:
//!   - kind: network
//!     name: net
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - kind: vm
//!     name: vm
//!     attributes:
//!       size: B1s
//!       subnet_id: ${net.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, InfraConfig, ResourceKey, ResourceSpec};
pub use context::{CancelHandle, RunContext};
pub use error::{HalldyllError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{DiffEngine, ExecutionResult, Plan, PlanExecutor};
pub use provider::{Provider, ProviderRegistry};
pub use reconciler::{ApplyReport, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateRecord, StateSnapshot, StateStore};

//! Planning module for provisioning runs.
//!
//! This module compares the desired resource graph with applied state,
//! producing an ordered plan, and executes plans against providers.

mod diff;
mod executor;
mod plan;

pub use diff::DiffEngine;
pub use executor::{
    ActionOutcome, ActionResult, DEFAULT_PARALLELISM, ExecutionResult, PlanExecutor,
};
pub use plan::{ActionType, AttributeChange, Plan, PlanAction, PlannedValue};

//! Testing utilities for coordinator workflows.
//!
//! This module provides:
//! - Scripted, slow, panicking and recording adapters
//! - A backend that loses every compare-and-set
//! - The intake / plan / review scenario fixture

mod fixtures;
mod mocks;

pub use fixtures::{plan_payload, request_payload, scenario_schemas, Scenario, PLAN_SCHEMA, REQUEST_SCHEMA};
pub use mocks::{
    CallLog, ContendedBackend, PanickingAdapter, RecordingAdapter, ScriptStep, ScriptedAdapter, SlowAdapter,
};

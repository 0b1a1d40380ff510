//! gradebox library
//!
//! This crate provides the sandboxed grading pipeline for student code
//! submissions:
//! - Configuration parsing for the grading daemon
//! - OS identity resolution for privilege demotion
//! - Harness-template materialization of submitted code
//! - Demoted, timeout-bounded process execution with output capture
//! - Store boundary traits (assignments, grades, audit log) and their
//!   SQLite implementations
//! - The grading orchestrator tying the pipeline together

pub mod config;
pub mod grader;
pub mod identity;
pub mod outcome;
pub mod runner;
pub mod script;
pub mod store;

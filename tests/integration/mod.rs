//! Integration test suite for ensemble.
//!
//! These tests drive the scheduler against real git repositories and goal
//! documents, with scripted agent sessions standing in for the agent CLI.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: A unit's full lifecycle, questions and failures
//! - `parallel_agents`: Parallel dispatch, capacity and serialization
//! - `conflict_resolution`: Conflict detection and operator verdicts
//! - `recovery`: Completion retries, timeouts and daemon restarts
//! - `api`: The HTTP API and its client against a live scheduler
//!
//! # CI Compatibility
//!
//! No test launches a real agent, so the suite needs only `git` on PATH.

mod fixtures;

mod api;
mod conflict_resolution;
mod parallel_agents;
mod recovery;
mod workflow_e2e;

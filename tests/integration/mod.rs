//! Integration test suite for fleetctl.
//!
//! These tests wire the scheduler, the DAG orchestrator, failover and the
//! worker stream server over a `MemoryStore` and drive them by hand.
//!
//! # Test Categories
//!
//! - `dag_runs`: DAG runs from start to terminal state
//! - `dispatch`: builtin, os_process, HTTP worker and service backends
//! - `worker_stream`: streaming workers over TCP, watchdog vs late results
//! - `failover`: migration of assignments off stale nodes
//!
//! # CI Compatibility
//!
//! HTTP peers are local axum servers on ephemeral ports; nothing leaves
//! the machine.

mod fixtures;

mod dag_runs;
mod dispatch;
mod failover;
mod worker_stream;

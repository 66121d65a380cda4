//! Integration test suite for glossa.
//!
//! These tests run every agent on one in-memory broker and drive whole
//! workflows through the client, including fan-out deadlines, retries,
//! redelivery and cancellation.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `fanout`: Research fan-out bounds and partial results
//! - `recovery`: Retries, redelivery, outages and cancellation
//! - `planner`: Verification planning over the broker
//!
//! # CI Compatibility
//!
//! Providers are scripted and time-sensitive tests run on a paused clock,
//! so nothing here touches the network or sleeps for real.

mod fixtures;

mod fanout;
mod planner;
mod recovery;
mod workflow_e2e;

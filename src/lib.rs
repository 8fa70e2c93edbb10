//! Mithra - caller-ID ingestion service
//!
//! This module exports internal components for integration testing.

pub mod cli;
pub mod config;
pub mod relay;
pub mod sentinel;
pub mod sink;
pub mod sip;

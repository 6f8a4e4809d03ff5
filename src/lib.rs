//! # biztools
//!
//! Async wrappers for the services a small business back office talks to:
//! SQL Server, Azure Communication Services Email, Google Drive and Slack,
//! plus layered configuration and logging. The Drive wrapper includes
//! recursive folder sharing (see [`sharing`]).

pub mod auth;
pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod sharing;
pub mod telemetry;

pub use error::{Error, Result};

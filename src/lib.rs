//! Library crate for cfscan-rs exposing the scan engine.
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod probe;
pub mod scanner;
pub mod sink;
pub mod store;
pub mod subnets;
pub mod tester;
pub mod types;

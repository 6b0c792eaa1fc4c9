//! nginx proxy_cache usage plugin for mackerel-agent
//!
//! The library exposes the rate-limited usage walker and its limiter so they
//! can be driven without the CLI.

pub mod cli;
pub mod config;
pub mod error;
pub mod limiter;
pub mod plugin;
pub mod utils;
pub mod walker;

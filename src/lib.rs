//! shellfence - kernel-enforced sandboxing for shell commands issued by
//! autonomous agents
//!
//! This crate provides:
//! - Platform capability detection (Landlock, seccomp, Seatbelt)
//! - Policy merging and compilation into cached, fingerprinted filters
//! - A local HTTP(S) proxy enforcing host allow/deny rules with an
//!   interactive decision path
//! - Command wrapping that applies the filter before the real command runs
//! - A violation ledger for audit

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod paths;
pub mod sandbox;

pub use config::Config;
pub use sandbox::{SandboxManager, SandboxOptions};

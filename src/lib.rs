//! Build orchestration core for a from-source operating-system
//! assembler.
//!
//! Given a catalog of builds and packages, the dependencies between
//! them, and the on-disk store of what is already built, this crate
//! plans an executable job graph and drives it to completion with
//! bounded, load-adaptive parallelism and mirror-aware downloads.
//!
//! Catalog ingestion, sandboxed command execution and the CLI live in
//! their own crates; this one stops at the [`scheduler::BuildRunner`]
//! and [`download::Fetcher`] seams.

use derive_more::{AsRef, Display};
use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod exec;
pub mod graph;
pub mod load;
pub mod pathing;
pub mod resolve;
pub mod scheduler;
pub mod store;
pub mod tracing;

pub use error::{BuildError, Result};

/// A package name as it appears in the catalog and the store.
pub type Pkgname = String;

/// A URL hostname, used for per-host connection accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hostname(pub(crate) String);

impl Hostname {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Hostname {
    fn from(value: &str) -> Self {
        Hostname(value.to_string())
    }
}

impl From<String> for Hostname {
    fn from(value: String) -> Self {
        Hostname(value)
    }
}

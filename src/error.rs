//! Error taxonomy for the build core.
//!
//! Everything here eventually surfaces to the scheduler, which cancels
//! the whole job graph and re-raises the first failure. The only
//! non-fatal condition in the crate is the install-order dependency
//! cycle, which is reported as a warning by the resolver.

use itertools::Itertools;
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Inconsistent catalog data handed to us by the ingestion layer.
    #[error("{0}")]
    Catalog(String),

    /// The on-disk store violates its layout contract.
    #[error("{0}")]
    Store(String),

    /// A build-time dependency cycle. The chain is accumulated while
    /// the error bubbles out of the recursive graph construction.
    #[error("Dependency cycle detected: {}", render_cycle(.cycle))]
    DependencyCycle { cycle: Vec<String> },

    /// No operand of a build-time OR-group exists in the catalog or
    /// the built store.
    #[error("Build-time dependency '{group}' of build '{build}' can't be satisfied")]
    UnsatisfiableBuildDep { group: String, build: String },

    /// An install-time dependency that neither the catalog nor the
    /// store can provide.
    #[error("dependency '{dep}' of package '{package}' can't be satisfied")]
    UnsatisfiableDep { dep: String, package: String },

    #[error("couldn't download {url}: {reason}")]
    Download { url: String, reason: String },

    /// Checksum or signature mismatch on a fetched source.
    #[error("{0}")]
    Verify(String),

    /// Failure inside the sandboxed execution collaborator.
    #[error(transparent)]
    Sandbox(#[from] anyhow::Error),

    #[error("command '{0}' not available")]
    MissingCommand(String),

    #[error("command \"{0}\" failed")]
    CommandFailed(String),

    #[error("illegal hostname: {0}")]
    IllegalHostname(String),

    #[error("{0} is not set")]
    ConfigMissing(&'static str),
}

fn render_cycle(cycle: &[String]) -> String {
    cycle.iter().rev().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_is_rendered_in_reverse_accumulation_order() {
        let err = BuildError::DependencyCycle {
            cycle: vec!["loop-1".into(), "loop-2".into(), "loop-1".into()],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: loop-1 -> loop-2 -> loop-1"
        );
    }
}

//! Runtime configuration and host prebuild checks.

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::{BuildError, Result};
use crate::exec::check_command;

/// One mirror rule: URLs starting with `prefix` may instead be
/// fetched from any of `mirrors`, with the prefix swapped out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MirrorRule {
    pub prefix: String,
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the target filesystem; the store lives beneath it.
    pub rootfs_path: Utf8PathBuf,

    /// GCC-style triplet of the system being assembled. Required
    /// before any build runs.
    pub target_triplet: Option<String>,
    pub target32_triplet: Option<String>,
    /// Derived from the target triplet when unset.
    pub host_triplet: Option<String>,
    pub host32_triplet: Option<String>,

    pub final_cflags: String,
    pub final_cxxflags: String,
    pub final_cppflags: String,
    pub final_ldflags: String,

    /// Seconds between load samples.
    pub load_sampling_period: f64,
    /// Window length of the load median.
    pub load_sample_size: usize,
    /// Extra settle seconds after a brand-new build starts.
    pub configure_delay: f64,
    /// Load median at which the scheduler starts pausing builds.
    pub max_load: u32,
    pub max_parallel_builds: usize,

    pub mirrors: Vec<MirrorRule>,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        Config {
            rootfs_path: "/".into(),
            target_triplet: None,
            target32_triplet: None,
            host_triplet: None,
            host32_triplet: None,
            final_cflags: String::new(),
            final_cxxflags: String::new(),
            final_cppflags: String::new(),
            final_ldflags: String::new(),
            load_sampling_period: 0.125,
            load_sample_size: 15,
            configure_delay: 5.0,
            max_load: parallelism as u32,
            max_parallel_builds: parallelism,
            mirrors: Vec::new(),
            max_connections: 5,
            max_connections_per_host: 1,
        }
    }
}

impl Config {
    /// Host checks run once before anything is scheduled: the sandbox
    /// tooling must be on PATH, the target triplet must be set, and
    /// the host triplets are derived when absent.
    pub fn prebuild_check(&mut self) -> Result<()> {
        check_command("sudo")?;
        check_command("nsjail")?;

        let target = self
            .target_triplet
            .as_deref()
            .ok_or(BuildError::ConfigMissing("target_triplet"))?;
        if self.host_triplet.is_none() {
            self.host_triplet = Some(tmp_triplet(target));
        }
        if let (Some(target32), None) = (&self.target32_triplet, &self.host32_triplet) {
            self.host32_triplet = Some(tmp_triplet(target32));
        }
        Ok(())
    }
}

/// `x86_64-linux-musl` → `x86_64-lfs-linux-musl`.
pub fn tmp_triplet(triplet: &str) -> String {
    match triplet.split_once('-') {
        Some((arch, rest)) => format!("{arch}-lfs-{rest}"),
        None => triplet.to_string(),
    }
}

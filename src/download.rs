//! HTTP source fetching with resume, plus artifact verification.
//!
//! The scheduler talks to this through the [`Fetcher`] seam so tests
//! can script transfers. The real implementation shares one reqwest
//! client across all download tasks; per-host fairness is enforced by
//! the scheduler, not here.

use std::future::Future;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::TryStreamExt;
use reqwest::{header, StatusCode};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;

use crate::catalog::Source;
use crate::error::{BuildError, Result};
use crate::exec;
use crate::pathing;

/// Suffix of partially transferred files.
pub const PARTIAL_SUFFIX: &str = ".download";

/// Download dispatcher seam used by the scheduler.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch one URL of `source`. `url` determines the destination
    /// path; `mirror_url` is what actually gets requested.
    fn download(
        &self,
        source: Arc<Source>,
        url: String,
        mirror_url: String,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Runs once all parts of a source are present; fails with a
    /// verify error on any mismatch.
    fn verify(&self, source: Arc<Source>) -> impl Future<Output = Result<()>> + Send;
}

pub struct Downloader {
    client: reqwest::Client,
    outdir: Utf8PathBuf,
}

impl Downloader {
    pub fn new(outdir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            outdir: outdir.into(),
        }
    }

    async fn fetch(&self, url: &str, mirror_url: &str) -> Result<()> {
        let dest = pathing::download_path(&self.outdir, url)?;
        let name = dest.file_name().unwrap_or(url).to_string();

        match fs::symlink_metadata(&dest).await {
            Ok(meta) if meta.is_file() => {
                tracing::info!("skip download: {name}");
                return Ok(());
            }
            Ok(meta) => {
                tracing::info!("deleting: {name}");
                if meta.is_dir() {
                    fs::remove_dir_all(&dest).await.map_err(io_error(mirror_url))?;
                } else {
                    fs::remove_file(&dest).await.map_err(io_error(mirror_url))?;
                }
            }
            Err(_) => {}
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(io_error(mirror_url))?;
        }

        let partial = Utf8PathBuf::from(format!("{dest}{PARTIAL_SUFFIX}"));
        let offset = match fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(mirror_url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        tracing::info!("downloading: {name}");
        let response = request.send().await.map_err(|err| BuildError::Download {
            url: mirror_url.to_string(),
            reason: err.to_string(),
        })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(BuildError::Download {
                url: mirror_url.to_string(),
                reason: format!(
                    "{} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("unknown")
                ),
            });
        }

        // 206 continues the partial transfer; anything else restarts.
        let file = if status == StatusCode::PARTIAL_CONTENT {
            fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await
                .map_err(io_error(mirror_url))?
        } else {
            fs::File::create(&partial).await.map_err(io_error(mirror_url))?
        };

        let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        futures::pin_mut!(reader);
        let mut writer = BufWriter::new(file);
        io::copy(&mut reader, &mut writer)
            .await
            .map_err(io_error(mirror_url))?;
        writer.flush().await.map_err(io_error(mirror_url))?;

        fs::rename(&partial, &dest).await.map_err(io_error(mirror_url))?;
        tracing::info!("download succeeded: {name}");
        Ok(())
    }

    async fn verify_checksum(&self, url: &str, expected: &str) -> Result<()> {
        let dest = pathing::download_path(&self.outdir, url)?;
        let logger = crate::tracing::job_span("verify", url);
        let (_, stdout) = exec::run(&logger, "sha256sum", &[dest.as_str()], true, true).await?;
        let actual = stdout.split_whitespace().next().unwrap_or("");
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(BuildError::Verify(format!(
                "checksum mismatch for {dest}: expected {expected}, got {actual}"
            )));
        }
        tracing::debug!("checksum ok: {dest}");
        Ok(())
    }

    // Contract only, like git downloads: a detached signature fails
    // verification until signature checking exists.
    fn verify_signature(&self, url: &str) -> Result<()> {
        Err(BuildError::Verify(format!(
            "signature verification for {url} is not implemented"
        )))
    }
}

impl Fetcher for Downloader {
    async fn download(&self, source: Arc<Source>, url: String, mirror_url: String) -> Result<()> {
        match &*source {
            Source::Http { .. } => self.fetch(&url, &mirror_url).await,
            // Contract only: the dispatcher never schedules local
            // sources, and git transports live elsewhere.
            Source::Git { .. } | Source::Local { .. } => Err(BuildError::Download {
                url,
                reason: format!("{} source downloads are not implemented", source.kind()),
            }),
        }
    }

    async fn verify(&self, source: Arc<Source>) -> Result<()> {
        match &*source {
            Source::Http {
                url,
                sha256sum,
                gpgsig,
                ..
            } => {
                if let Some(expected) = sha256sum {
                    self.verify_checksum(url, expected).await?;
                }
                if gpgsig.is_some() {
                    self.verify_signature(url)?;
                }
                Ok(())
            }
            Source::Git { .. } | Source::Local { .. } => Ok(()),
        }
    }
}

fn io_error(url: &str) -> impl Fn(io::Error) -> BuildError + '_ {
    move |err| BuildError::Download {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn outdir() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn existing_file_skips_the_transfer() {
        let (_guard, out) = outdir();
        let dest = out.join("sources").join("orig");
        fs::create_dir_all(&dest).await.unwrap();
        fs::write(dest.join("src2"), "foo").await.unwrap();

        // The mirror URL is unreachable on purpose: a skip must not
        // touch the network.
        Downloader::new(out.clone())
            .fetch("http://orig/src2", "http://127.0.0.1:1/src2")
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("src2")).await.unwrap(), "foo");
    }

    #[tokio::test]
    async fn unreachable_mirror_preserves_the_reason() {
        let (_guard, out) = outdir();
        let err = Downloader::new(out.clone())
            .fetch("http://orig/src", "http://127.0.0.1:1/src")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            message.starts_with("couldn't download http://127.0.0.1:1/src: "),
            "{message}"
        );
    }

    #[tokio::test]
    async fn git_downloads_are_a_contract_error() {
        let (_guard, out) = outdir();
        let source = Arc::new(Source::Git {
            url: "git://host/repo".into(),
            sha256sum: "a".into(),
            rev: crate::catalog::GitRev::Commit("a".into()),
        });
        let err = Downloader::new(out.clone())
            .download(source, "git://host/repo".into(), "git://host/repo".into())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "couldn't download git://host/repo: git source downloads are not implemented"
        );
    }

    #[tokio::test]
    async fn signed_sources_fail_verification_as_unimplemented() {
        let (_guard, out) = outdir();
        let source = Arc::new(Source::Http {
            url: "http://host/s".into(),
            sha256sum: None,
            gpgsig: Some("http://host/s.sig".into()),
            gpgkey: Some("/keys/upstream.gpg".into()),
        });
        let err = Downloader::new(out.clone()).verify(source).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "signature verification for http://host/s is not implemented"
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_verify_error() {
        let _lock = crate::exec::tests::PATH_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (_guard, out) = outdir();
        let dest = out.join("sources").join("host");
        fs::create_dir_all(&dest).await.unwrap();
        fs::write(dest.join("src"), "content").await.unwrap();

        let source = Arc::new(Source::http("http://host/src", "0".repeat(64)));
        let err = Downloader::new(out.clone())
            .verify(source)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("checksum mismatch for"), "{err}");
    }
}

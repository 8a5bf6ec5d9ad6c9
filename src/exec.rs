//! Logged subprocess execution and PATH checks.

use std::process::Stdio;

use anyhow::Context as _;
use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as Process;
use tracing::{Instrument, Span};

use crate::error::{BuildError, Result};

/// Fail unless `command` is an executable regular file on `PATH`.
pub fn check_command(command: &str) -> Result<()> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    if std::env::split_paths(&path).any(|dir| is_executable(&dir.join(command))) {
        Ok(())
    } else {
        Err(BuildError::MissingCommand(command.to_string()))
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

/// Run `program` with `args` inside `logger`'s span, streaming stdout
/// at info and stderr at warn. Concurrent callers each pass their own
/// job span so interleaved process output stays attributable. Returns
/// the exit code and, with `capture_stdout`, the collected stdout.
/// With `check`, a nonzero exit is an error.
pub async fn run(
    logger: &Span,
    program: &str,
    args: &[&str],
    check: bool,
    capture_stdout: bool,
) -> Result<(i32, String)> {
    let rendered = render_command(program, args);

    async {
        tracing::info!("$ {rendered}");

        let mut child = Process::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let (captured, (), status) = tokio::try_join!(
            read_stdout(stdout, capture_stdout),
            read_stderr(stderr),
            async { child.wait().await.context("waiting for child") },
        )?;

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            if check {
                tracing::error!("the process finished with code {code}");
                return Err(BuildError::CommandFailed(rendered));
            }
            tracing::info!("the process finished with code {code}");
        }

        Ok((code, captured))
    }
    .instrument(logger.clone())
    .await
}

async fn read_stdout(
    stdout: impl AsyncRead + Unpin,
    capture: bool,
) -> anyhow::Result<String> {
    let mut lines = BufReader::new(stdout).lines();
    let mut captured = Vec::new();
    while let Some(line) = lines.next_line().await? {
        tracing::info!("{line}");
        if capture {
            captured.push(line);
        }
    }
    Ok(captured.join("\n"))
}

async fn read_stderr(stderr: impl AsyncRead + Unpin) -> anyhow::Result<()> {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        tracing::warn!("{line}");
    }
    Ok(())
}

fn render_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .map(|word| {
            let plain = !word.is_empty()
                && !word
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | ';'));
            if plain {
                word.to_string()
            } else {
                format!("'{}'", word.replace('\'', r"'\''"))
            }
        })
        .join(" ")
}

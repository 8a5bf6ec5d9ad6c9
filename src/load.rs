//! System load sampling for the scheduler.

use std::io;

/// Source of the scheduling load signal.
pub trait LoadSampler: Send + 'static {
    /// Number of runnable processes, excluding the caller.
    fn sample(&mut self) -> io::Result<u32>;
}

/// Reads the `running/total` field of `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcLoadavg;

impl LoadSampler for ProcLoadavg {
    fn sample(&mut self) -> io::Result<u32> {
        let loadavg = std::fs::read_to_string("/proc/loadavg")?;
        parse_loadavg(&loadavg)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/loadavg"))
    }
}

fn parse_loadavg(loadavg: &str) -> Option<u32> {
    let field = loadavg.split_whitespace().nth(3)?;
    let running: u32 = field.split('/').next()?.parse().ok()?;
    Some(running.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_runnable_process_count() {
        assert_eq!(parse_loadavg("0.50 0.40 0.30 3/345 678"), Some(2));
        assert_eq!(parse_loadavg("0.50 0.40 0.30 1/345 678"), Some(0));
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn reads_the_live_loadavg() {
        if std::path::Path::new("/proc/loadavg").exists() {
            ProcLoadavg.sample().unwrap();
        }
    }
}

//! Filesystem-safe download paths and mirror resolution.
//!
//! `download_path` must not normalize the way generic URL parsers do:
//! percent-escapes are decoded with a table that keeps bytes the host
//! filesystem cannot represent encoded, so the derived path is always
//! legal on the host and round-trips to itself.

use camino::{Utf8Path, Utf8PathBuf};
use url::Url;

use crate::config::MirrorRule;
use crate::error::{BuildError, Result};
use crate::Hostname;

pub const SOURCES_DIR: &str = "sources";

/// Expand a URL through the configured mirror rules, in declaration
/// order. A URL matching no rule is returned unchanged as the only
/// candidate; a URL may match several rules.
pub fn find_mirrors(mirrors: &[MirrorRule], url: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    for rule in mirrors {
        if let Some(rest) = url.strip_prefix(rule.prefix.as_str()) {
            candidates.extend(rule.mirrors.iter().map(|mirror| format!("{mirror}{rest}")));
        }
    }
    if candidates.is_empty() {
        candidates.push(url.to_string());
    }
    candidates
}

/// Hostname of a URL, for per-host connection accounting.
pub fn hostname(url: &str) -> Result<Hostname> {
    let parsed = Url::parse(url).map_err(|err| BuildError::Download {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    parsed
        .host_str()
        .map(|host| Hostname(host.to_string()))
        .ok_or_else(|| BuildError::IllegalHostname("(empty)".into()))
}

/// Deterministic destination for a source URL:
/// `<outdir>/sources/<netloc>/<path...>[?<query>]`, with `index.html`
/// appended when the URL denotes a directory.
pub fn download_path(outdir: &Utf8Path, url: &str) -> Result<Utf8PathBuf> {
    let (netloc, path, query) = split_url(url);

    let host = decode_fs_safe(netloc);
    if host.is_empty() {
        return Err(BuildError::IllegalHostname("(empty)".into()));
    }
    if host == ".." {
        return Err(BuildError::IllegalHostname(host));
    }

    let mut components: Vec<String> = Vec::new();
    for raw in path.split('/') {
        let component = decode_fs_safe(raw);
        match component.as_str() {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            _ => components.push(component),
        }
    }

    if path.ends_with('/') || components.is_empty() {
        components.push("index.html".into());
    }

    if let Some(query) = query {
        let query = decode_fs_safe(query);
        if !query.is_empty() {
            // components is nonempty here, index.html at the latest
            let last = components.last_mut().unwrap();
            last.push('?');
            last.push_str(&query);
        }
    }

    let mut dest = outdir.join(SOURCES_DIR).join(host);
    for component in components {
        dest.push(component);
    }
    Ok(dest)
}

/// Split into (netloc, path, query), dropping scheme and fragment.
/// No percent-decoding happens here.
fn split_url(url: &str) -> (&str, &str, Option<&str>) {
    let rest = match url.find("://") {
        Some(scheme_end) => &url[scheme_end + 3..],
        None => return ("", url.split('#').next().unwrap_or(url), None),
    };
    let rest = rest.split('#').next().unwrap_or(rest);

    let netloc_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (netloc, rest) = rest.split_at(netloc_end);

    match rest.split_once('?') {
        Some((path, query)) => (netloc, path, Some(query)),
        None => (netloc, rest, None),
    }
}

/// Percent-decode, re-encoding any byte the host filesystem cannot
/// represent as lowercase `%xx`. Raw unsafe bytes are encoded the
/// same way, so the output is stable under a second pass.
pub fn decode_fs_safe(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = match (bytes[i], bytes.get(i + 1..i + 3)) {
            (b'%', Some(hex)) => match u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                Ok(byte) => {
                    i += 3;
                    byte
                }
                Err(_) => {
                    i += 1;
                    b'%'
                }
            },
            (byte, _) => {
                i += 1;
                byte
            }
        };
        push_fs_safe(&mut out, decoded);
    }
    out
}

fn push_fs_safe(out: &mut String, byte: u8) {
    if is_fs_unsafe(byte) {
        out.push_str(&format!("%{byte:02x}"));
    } else {
        out.push(byte as char);
    }
}

/// Bytes a path component may not contain on the host OS. Non-ASCII
/// bytes stay encoded so the result is valid UTF-8 everywhere.
fn is_fs_unsafe(byte: u8) -> bool {
    if byte == 0 || byte == b'/' || byte >= 0x80 {
        return true;
    }
    #[cfg(windows)]
    if matches!(byte, b'"' | b'*' | b':' | b'<' | b'>' | b'?' | b'\\' | b'|') {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn mirror_rules() -> Vec<MirrorRule> {
        vec![
            MirrorRule {
                prefix: "https://main-server/".into(),
                mirrors: vec!["https://main-mirror1/".into(), "https://main-mirror2/".into()],
            },
            MirrorRule {
                prefix: "https://main-server/foo/".into(),
                mirrors: vec!["https://foo-mirror/".into()],
            },
        ]
    }

    #[test]
    fn find_mirrors_returns_the_url_itself_without_a_match() {
        assert_eq!(
            find_mirrors(&mirror_rules(), "https://no-mirror/foo/bar"),
            ["https://no-mirror/foo/bar"]
        );
    }

    #[test]
    fn find_mirrors_applies_every_matching_rule_in_order() {
        assert_eq!(
            find_mirrors(&mirror_rules(), "https://main-server/foo/bar"),
            [
                "https://main-mirror1/foo/bar",
                "https://main-mirror2/foo/bar",
                "https://foo-mirror/bar"
            ]
        );
    }

    #[rstest]
    #[case("http://host/file", "host/file")]
    #[case(
        "http://hos%74%00:8080/dir%61/./dirb///../%2e%2e/%2e/fi%6ce%2e%00%2f?quer%79=value%00#fragment",
        "host%00:8080/file.%00%2f?query=value%00"
    )]
    #[case("http://host/dir/", "host/dir/index.html")]
    #[case("http://host", "host/index.html")]
    #[case("http://host/", "host/index.html")]
    #[case("http://host/.", "host/index.html")]
    #[case("http://host/dir/?query=value", "host/dir/index.html?query=value")]
    #[case("http://host/dira/dirb/../../../../../../file", "host/file")]
    fn download_path_derivation(#[case] url: &str, #[case] expected: &str) {
        let outdir = Utf8Path::new("/out");
        assert_eq!(
            download_path(outdir, url).unwrap(),
            Utf8Path::new("/out").join(SOURCES_DIR).join(expected)
        );
    }

    #[test]
    fn download_path_is_idempotent() {
        let outdir = Utf8Path::new("/out");
        let first = download_path(outdir, "http://host/fi%6ce%2e%00%2f?quer%79=a").unwrap();
        for component in first.strip_prefix("/out/sources").unwrap().iter() {
            assert_eq!(decode_fs_safe(component), component);
        }
    }

    #[rstest]
    #[case("http://..", "illegal hostname: ..")]
    #[case("/foo/bar", "illegal hostname: (empty)")]
    fn illegal_hostnames(#[case] url: &str, #[case] message: &str) {
        let err = download_path(Utf8Path::new("/out"), url).unwrap_err();
        assert_eq!(err.to_string(), message);
    }

    #[test]
    fn hostname_extraction() {
        assert_eq!(hostname("http://main1-mirror1/src").unwrap().as_str(), "main1-mirror1");
        assert_eq!(hostname("git://nomirror/src4").unwrap().as_str(), "nomirror");
        assert!(hostname("not a url").is_err());
    }
}

//! File-backed include-URL resolution.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::traits::{IncludeUrlResolver, StorageError};

/// Parses an address list: one address per line, `#` starts a comment.
///
/// Lines that do not parse as an address are skipped with a warning.
#[must_use]
pub fn parse_ip_list(content: &str) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<IpAddr>() {
            Ok(addr) => out.push(addr),
            Err(_) => warn!(line = lineno + 1, value = line, "skipping unparsable address in ip list"),
        }
    }
    out
}

/// Resolves `file:` URLs (or bare paths) to the address list they contain.
///
/// Relative paths are resolved against `base_dir` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileIpListResolver {
    base_dir: Option<PathBuf>,
}

impl FileIpListResolver {
    /// Resolver for absolute paths only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with a base directory for relative paths.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn path_for(&self, url: &str) -> PathBuf {
        let raw = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")).unwrap_or(url);
        let path = Path::new(raw);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl IncludeUrlResolver for FileIpListResolver {
    fn resolve(&self, url: &str) -> Result<Vec<IpAddr>, StorageError> {
        let path = self.path_for(url);
        let content = fs::read_to_string(&path)
            .map_err(|e| StorageError::BackendError(format!("failed to read {}: {e}", path.display())))?;
        let addrs = parse_ip_list(&content);
        debug!(url, count = addrs.len(), "resolved include url");
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_garbage() {
        let list = "# core routers\n10.0.0.1\n\n10.0.0.2 # edge\nnot-an-ip\nfe80::1\n";
        let addrs = parse_ip_list(list);
        assert_eq!(
            addrs,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "10.0.0.2".parse().unwrap(),
                "fe80::1".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn resolves_file_urls_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("routers.txt"), "192.168.1.1\n192.168.1.2\n").unwrap();

        let resolver = FileIpListResolver::with_base_dir(dir.path());
        let addrs = resolver.resolve("file:routers.txt").unwrap();
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileIpListResolver::with_base_dir(dir.path());
        assert!(resolver.resolve("file:absent.txt").is_err());
    }
}

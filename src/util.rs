//! Small shared helpers: path-safe timestamps, byte formatting and the
//! process-wide cache directory handle.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{QSeekError, Result};

/// Format a UTC timestamp so it can be used as part of a file name.
pub fn time_to_path(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Human readable byte count, e.g. `3.2 MiB`.
pub fn human_readable_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Hex-encoded SHA-256 over the little-endian bit patterns of a float slice.
///
/// Used as content key for coordinate arrays so identical query geometries
/// hit the travel-time caches.
pub fn sha256_hex_f64(values: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Handle to the process-wide cache directory.
///
/// Threaded explicitly through the components that persist travel-time
/// tables; there is no global mutable state.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    /// Cache at the platform default location (`$XDG_CACHE_HOME/qseek` or
    /// `~/.cache/qseek`).
    pub fn default_location() -> Self {
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .unwrap_or_else(std::env::temp_dir);
        Self {
            root: base.join("qseek"),
        }
    }

    /// Cache rooted at an explicit path.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return a subsystem partition (e.g. `cake`), creating it if needed.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(|e| {
            QSeekError::io(format!("cannot create cache directory {}: {e}", dir.display()))
        })?;
        Ok(dir)
    }

    /// Remove all cached data.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| {
                QSeekError::io(format!("cannot clear cache {}: {e}", self.root.display()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable_bytes() {
        assert_eq!(human_readable_bytes(512.0), "512 B");
        assert_eq!(human_readable_bytes(2048.0), "2.0 KiB");
        assert_eq!(human_readable_bytes(3.5 * 1024.0 * 1024.0), "3.5 MiB");
    }

    #[test]
    fn test_time_to_path_has_no_colons() {
        let time = DateTime::parse_from_rfc3339("2023-04-11T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = time_to_path(time);
        assert_eq!(path, "2023-04-11T12-30-45");
        assert!(!path.contains(':'));
    }

    #[test]
    fn test_coordinate_hash_is_content_sensitive() {
        let a = sha256_hex_f64(&[1.0, 2.0, 3.0]);
        let b = sha256_hex_f64(&[1.0, 2.0, 3.0]);
        let c = sha256_hex_f64(&[1.0, 2.0, 3.000001]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

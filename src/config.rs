use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kubemux_engine::EngineConfig;

/// Optional overrides loaded from the config file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    buffer_capacity: Option<usize>,
    flush_interval_ms: Option<u64>,
    bottom_tolerance: Option<usize>,
    ssh_binary: Option<String>,
}

/// Default config file location: `~/.config/kubemux/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config").join("kubemux").join("config.toml"))
}

/// Build the engine config, overlaying the config file (when present) on
/// the built-in defaults. A missing file is not an error.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = EngineConfig::default();

    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let Some(path) = path else {
        return Ok(config);
    };

    let raw = std::fs::read_to_string(&path)
        .context(format!("Failed to read config file: {}", path.display()))?;
    let file: FileConfig = toml::from_str(&raw)
        .context(format!("Failed to parse config file: {}", path.display()))?;

    if let Some(capacity) = file.buffer_capacity {
        config.buffer_capacity = capacity;
    }
    if let Some(ms) = file.flush_interval_ms {
        config.flush_interval = Duration::from_millis(ms);
    }
    if let Some(rows) = file.bottom_tolerance {
        config.bottom_tolerance = rows;
    }
    if let Some(ssh) = file.ssh_binary {
        config.ssh_binary = ssh;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_engine_config(None).unwrap();
        assert_eq!(config.buffer_capacity, kubemux_engine::RING_CAPACITY);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "buffer_capacity = 1000\nflush_interval_ms = 16\nssh_binary = \"/usr/local/bin/ssh\""
        )
        .unwrap();

        let config = load_engine_config(Some(file.path())).unwrap();
        assert_eq!(config.buffer_capacity, 1000);
        assert_eq!(config.flush_interval, Duration::from_millis(16));
        assert_eq!(config.ssh_binary, "/usr/local/bin/ssh");
        // Untouched field keeps its default
        assert_eq!(config.bottom_tolerance, kubemux_engine::DEFAULT_BOTTOM_TOLERANCE);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not_a_key = true").unwrap();
        assert!(load_engine_config(Some(file.path())).is_err());
    }
}

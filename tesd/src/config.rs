use std::path::{Path, PathBuf};

use serde::Deserialize;

const CONFIG_FILE: &str = "tesd.toml";
const ENV_CONFIG_PATH: &str = "TESD_CONFIG";

/// Server configuration, loaded from `<confdir>/tesd.toml`. Every field
/// has a default so a missing or partial file is fine.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub mca: McaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the config directory. The path can be
    /// overridden with the `TESD_CONFIG` environment variable. A missing
    /// or unparseable file falls back to defaults.
    pub fn load(confdir: Option<&Path>) -> Self {
        let path = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => PathBuf::from(p),
            Err(_) => match confdir {
                Some(dir) => dir.join(CONFIG_FILE),
                None => return Config::default(),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!("cannot parse {}: {e}; using defaults", path.display());
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// All capture filenames must canonicalize under this directory.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Save every payload to a single `.adat` file instead of the
    /// per-type `.bdat/.mdat/.tdat/.edat` split.
    #[serde(default)]
    pub single_file: bool,
    /// Drop frames with a non-zero validity mask instead of routing them
    /// to the bad-payload stream.
    #[serde(default)]
    pub drop_bad_frames: bool,
    /// External HDF5 converter program; empty disables conversion.
    #[serde(default = "default_converter")]
    pub hdf5_converter: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            single_file: false,
            drop_bad_frames: false,
            hdf5_converter: default_converter(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/media/data/captures")
}

fn default_converter() -> PathBuf {
    PathBuf::from("tes-hdf5conv")
}

#[derive(Debug, Deserialize, Clone)]
pub struct McaConfig {
    /// Compute histogram sizes from the last-bin field instead of
    /// trusting the header's size field (the FPGA size-field bug).
    #[serde(default = "default_size_from_last_bin")]
    pub size_from_last_bin: bool,
}

impl Default for McaConfig {
    fn default() -> Self {
        Self { size_from_last_bin: default_size_from_last_bin() }
    }
}

fn default_size_from_last_bin() -> bool {
    true
}

impl McaConfig {
    pub fn size_mode(&self) -> tespkt::McaSizeMode {
        if self.size_from_last_bin {
            tespkt::McaSizeMode::FromLastBin
        } else {
            tespkt::McaSizeMode::FromSizeField
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log destination in daemon mode, where stderr points at /dev/null.
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: default_log_file() }
    }
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/tesd.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [capture]
            single_file = true
            "#,
        )
        .unwrap();
        assert!(cfg.capture.single_file);
        assert_eq!(cfg.capture.data_root, default_data_root());
        assert!(cfg.mca.size_from_last_bin);
    }

    #[test]
    fn missing_confdir_gives_defaults() {
        let cfg = Config::load(None);
        assert!(!cfg.capture.single_file);
    }
}

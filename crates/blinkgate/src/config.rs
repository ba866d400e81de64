use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use blinkgate_core::{BlinkConfig, LivenessConfig};
use serde::Deserialize;

/// Host configuration, loaded from `BLINKGATE_*` environment variables and
/// optionally overlaid by a TOML file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory receiving enrollment stills, one subdirectory per identity.
    pub image_dir: PathBuf,
    /// Orchestration and blink detection parameters.
    pub liveness: LivenessConfig,
}

/// Shape of the TOML overlay. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    liveness: Option<toml::Table>,
}

impl Config {
    /// Load configuration from `BLINKGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Environment configuration overlaid by `path`, or by the file named in
    /// `BLINKGATE_CONFIG` when no path is given. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("BLINKGATE_CONFIG").ok().map(PathBuf::from));

        if let Some(path) = path {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            config
                .apply_toml(&text)
                .with_context(|| format!("invalid config {}", path.display()))?;
            tracing::debug!(path = %path.display(), "applied config file");
        }

        config
            .liveness
            .validate()
            .context("invalid liveness configuration")?;
        Ok(config)
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("blinkgate");

        let defaults = LivenessConfig::default();
        let millis = |key: &str, default: Duration| {
            env_parse(&var, key).map(Duration::from_millis).unwrap_or(default)
        };

        let liveness = LivenessConfig {
            blink: BlinkConfig {
                close_threshold: env_parse(&var, "BLINKGATE_CLOSE_THRESHOLD")
                    .unwrap_or(defaults.blink.close_threshold),
                open_threshold: env_parse(&var, "BLINKGATE_OPEN_THRESHOLD")
                    .unwrap_or(defaults.blink.open_threshold),
                min_closed_frames: env_parse(&var, "BLINKGATE_MIN_CLOSED_FRAMES")
                    .unwrap_or(defaults.blink.min_closed_frames),
            },
            required_blinks: env_parse(&var, "BLINKGATE_REQUIRED_BLINKS")
                .unwrap_or(defaults.required_blinks),
            challenge_deadline: millis("BLINKGATE_DEADLINE_MS", defaults.challenge_deadline),
            model_load_timeout: millis("BLINKGATE_MODEL_TIMEOUT_MS", defaults.model_load_timeout),
            submission_timeout: millis("BLINKGATE_SUBMIT_TIMEOUT_MS", defaults.submission_timeout),
            frame_interval: millis("BLINKGATE_FRAME_INTERVAL_MS", defaults.frame_interval),
            max_consecutive_model_errors: env_parse(&var, "BLINKGATE_MAX_MODEL_ERRORS")
                .unwrap_or(defaults.max_consecutive_model_errors),
            auto_capture: env_flag(&var, "BLINKGATE_AUTO_CAPTURE", defaults.auto_capture),
            descriptor_len: env_parse(&var, "BLINKGATE_DESCRIPTOR_LEN").or(defaults.descriptor_len),
            still_quality: env_parse(&var, "BLINKGATE_STILL_QUALITY")
                .unwrap_or(defaults.still_quality),
            mirror_still: env_flag(&var, "BLINKGATE_MIRROR_STILL", defaults.mirror_still),
        };

        Self {
            db_path: var("BLINKGATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("enrollments.db")),
            image_dir: var("BLINKGATE_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("images")),
            liveness,
        }
    }

    /// Overlay the keys present in `text`. Keys absent from the file keep
    /// their current value.
    fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(db_path) = file.db_path {
            self.db_path = db_path;
        }
        if let Some(image_dir) = file.image_dir {
            self.image_dir = image_dir;
        }
        if let Some(overlay) = file.liveness {
            let mut current = toml::Value::try_from(&self.liveness)?;
            if let toml::Value::Table(table) = &mut current {
                merge(table, overlay);
            }
            self.liveness = current.try_into()?;
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.parse().ok())
}

fn env_flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key).map(|v| v != "0").unwrap_or(default)
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

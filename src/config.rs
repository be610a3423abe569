use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::runtime::Language;
use crate::sandbox::SandboxLimits;

/// The system configuration profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemProfile {
    /// Generous limits and verbose logging for local work
    Development,
    /// Balanced defaults, used by the test suite
    #[default]
    Testing,
    /// Tight limits for a live quiz
    Production,
    /// Keeps whatever the file says
    Custom,
}

impl std::str::FromStr for SystemProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(SystemProfile::Development),
            "test" | "testing" => Ok(SystemProfile::Testing),
            "prod" | "production" => Ok(SystemProfile::Production),
            "custom" => Ok(SystemProfile::Custom),
            other => bail!("Unknown profile '{}'", other),
        }
    }
}

/// Fixed-window quota per submitting identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Configuration for a specific language runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// Interpreter or VM binary, e.g. `/usr/bin/python3`
    pub runtime_path: Option<String>,

    /// Compiler binary for compiled languages
    pub compiler_path: Option<String>,

    /// Replaces the runner's default flags when non-empty
    pub extra_args: Vec<String>,
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub profile: SystemProfile,

    /// Parent directory for per-execution scratch directories
    pub scratch_dir: PathBuf,

    pub max_code_bytes: usize,
    pub max_output_bytes: usize,
    pub max_stderr_bytes: usize,

    pub default_time_limit_ms: u64,
    /// Per-request limits are clamped to this
    pub max_time_limit_ms: u64,
    pub compile_time_limit_ms: u64,

    pub max_concurrency: usize,
    /// How long a request may wait for a worker slot; unbounded when unset
    pub queue_timeout_ms: Option<u64>,

    pub cleanup_interval_secs: u64,
    pub cpu_rlimit_slack_secs: u64,

    pub log_level: String,
    /// `text` or `json`
    pub log_format: String,

    pub rate_limit: RateLimitConfig,

    /// Keyed by language name (`python`, `javascript`, `java`, `cpp`)
    pub languages: HashMap<String, LanguageConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            profile: SystemProfile::default(),
            scratch_dir: std::env::temp_dir().join("quiz-sandbox"),
            max_code_bytes: 64 * 1024,
            max_output_bytes: 1024 * 1024,
            max_stderr_bytes: 64 * 1024,
            default_time_limit_ms: 5_000,
            max_time_limit_ms: 15_000,
            compile_time_limit_ms: 15_000,
            max_concurrency: num_cpus::get().clamp(1, 4),
            queue_timeout_ms: None,
            cleanup_interval_secs: 60,
            cpu_rlimit_slack_secs: 1,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            rate_limit: RateLimitConfig::default(),
            languages: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config = Self::from_toml_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document on top of the presets of the profile it names.
    ///
    /// Keys present in the document win over the profile; absent keys take the
    /// profile's values rather than the plain defaults.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let file: toml::Table = toml::from_str(config_str)?;
        let profile = match file.get("profile") {
            Some(value) => value.clone().try_into::<SystemProfile>()?,
            None => SystemProfile::default(),
        };

        let mut merged = match toml::Value::try_from(Self::with_profile(profile))? {
            toml::Value::Table(table) => table,
            other => bail!("Configuration serialized to a {} instead of a table", other.type_str()),
        };
        merge_tables(&mut merged, file);
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Loads `path` if given, otherwise the default location, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_path = Self::default_path();
        if default_path.exists() {
            info!("Loaded configuration from {:?}", default_path);
            Self::load(&default_path)
        } else {
            debug!("Config file not found at {:?}, using defaults", default_path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let config_str = toml::to_string(self).context("Failed to serialize config to TOML")?;

        fs::write(config_path, config_str)
            .with_context(|| format!("Failed to write config to file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the default config path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("quiz-sandbox").join("config.toml")
        } else {
            PathBuf::from("./config.toml")
        }
    }

    /// Apply the system profile settings
    pub fn apply_profile(&mut self) {
        match self.profile {
            SystemProfile::Development => {
                self.default_time_limit_ms = 10_000;
                self.max_time_limit_ms = 30_000;
                self.rate_limit.max_requests = 120;
                self.queue_timeout_ms = None;
                self.log_level = "debug".to_string();
            }
            SystemProfile::Testing => {
                self.default_time_limit_ms = 5_000;
                self.max_time_limit_ms = 15_000;
                self.rate_limit.max_requests = 30;
                self.queue_timeout_ms = None;
                self.log_level = "info".to_string();
            }
            SystemProfile::Production => {
                self.default_time_limit_ms = 5_000;
                self.max_time_limit_ms = 10_000;
                self.rate_limit.max_requests = 30;
                self.queue_timeout_ms = Some(30_000);
                self.log_level = "warn".to_string();
            }
            SystemProfile::Custom => {
                debug!("Using custom profile with current settings");
            }
        }
    }

    /// Create a new configuration with the specified profile
    pub fn with_profile(profile: SystemProfile) -> Self {
        let mut config = Self {
            profile,
            ..Self::default()
        };
        config.apply_profile();
        config
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_code_bytes == 0 {
            bail!("max_code_bytes must be greater than zero");
        }
        if self.max_output_bytes == 0 {
            bail!("max_output_bytes must be greater than zero");
        }
        if self.default_time_limit_ms == 0 || self.max_time_limit_ms == 0 {
            bail!("time limits must be greater than zero");
        }
        if self.default_time_limit_ms > self.max_time_limit_ms {
            bail!(
                "default_time_limit_ms ({}) exceeds max_time_limit_ms ({})",
                self.default_time_limit_ms,
                self.max_time_limit_ms
            );
        }
        if self.compile_time_limit_ms == 0 {
            bail!("compile_time_limit_ms must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            bail!("rate_limit needs a non-zero quota and window");
        }
        for name in self.languages.keys() {
            name.parse::<Language>()
                .with_context(|| format!("Invalid [languages.{}] section", name))?;
        }
        Ok(())
    }

    /// Overrides for one language, empty when the file has none.
    pub fn language_config(&self, language: Language) -> LanguageConfig {
        self.languages
            .iter()
            .find(|(name, _)| name.parse::<Language>().ok() == Some(language))
            .map(|(_, config)| config.clone())
            .unwrap_or_default()
    }

    /// Requested limit, or the default, clamped to the configured maximum.
    pub fn effective_time_limit(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_time_limit_ms)
            .min(self.max_time_limit_ms);
        Duration::from_millis(ms)
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_code_bytes: self.max_code_bytes,
            max_output_bytes: self.max_output_bytes,
            max_stderr_bytes: self.max_stderr_bytes,
            compile_timeout: Duration::from_millis(self.compile_time_limit_ms),
            cpu_slack_s: self.cpu_rlimit_slack_secs,
        }
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(table)) => merge_tables(existing, table),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::EngineError;
use crate::install::DEFAULT_SCRIPT_PREFIX;
use crate::params::EngineParams;
use crate::paths;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct StoreConfig {
    /// Ticket store file. Empty means [`paths::ticket_store_path`].
    #[facet(default)]
    pub path: String,
    /// Stats file. Empty means [`paths::stats_path`].
    #[facet(default)]
    pub stats_path: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DownloadConfig {
    #[facet(default)]
    pub dir: String,
    #[facet(default = 60)]
    pub timeout_s: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct InstallConfig {
    /// Prefix of the installer scripts inside the image.
    pub script_prefix: Option<String>,
    #[facet(default)]
    pub script_log_dir: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ParamsConfig {
    pub machine_id: Option<String>,
    pub os_version: Option<String>,
    pub identity: Option<String>,
    #[facet(default)]
    pub allowed_subdomains: Vec<String>,
    pub update_check_tag: Option<String>,
    #[facet(default)]
    pub is_machine: bool,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub store: StoreConfig,
    #[facet(default)]
    pub download: DownloadConfig,
    #[facet(default)]
    pub install: InstallConfig,
    #[facet(default)]
    pub params: ParamsConfig,
}

/// A parsed config plus the directory its relative paths resolve against.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub config_path: PathBuf,
    pub base_dir: PathBuf,
    pub config: Config,
}

impl RunnerConfig {
    /// Defaults with relative paths resolving against the working directory.
    pub fn defaults(config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            base_dir: PathBuf::from("."),
            config: Config::default(),
        }
    }

    fn resolve(&self, value: &str, fallback: impl FnOnce() -> PathBuf) -> PathBuf {
        if value.is_empty() {
            return fallback();
        }
        let expanded = expand_home(value);
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.config.store.path, paths::ticket_store_path)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.resolve(&self.config.store.stats_path, paths::stats_path)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.resolve(&self.config.download.dir, paths::download_dir)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.config.download.timeout_s)
    }

    pub fn script_prefix(&self) -> &str {
        self.config
            .install
            .script_prefix
            .as_deref()
            .unwrap_or(DEFAULT_SCRIPT_PREFIX)
    }

    pub fn script_log_dir(&self) -> PathBuf {
        self.resolve(&self.config.install.script_log_dir, paths::script_logs_dir)
    }

    /// Run parameters seeded from `[params]`.
    pub fn engine_params(&self) -> EngineParams {
        let p = &self.config.params;
        EngineParams {
            machine_id: p.machine_id.clone(),
            os_version: p.os_version.clone(),
            identity: p.identity.clone(),
            allowed_subdomains: p.allowed_subdomains.clone(),
            update_check_tag: p.update_check_tag.clone(),
            is_machine: p.is_machine,
            ..Default::default()
        }
    }
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

fn validate_config(config: &Config) -> Result<(), EngineError> {
    if config.download.timeout_s == 0 {
        return Err(EngineError::Validation {
            message: "download.timeout_s must be at least 1".into(),
        });
    }
    if let Some(prefix) = &config.install.script_prefix {
        if prefix.trim().is_empty() {
            return Err(EngineError::Validation {
                message: "install.script_prefix must not be empty".into(),
            });
        }
        if prefix.contains('/') {
            return Err(EngineError::Validation {
                message: format!("install.script_prefix must be a file name (got '{prefix}')"),
            });
        }
    }
    for domain in &config.params.allowed_subdomains {
        if domain.trim_start_matches('.').is_empty() {
            return Err(EngineError::Validation {
                message: "params.allowed_subdomains entries must not be empty".into(),
            });
        }
    }
    Ok(())
}

pub fn parse_config(path: &Path, contents: &str) -> Result<Config, EngineError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| EngineError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the runner config. A missing file means all defaults.
pub fn load_config(path: &Path) -> Result<RunnerConfig, EngineError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(RunnerConfig::defaults(path));
        }
        Err(source) => {
            return Err(EngineError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config = parse_config(path, &contents)?;

    let canonical = path.canonicalize().map_err(|source| EngineError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let base_dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(RunnerConfig {
        config_path: canonical,
        base_dir,
        config,
    })
}

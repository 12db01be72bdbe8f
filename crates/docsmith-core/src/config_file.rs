use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::ConverterConfig;
use crate::tools::BinaryPaths;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server: Option<ServerConfig>,
    pub auth: Option<AuthConfig>,
    pub cors: Option<CorsConfig>,
    pub conversion: Option<ConversionConfig>,
    pub binaries: Option<BinariesConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub body_limit_mb: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub bearer_tokens: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    pub origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub temp_dir: Option<String>,
    pub tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinariesConfig {
    pub poppler_dir: Option<String>,
    pub pandoc: Option<String>,
    pub unrtf: Option<String>,
    pub antiword: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub dir: Option<String>,
}

/// Platform config directory path: `<config_dir>/docsmith/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("docsmith").join("config.toml"))
}

/// Load config by cascading CWD `.docsmith.toml` over platform config, then
/// the file named by `DOCSMITH_CONFIG` over both.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".docsmith.toml"));
    let explicit = std::env::var("DOCSMITH_CONFIG")
        .ok()
        .and_then(|p| load_from_path(Path::new(&p)));

    [platform, cwd, explicit]
        .into_iter()
        .flatten()
        .fold(ConfigFile::default(), merge)
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

fn pick<S, T: Clone>(
    base: &Option<S>,
    overlay: &Option<S>,
    field: impl Fn(&S) -> Option<T>,
) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        server: Some(ServerConfig {
            host: pick(&base.server, &overlay.server, |s| s.host.clone()),
            port: pick(&base.server, &overlay.server, |s| s.port),
            body_limit_mb: pick(&base.server, &overlay.server, |s| s.body_limit_mb),
        }),
        auth: Some(AuthConfig {
            bearer_tokens: pick(&base.auth, &overlay.auth, |a| a.bearer_tokens.clone()),
        }),
        cors: Some(CorsConfig {
            origins: pick(&base.cors, &overlay.cors, |c| c.origins.clone()),
        }),
        conversion: Some(ConversionConfig {
            temp_dir: pick(&base.conversion, &overlay.conversion, |c| {
                c.temp_dir.clone()
            }),
            tool_timeout_secs: pick(&base.conversion, &overlay.conversion, |c| {
                c.tool_timeout_secs
            }),
        }),
        binaries: Some(BinariesConfig {
            poppler_dir: pick(&base.binaries, &overlay.binaries, |b| {
                b.poppler_dir.clone()
            }),
            pandoc: pick(&base.binaries, &overlay.binaries, |b| b.pandoc.clone()),
            unrtf: pick(&base.binaries, &overlay.binaries, |b| b.unrtf.clone()),
            antiword: pick(&base.binaries, &overlay.binaries, |b| b.antiword.clone()),
        }),
        logging: Some(LoggingConfig {
            level: pick(&base.logging, &overlay.logging, |l| l.level.clone()),
            dir: pick(&base.logging, &overlay.logging, |l| l.dir.clone()),
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Overlay `DOCSMITH_*` variables on `config`. `lookup` is usually
/// `std::env::var(..).ok()`; tests pass a map.
pub fn apply_env(config: ConfigFile, lookup: impl Fn(&str) -> Option<String>) -> ConfigFile {
    let port = lookup("DOCSMITH_PORT").and_then(|p| match p.trim().parse::<u16>() {
        Ok(port) => Some(port),
        Err(_) => {
            tracing::warn!(value = %p, "ignoring invalid DOCSMITH_PORT");
            None
        }
    });
    let overlay = ConfigFile {
        server: Some(ServerConfig {
            host: lookup("DOCSMITH_HOST"),
            port,
            body_limit_mb: None,
        }),
        auth: Some(AuthConfig {
            bearer_tokens: lookup("DOCSMITH_BEARER_TOKENS").map(|v| split_list(&v)),
        }),
        cors: Some(CorsConfig {
            origins: lookup("DOCSMITH_CORS_ORIGINS").map(|v| split_list(&v)),
        }),
        conversion: Some(ConversionConfig {
            temp_dir: lookup("DOCSMITH_TEMP_DIR"),
            tool_timeout_secs: None,
        }),
        binaries: Some(BinariesConfig {
            poppler_dir: lookup("DOCSMITH_POPPLER_DIR"),
            ..Default::default()
        }),
        logging: Some(LoggingConfig {
            level: lookup("DOCSMITH_LOG_LEVEL"),
            dir: lookup("DOCSMITH_LOG_DIR"),
        }),
    };
    merge(config, overlay)
}

/// Fully resolved settings with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub bearer_tokens: Vec<String>,
    pub cors_origins: Vec<String>,
    pub converter: ConverterConfig,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&ConfigFile::default())
    }
}

impl Settings {
    pub fn from_config(config: &ConfigFile) -> Self {
        let server = config.server.clone().unwrap_or_default();
        let conversion = config.conversion.clone().unwrap_or_default();
        let binaries = config.binaries.clone().unwrap_or_default();
        let logging = config.logging.clone().unwrap_or_default();
        let defaults = ConverterConfig::default();
        let default_bins = BinaryPaths::default();

        Self {
            host: server.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: server.port.unwrap_or(3000),
            body_limit_bytes: server
                .body_limit_mb
                .unwrap_or(25)
                .saturating_mul(1024 * 1024),
            bearer_tokens: config
                .auth
                .as_ref()
                .and_then(|a| a.bearer_tokens.clone())
                .unwrap_or_default(),
            cors_origins: config
                .cors
                .as_ref()
                .and_then(|c| c.origins.clone())
                .unwrap_or_default(),
            converter: ConverterConfig {
                temp_dir: conversion
                    .temp_dir
                    .map(PathBuf::from)
                    .unwrap_or(defaults.temp_dir),
                binaries: BinaryPaths {
                    poppler_dir: binaries.poppler_dir.map(PathBuf::from),
                    pandoc: binaries
                        .pandoc
                        .map(PathBuf::from)
                        .unwrap_or(default_bins.pandoc),
                    unrtf: binaries
                        .unrtf
                        .map(PathBuf::from)
                        .unwrap_or(default_bins.unrtf),
                    antiword: binaries
                        .antiword
                        .map(PathBuf::from)
                        .unwrap_or(default_bins.antiword),
                },
                tool_timeout: conversion
                    .tool_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.tool_timeout),
            },
            log_level: logging.level.unwrap_or_else(|| "info".to_string()),
            log_dir: logging.dir.map(PathBuf::from),
        }
    }

    /// Files, then environment.
    pub fn load() -> Self {
        let config = apply_env(load_config(), |key| std::env::var(key).ok());
        Self::from_config(&config)
    }
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_VIDSHARE_PORT: u16 = 8080;
pub const DEFAULT_VIDSHARE_HOST: &str = "127.0.0.1";
pub const DEFAULT_STREAM_API_BASE: &str = "https://video.bunnycdn.com";
pub const DEFAULT_STREAM_UPLOAD_ENDPOINT: &str = "https://video.bunnycdn.com/tusupload";
/// 1.5 GiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1_610_612_736;
pub const CATALOG_DB_FILE: &str = "catalog.db";
const WWW_SUBDIR: &str = "www";

/// Connection details for the video streaming provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub library_id: Option<String>,
    pub api_key: Option<String>,
    pub api_base: String,
    pub upload_endpoint: String,
}

impl ProviderSettings {
    /// Returns `(library_id, api_key)` or explains which key is missing.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        let library_id = self
            .library_id
            .as_deref()
            .ok_or_else(|| anyhow!("STREAM_LIBRARY_ID not set"))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("STREAM_API_KEY not set"))?;
        Ok((library_id, api_key))
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            library_id: None,
            api_key: None,
            api_base: DEFAULT_STREAM_API_BASE.to_string(),
            upload_endpoint: DEFAULT_STREAM_UPLOAD_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_root: PathBuf,
    pub www_root: PathBuf,
    pub vidshare_port: u16,
    pub vidshare_host: String,
    pub max_upload_bytes: u64,
    pub provider: ProviderSettings,
}

impl RuntimeSettings {
    pub fn catalog_path(&self) -> PathBuf {
        self.data_root.join(CATALOG_DB_FILE)
    }
}

/// Command-line values; each one wins over the environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub vidshare_port: Option<u16>,
    pub vidshare_host: Option<String>,
    /// Read instead of `./.env`.
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DATA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("DATA_ROOT not set"))?;
    let data_root = PathBuf::from(data_root);
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| data_root.join(WWW_SUBDIR));
    let vidshare_port = overrides
        .vidshare_port
        .or_else(|| {
            lookup_value("VIDSHARE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_VIDSHARE_PORT);
    let vidshare_host = overrides
        .vidshare_host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("VIDSHARE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_VIDSHARE_HOST.to_string());
    let max_upload_bytes = lookup_value("MAX_UPLOAD_BYTES", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
    let provider = ProviderSettings {
        library_id: lookup_value("STREAM_LIBRARY_ID", file_vars, &env_lookup),
        api_key: lookup_value("STREAM_API_KEY", file_vars, &env_lookup),
        api_base: lookup_value("STREAM_API_BASE", file_vars, &env_lookup)
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_STREAM_API_BASE.to_string()),
        upload_endpoint: lookup_value("STREAM_UPLOAD_ENDPOINT", file_vars, &env_lookup)
            .unwrap_or_else(|| DEFAULT_STREAM_UPLOAD_ENDPOINT.to_string()),
    };

    Ok(RuntimeSettings {
        data_root,
        www_root,
        vidshare_port,
        vidshare_host,
        max_upload_bytes,
        provider,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

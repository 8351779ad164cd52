#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::export::ExportConfig;
use crate::filter_graph::EncodeProfile;
use crate::process::SystemRunner;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CLIPTUBE_PORT: u16 = 8080;
pub const DEFAULT_CLIPTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user";
pub const METADATA_DB_FILE: &str = "metadata.db";
const STORAGE_SUBDIR: &str = "storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
}

impl StorageBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "disk" => Some(Self::Local),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root directory for the local backend; one subdirectory per bucket.
    pub root: PathBuf,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub storage: StorageSettings,
    pub cdn_base_url: Option<String>,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub scratch_root: Option<PathBuf>,
    pub export_timeout: Option<Duration>,
    /// Per-invocation limit for ffmpeg/ffprobe.
    pub process_timeout: Option<Duration>,
    pub identity_header: String,
}

impl RuntimeConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.media_root.join(METADATA_DB_FILE)
    }

    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            bucket: self.storage.bucket.clone(),
            scratch_root: self.scratch_root.clone(),
            ffmpeg: self.ffmpeg_bin.clone(),
            ffprobe: self.ffprobe_bin.clone(),
            profile: EncodeProfile::default(),
            deadline: self.export_timeout,
        }
    }

    pub fn process_runner(&self) -> SystemRunner {
        match self.process_timeout {
            Some(timeout) => SystemRunner::new().with_timeout(timeout),
            None => SystemRunner::new(),
        }
    }
}

/// Values supplied on the command line. They win over the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub storage_backend: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub bucket: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let media_root = overrides
        .media_root
        .or_else(|| lookup("MEDIA_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    let port = overrides
        .port
        .or_else(|| lookup("CLIPTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_CLIPTUBE_PORT);
    let host = non_blank(overrides.host)
        .or_else(|| lookup("CLIPTUBE_HOST"))
        .unwrap_or_else(|| DEFAULT_CLIPTUBE_HOST.to_string());

    let backend = match non_blank(overrides.storage_backend).or_else(|| lookup("STORAGE_BACKEND")) {
        Some(raw) => StorageBackend::parse(&raw)
            .with_context(|| format!("unsupported STORAGE_BACKEND {raw:?}; expected local or s3"))?,
        None => StorageBackend::Local,
    };
    let storage_root = overrides
        .storage_root
        .or_else(|| lookup("STORAGE_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| media_root.join(STORAGE_SUBDIR));
    let bucket = non_blank(overrides.bucket).or_else(|| lookup("STORAGE_BUCKET"));

    let export_timeout = timeout_secs("EXPORT_TIMEOUT_SECS", lookup("EXPORT_TIMEOUT_SECS"))?;
    let process_timeout = timeout_secs("PROCESS_TIMEOUT_SECS", lookup("PROCESS_TIMEOUT_SECS"))?;

    Ok(RuntimeConfig {
        storage: StorageSettings {
            backend,
            root: storage_root,
            bucket,
            region: lookup("AWS_REGION"),
            endpoint_url: lookup("S3_ENDPOINT_URL"),
        },
        cdn_base_url: lookup("CDN_BASE_URL").map(|url| url.trim_end_matches('/').to_string()),
        ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".into()),
        ffprobe_bin: lookup("FFPROBE_BIN").unwrap_or_else(|| "ffprobe".into()),
        scratch_root: lookup("SCRATCH_ROOT").map(PathBuf::from),
        export_timeout,
        process_timeout,
        identity_header: lookup("IDENTITY_HEADER")
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_IDENTITY_HEADER.to_string()),
        media_root,
        host,
        port,
    })
}

/// Whole seconds; unset or `0` means no limit.
fn timeout_secs(key: &str, raw: Option<String>) -> Result<Option<Duration>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
        Err(_) => bail!("{key} must be a whole number of seconds, got {raw:?}"),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
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

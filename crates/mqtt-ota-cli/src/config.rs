use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use mqtt_ota::{
    BrokerConfig, FailurePolicy, UploadConfig, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_BROKER_PORT,
    DEFAULT_CHUNK_SIZE, DEFAULT_FILE_TYPE, DEFAULT_SESSION_ID,
};

/// Everything one invocation needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerConfig,
    /// Device topic, e.g. `demo` for `cmnd/demo/fileupload`.
    pub topic: String,
    pub upload: UploadConfig,
}

impl Settings {
    /// Read settings from the process environment. `file_arg` overrides `OTA_FILE`.
    pub fn from_env(file_arg: Option<String>) -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), file_arg)
    }

    pub fn from_lookup<F>(lookup: F, file_arg: Option<String>) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = get("OTA_BROKER_HOST").unwrap_or_else(|| "localhost".into());
        let port: u16 = parse_or(&get, "OTA_BROKER_PORT", DEFAULT_BROKER_PORT)?;

        let mut broker = BrokerConfig::new(host, port);
        if let Some(client_id) = get("OTA_CLIENT_ID") {
            broker.client_id = client_id;
        }
        if let Some(ms) = get("OTA_CONNECT_TIMEOUT_MS") {
            broker.connect_timeout = Duration::from_millis(
                ms.parse().context("OTA_CONNECT_TIMEOUT_MS must be a number")?,
            );
        }

        let topic = get("OTA_TOPIC").ok_or_else(|| anyhow!("OTA_TOPIC is not set"))?;
        if topic.contains(['/', '+', '#']) {
            bail!("OTA_TOPIC must be a single topic level, got '{}'", topic);
        }

        let file_path: PathBuf = file_arg
            .filter(|f| !f.trim().is_empty())
            .or_else(|| get("OTA_FILE"))
            .ok_or_else(|| anyhow!("no firmware file: pass a path or set OTA_FILE"))?
            .into();

        let mut upload = UploadConfig::new(file_path);
        upload.file_type = parse_or(&get, "OTA_FILE_TYPE", DEFAULT_FILE_TYPE)?;
        upload.session_id = parse_or(&get, "OTA_SESSION_ID", DEFAULT_SESSION_ID)?;
        upload.default_chunk_size = parse_or(&get, "OTA_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        upload.ack_timeout =
            Duration::from_millis(parse_or(&get, "OTA_ACK_TIMEOUT_MS", DEFAULT_ACK_TIMEOUT_MS)?);
        if let Some(policy) = get("OTA_ON_FAILURE") {
            upload.failure_policy = policy
                .parse::<FailurePolicy>()
                .map_err(|e| anyhow!("OTA_ON_FAILURE: {}", e))?;
        }
        if let Some(flag) = get("OTA_ERROR_ENDS_WAIT") {
            upload.error_ends_wait = parse_bool(&flag)
                .ok_or_else(|| anyhow!("OTA_ERROR_ENDS_WAIT must be true or false, got '{}'", flag))?;
        }
        upload.validate()?;

        Ok(Self {
            broker,
            topic,
            upload,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", key, v)),
        None => Ok(default),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

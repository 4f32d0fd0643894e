use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::sandbox::SandboxConfig;

pub const DEFAULT_CDN_BASE: &str = "https://esm.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub cdn_base: String,
    pub execution_timeout: Duration,
    pub memory_limit_mb: u64,
    pub memory_poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("ARTIFACT_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
            .parse()
            .context("invalid ARTIFACT_ADDR")?;

        let data_dir = env::var("ARTIFACT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let cdn_base = env::var("ARTIFACT_CDN_BASE")
            .unwrap_or_else(|_| DEFAULT_CDN_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let execution_timeout = parse_millis("ARTIFACT_EXEC_TIMEOUT_MS", 5_000)?;
        let memory_limit_mb = parse_u64("ARTIFACT_MEMORY_LIMIT_MB", 50)?;
        let memory_poll_interval = parse_millis("ARTIFACT_MEMORY_POLL_MS", 1_000)?;
        let fetch_timeout = Duration::from_secs(parse_u64("ARTIFACT_FETCH_TIMEOUT_SECONDS", 10)?);

        let log_format = match env::var("ARTIFACT_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            listen_addr,
            data_dir,
            cdn_base,
            execution_timeout,
            memory_limit_mb,
            memory_poll_interval,
            fetch_timeout,
            log_format,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            execution_timeout: self.execution_timeout,
            memory_limit_mb: self.memory_limit_mb,
            memory_poll_interval: self.memory_poll_interval,
            cdn_base: self.cdn_base.clone(),
        }
    }
}

fn parse_u64(env_key: &str, default: u64) -> Result<u64> {
    let raw = env::var(env_key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{env_key} must be a non-negative integer"))
}

fn parse_millis(env_key: &str, default_ms: u64) -> Result<Duration> {
    let millis = parse_u64(env_key, default_ms)
        .with_context(|| format!("{env_key} must be an integer number of milliseconds"))?;

    Ok(Duration::from_millis(millis))
}

use anyhow::{bail, Context, Result};
use aoc_stream::{ReconnectionConfig, WILDCARD_TOPIC};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Default)]
#[command(name = "aoc-stream-tail", about = "Tail the live agent status stream")]
pub struct Args {
    /// Stream endpoint (http(s):// for SSE, ws(s):// for WebSocket).
    #[arg(long, env = "AOC_STREAM_URL")]
    pub url: Option<String>,
    #[arg(long, value_enum, env = "AOC_STREAM_TRANSPORT")]
    pub transport: Option<TransportKind>,
    /// Event type to print; repeat for several. Defaults to every event.
    #[arg(long = "topic", env = "AOC_STREAM_TOPICS", value_delimiter = ',')]
    pub topics: Vec<String>,
    #[arg(long, env = "AOC_STREAM_INITIAL_DELAY_MS")]
    pub initial_delay_ms: Option<u64>,
    #[arg(long, env = "AOC_STREAM_MAX_DELAY_MS")]
    pub max_delay_ms: Option<u64>,
    #[arg(long, env = "AOC_STREAM_FULL_REFRESH_MS")]
    pub full_refresh_threshold_ms: Option<u64>,
    #[arg(long, env = "AOC_STREAM_BACKOFF_MULTIPLIER")]
    pub backoff_multiplier: Option<f64>,
    /// Resume position to send on the first connection.
    #[arg(long, env = "AOC_STREAM_LAST_EVENT_ID")]
    pub last_event_id: Option<String>,
    /// Shell command printing a JSON snapshot; run at start and on every
    /// full-refresh signal.
    #[arg(long, env = "AOC_STREAM_SNAPSHOT_CMD")]
    pub snapshot_command: Option<String>,
    #[arg(long, env = "AOC_STREAM_SNAPSHOT_TIMEOUT_MS")]
    pub snapshot_timeout_ms: Option<u64>,
    /// Print events as JSON envelopes.
    #[arg(long, default_value_t = false)]
    pub json: bool,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, env = "AOC_STREAM_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Sse,
    Ws,
}

impl TransportKind {
    fn infer(url: &str) -> Self {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            Self::Ws
        } else {
            Self::Sse
        }
    }
}

/// Optional TOML settings file. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub url: Option<String>,
    pub transport: Option<TransportKind>,
    pub topics: Vec<String>,
    pub last_event_id: Option<String>,
    pub snapshot_command: Option<String>,
    pub snapshot_timeout_ms: Option<u64>,
    pub json: bool,
    pub reconnect: Option<ReconnectionConfig>,
}

pub fn load_settings(path: Option<&Path>) -> Result<FileSettings> {
    let Some(path) = path else {
        return Ok(FileSettings::default());
    };
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct TailOptions {
    pub url: String,
    pub transport: TransportKind,
    pub topics: Vec<String>,
    pub reconnect: ReconnectionConfig,
    pub last_event_id: Option<String>,
    pub snapshot_command: Option<String>,
    pub snapshot_timeout: Option<Duration>,
    pub json: bool,
    pub debug: bool,
}

impl TailOptions {
    /// Flags and environment win over the settings file, which wins over
    /// built-in defaults.
    pub fn resolve(args: Args, file: FileSettings) -> Result<Self> {
        let url = non_empty(args.url)
            .or_else(|| non_empty(file.url))
            .context("no stream url: pass --url, set AOC_STREAM_URL, or add url to the config file")?;
        let transport = args
            .transport
            .or(file.transport)
            .unwrap_or_else(|| TransportKind::infer(&url));

        let mut reconnect = file.reconnect.unwrap_or_default();
        if let Some(ms) = args.initial_delay_ms {
            reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = args.max_delay_ms {
            reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = args.full_refresh_threshold_ms {
            reconnect.full_refresh_threshold = Duration::from_millis(ms);
        }
        if let Some(multiplier) = args.backoff_multiplier {
            reconnect.backoff_multiplier = multiplier;
        }
        if let Err(err) = reconnect.validate() {
            bail!("reconnect settings: {err}");
        }

        let topics = if args.topics.is_empty() {
            file.topics
        } else {
            args.topics
        };

        Ok(Self {
            url,
            transport,
            topics: normalize_topics(topics),
            reconnect,
            last_event_id: non_empty(args.last_event_id).or_else(|| non_empty(file.last_event_id)),
            snapshot_command: non_empty(args.snapshot_command)
                .or_else(|| non_empty(file.snapshot_command)),
            snapshot_timeout: args
                .snapshot_timeout_ms
                .or(file.snapshot_timeout_ms)
                .map(Duration::from_millis),
            json: args.json || file.json,
            debug: args.debug,
        })
    }
}

/// A wildcard swallows every exact topic so no event prints twice.
fn normalize_topics(topics: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for topic in topics {
        let topic = topic.trim();
        if topic.is_empty() {
            continue;
        }
        if topic == WILDCARD_TOPIC {
            return vec![WILDCARD_TOPIC.to_string()];
        }
        if !out.iter().any(|existing| existing == topic) {
            out.push(topic.to_string());
        }
    }
    if out.is_empty() {
        out.push(WILDCARD_TOPIC.to_string());
    }
    out
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

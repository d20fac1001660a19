//! One-shot load pipeline: read `jobs.json`, normalize, confirm, push.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobload_core::{
    transform, IdGenerator, NormalizedJobRecord, OperatorIdentity, RawJobRecord,
    TransformContext, UuidIdGenerator,
};
use jobload_store::{
    ObjectIdGenerator, RecordSink, StoreConfig, TunnelConfig, DEFAULT_COLLECTION,
    DEFAULT_DATABASE, DEFAULT_DST_HOST, DEFAULT_DST_PORT, DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT,
    DEFAULT_SERVER_SELECTION_TIMEOUT, DEFAULT_SSH_PORT,
};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "jobload-pipeline";

pub const DEFAULT_INPUT_FILE: &str = "jobs.json";
pub const CONFIRM_PROMPT: &str = "push to server database? ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdFormat {
    #[default]
    ObjectId,
    Uuid,
}

impl IdFormat {
    pub fn generator(self) -> Box<dyn IdGenerator> {
        match self {
            IdFormat::ObjectId => Box::new(ObjectIdGenerator),
            IdFormat::Uuid => Box::new(UuidIdGenerator),
        }
    }
}

/// Operator-side settings needed before the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub operator: OperatorIdentity,
    pub id_format: IdFormat,
}

impl LoaderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let id_format = match lookup("JOBLOAD_ID_FORMAT").as_deref().map(str::trim) {
            None | Some("") => IdFormat::default(),
            Some(v) if v.eq_ignore_ascii_case("objectid") => IdFormat::ObjectId,
            Some(v) if v.eq_ignore_ascii_case("uuid") => IdFormat::Uuid,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "JOBLOAD_ID_FORMAT",
                    value: other.to_string(),
                    reason: "expected `objectid` or `uuid`".to_string(),
                })
            }
        };

        Ok(Self {
            operator: OperatorIdentity {
                user_id: required(&lookup, "JOBLOAD_USER_ID")?,
                user_name: required(&lookup, "JOBLOAD_USER_NAME")?,
            },
            id_format,
        })
    }
}

/// Remote store settings; only resolved once the operator has confirmed the push.
pub fn store_config_from_env() -> Result<StoreConfig, ConfigError> {
    store_config_from_lookup(|key| std::env::var(key).ok())
}

pub fn store_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<StoreConfig, ConfigError> {
    let tunnel = TunnelConfig {
        host: required(&lookup, "JOBLOAD_SSH_HOST")?,
        port: port_or(&lookup, "JOBLOAD_SSH_PORT", DEFAULT_SSH_PORT)?,
        username: required(&lookup, "JOBLOAD_SSH_USERNAME")?,
        password: optional(&lookup, "JOBLOAD_SSH_PASSWORD"),
        agent_socket: optional(&lookup, "SSH_AUTH_SOCK").map(PathBuf::from),
        local_host: optional(&lookup, "JOBLOAD_TUNNEL_LOCAL_HOST")
            .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
        local_port: port_or(&lookup, "JOBLOAD_TUNNEL_LOCAL_PORT", DEFAULT_LOCAL_PORT)?,
        dst_host: optional(&lookup, "JOBLOAD_TUNNEL_DST_HOST")
            .unwrap_or_else(|| DEFAULT_DST_HOST.to_string()),
        dst_port: port_or(&lookup, "JOBLOAD_TUNNEL_DST_PORT", DEFAULT_DST_PORT)?,
        strict_host_key: optional(&lookup, "JOBLOAD_SSH_STRICT_HOST_KEY")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false),
    };

    Ok(StoreConfig {
        tunnel,
        database: optional(&lookup, "JOBLOAD_MONGO_DATABASE")
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
        collection: optional(&lookup, "JOBLOAD_MONGO_COLLECTION")
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
        server_selection_timeout: match optional(&lookup, "JOBLOAD_MONGO_SELECTION_TIMEOUT_MS") {
            None => DEFAULT_SERVER_SELECTION_TIMEOUT,
            Some(value) => value
                .trim()
                .parse()
                .map(Duration::from_millis)
                .map_err(|err: std::num::ParseIntError| ConfigError::Invalid {
                    var: "JOBLOAD_MONGO_SELECTION_TIMEOUT_MS",
                    value,
                    reason: err.to_string(),
                })?,
        },
    })
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var).filter(|v| !v.trim().is_empty())
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    optional(lookup, var).ok_or(ConfigError::Missing(var))
}

fn port_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u16,
) -> Result<u16, ConfigError> {
    match optional(lookup, var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|err: std::num::ParseIntError| {
            ConfigError::Invalid {
                var,
                value,
                reason: err.to_string(),
            }
        }),
    }
}

pub fn load_raw_record(path: impl AsRef<Path>) -> Result<RawJobRecord> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Writes the prompt, reads one line, and accepts only `y`/`Y` (surrounding whitespace ignored).
pub fn confirm<R, W>(input: &mut R, output: &mut W, prompt: &str) -> io::Result<bool>
where
    R: BufRead + ?Sized,
    W: Write + ?Sized,
{
    output.write_all(prompt.as_bytes())?;
    output.flush()?;

    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        return Ok(false);
    }
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<bool>;
}

/// Blocks on the process's stdin/stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalGate;

#[async_trait]
impl ConfirmationGate for TerminalGate {
    async fn ask(&self, prompt: &str) -> Result<bool> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            let mut output = io::stdout();
            confirm(&mut input, &mut output, &prompt)
        })
        .await
        .context("joining confirmation prompt")?
        .context("reading confirmation answer")
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub location: Option<String>,
    /// Captured once by the caller; every timestamp in the run uses it.
    pub started_at: DateTime<Utc>,
}

impl RunOptions {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            input: PathBuf::from(DEFAULT_INPUT_FILE),
            location: None,
            started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRunSummary {
    pub record: NormalizedJobRecord,
    pub pushed: bool,
    pub inserted_ids: Vec<String>,
}

pub struct JobLoader {
    config: LoaderConfig,
    ids: Box<dyn IdGenerator>,
}

impl JobLoader {
    pub fn new(config: LoaderConfig) -> Self {
        let ids = config.id_format.generator();
        Self { config, ids }
    }

    pub fn with_id_generator(mut self, ids: Box<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn prepare(&self, options: &RunOptions) -> Result<NormalizedJobRecord> {
        let raw = load_raw_record(&options.input)?;
        let ctx = TransformContext {
            operator: self.config.operator.clone(),
            timestamp: options.started_at,
            location: options
                .location
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        };
        Ok(transform(raw, &ctx, self.ids.as_ref()))
    }

    /// Prints the normalized record, asks the operator, and writes through the sink on `y`.
    /// The sink is only opened after confirmation.
    pub async fn run_once<F>(
        &self,
        options: &RunOptions,
        preview: &mut (dyn Write + Send),
        gate: &dyn ConfirmationGate,
        open_sink: F,
    ) -> Result<LoadRunSummary>
    where
        F: FnOnce() -> Result<Arc<dyn RecordSink>> + Send,
    {
        let record = self.prepare(options)?;
        info!(id = %record.id, input = %options.input.display(), "job record normalized");

        let rendered =
            serde_json::to_string_pretty(&record).context("rendering normalized record")?;
        writeln!(preview, "{rendered}").context("writing record preview")?;
        preview.flush().context("flushing record preview")?;

        if !gate.ask(CONFIRM_PROMPT).await? {
            info!(id = %record.id, "push declined by operator");
            return Ok(LoadRunSummary {
                record,
                pushed: false,
                inserted_ids: Vec::new(),
            });
        }

        let sink = open_sink()?;
        let report = sink
            .write(std::slice::from_ref(&record))
            .await
            .with_context(|| format!("pushing job record {}", record.id))?;

        Ok(LoadRunSummary {
            record,
            pushed: true,
            inserted_ids: report.inserted_ids,
        })
    }
}

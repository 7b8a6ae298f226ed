//! Child-process boundary to the media extraction engine (`yt-dlp`).

use std::io::ErrorKind;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::config::EngineConfig;

/// Printed once the engine has moved the final file into place.
const FETCH_REPORT_TEMPLATE: &str =
    r#"after_move:{"title":%(title)j,"filepath":%(filepath)j}"#;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{program} is not installed")]
    NotInstalled { program: String },
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine timed out after {seconds}s")]
    TimedOut { seconds: u64 },
    #[error("{message}")]
    Failed { message: String },
    #[error("unreadable engine output: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Metadata document as emitted by `yt-dlp -J`. Every field is optional
/// because extractors disagree on what they report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMediaInfo {
    #[serde(default, rename = "_type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    #[serde(default)]
    pub entries: Vec<Option<RawMediaInfo>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
    pub vbr: Option<f64>,
    pub abr: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub format_note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchJob {
    pub url: String,
    pub selector: String,
    /// Output template with an `%(ext)s` placeholder the engine fills in.
    pub output_template: String,
}

/// What the engine claims it produced. Not trusted for the final path.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FetchReport {
    pub title: Option<String>,
    pub filepath: Option<String>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn probe(&self, url: &str) -> Result<RawMediaInfo, EngineError>;
    async fn fetch(&self, job: &FetchJob) -> Result<FetchReport, EngineError>;
}

pub struct YtDlpEngine {
    config: EngineConfig,
}

impl YtDlpEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn network_args(&self) -> Vec<String> {
        let retries = self.config.retries.to_string();
        vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            self.config.socket_timeout_seconds.to_string(),
            "--retries".to_string(),
            retries.clone(),
            "--fragment-retries".to_string(),
            retries,
        ]
    }

    async fn run(
        &self,
        args: Vec<String>,
        limit: std::time::Duration,
    ) -> Result<std::process::Output, EngineError> {
        let program = &self.config.program;
        debug!(%program, ?args, "running engine");

        let command_future = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(limit, command_future)
            .await
            .map_err(|_| EngineError::TimedOut {
                seconds: limit.as_secs(),
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    EngineError::NotInstalled {
                        program: program.clone(),
                    }
                } else {
                    EngineError::Spawn {
                        program: program.clone(),
                        source: error,
                    }
                }
            })?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                message: run_error_message(&output.stderr),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    async fn probe(&self, url: &str) -> Result<RawMediaInfo, EngineError> {
        let mut args = vec!["-J".to_string(), "--skip-download".to_string()];
        args.extend(self.network_args());
        args.push("--".to_string());
        args.push(url.to_string());

        let output = self.run(args, self.config.probe_timeout).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn fetch(&self, job: &FetchJob) -> Result<FetchReport, EngineError> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-progress".to_string(),
            "--no-simulate".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "-f".to_string(),
            job.selector.clone(),
            "-o".to_string(),
            job.output_template.clone(),
            "--print".to_string(),
            FETCH_REPORT_TEMPLATE.to_string(),
        ];
        args.extend(self.network_args());
        args.push("--".to_string());
        args.push(job.url.clone());

        let output = self.run(args, self.config.fetch_timeout).await?;
        Ok(parse_fetch_report(&output.stdout))
    }
}

/// Keeps every `ERROR:` line so phrase matching sees the whole reason;
/// falls back to the last line of stderr.
fn run_error_message(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    let errors = lines
        .iter()
        .filter(|line| line.starts_with("ERROR:"))
        .copied()
        .collect::<Vec<_>>();

    if !errors.is_empty() {
        return errors.join(" | ");
    }

    lines
        .last()
        .copied()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn parse_fetch_report(stdout: &[u8]) -> FetchReport {
    let text = String::from_utf8_lossy(stdout);
    let Some(line) = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
    else {
        return FetchReport::default();
    };

    serde_json::from_str(line).unwrap_or_else(|_| FetchReport {
        title: None,
        filepath: Some(line.to_string()),
    })
}

use crate::adapters::meru::DEFAULT_BASE_URL;
use crate::error::ClientError;
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::fs::create_dir_all;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::{sleep, Duration};

pub const TRAIN_POLL_INTERVAL_SECS: u64 = 180;
pub const TRAIN_POLL_MAX_ATTEMPTS: u32 = 40;
pub const INFER_POLL_INTERVAL_SECS: u64 = 40;
pub const INFER_POLL_MAX_ATTEMPTS: u32 = 45;
/// Lowercase variable name older setups export the key under.
pub const LEGACY_API_KEY_ENV: &str = "meru_api_key";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// API key; falls back to `meru_api_key`, then a stdin prompt.
    #[clap(long, env = "MERU_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[clap(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[clap(short, long, value_parser, default_value = "./input")]
    pub input: PathBuf,

    #[clap(short, long, value_parser, default_value = "./output")]
    pub output: PathBuf,

    /// Where the train_id / class_name record lives.
    #[clap(long, value_parser, default_value = "./model_details.txt")]
    pub record: PathBuf,

    /// Create a new train job instead of loading the record.
    #[clap(long)]
    pub new: bool,

    #[clap(long)]
    pub class_name: Option<String>,

    /// Prefix output images with a timestamp and the inference id.
    #[clap(long)]
    pub timestamped: bool,

    #[clap(long, default_value_t = TRAIN_POLL_INTERVAL_SECS)]
    pub train_poll_secs: u64,

    #[clap(long, default_value_t = TRAIN_POLL_MAX_ATTEMPTS)]
    pub train_poll_attempts: u32,

    #[clap(long, default_value_t = INFER_POLL_INTERVAL_SECS)]
    pub infer_poll_secs: u64,

    #[clap(long, default_value_t = INFER_POLL_MAX_ATTEMPTS)]
    pub infer_poll_attempts: u32,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PromptArgs {
    #[clap(long, default_value_t = 1)]
    pub num_samples: u32,

    #[clap(long, default_value_t = 42)]
    pub seed: u64,

    #[clap(long, default_value_t = 10)]
    pub guidance_scale: u32,

    #[clap(long)]
    pub callback_url: Option<String>,

    /// Open the composite preview in the system image viewer.
    #[clap(long)]
    pub show: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a train job and write the record.
    Create,
    /// Upload the input images to the train job.
    Upload,
    /// Upload images, run training and wait for the model.
    Train {
        #[clap(long, default_value_t = 1600)]
        epochs: u32,

        #[clap(long, default_value_t = 100)]
        text_enc: u32,

        #[clap(long)]
        callback_url: Option<String>,

        #[clap(long)]
        skip_download: bool,

        #[clap(long, value_parser, default_value = "./img_model")]
        model_dir: PathBuf,
    },
    /// Check the training status once.
    Status,
    /// Download the trained model checkpoint.
    Download {
        #[clap(long, value_parser, default_value = "./img_model")]
        model_dir: PathBuf,
    },
    /// Delete the train job on the server.
    Delete,
    /// Run inference for one prompt and build a preview.
    Prompt {
        prompt: String,

        #[clap(flatten)]
        options: PromptArgs,
    },
    /// Run inference for every line of a prompt file.
    PromptFile {
        #[clap(value_parser, default_value = "./prompts.txt")]
        path: PathBuf,

        #[clap(flatten)]
        options: PromptArgs,
    },
}

/// Fixed-interval polling with an upper bound on attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts: max_attempts.max(1) }
    }

    pub fn training() -> Self {
        Self::new(Duration::from_secs(TRAIN_POLL_INTERVAL_SECS), TRAIN_POLL_MAX_ATTEMPTS)
    }

    pub fn inference() -> Self {
        Self::new(Duration::from_secs(INFER_POLL_INTERVAL_SECS), INFER_POLL_MAX_ATTEMPTS)
    }
}

pub fn create_spinner(label: &str) -> Result<ProgressBar, io::Error> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
    );
    pb.set_message(label.to_string());
    pb.enable_steady_tick(Duration::from_millis(200));
    Ok(pb)
}

/// Calls `check` until it yields `Some`, sleeping `policy.interval` between
/// attempts. Errors from `check` abort the loop; running out of attempts is a
/// `ClientError::Timeout`.
pub async fn poll_until<F, Fut, T>(label: &str, policy: PollPolicy, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let spinner = create_spinner(label).context("Failed to create spinner")?;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = check()
            .await
            .with_context(|| format!("{}: poll attempt {} failed", label, attempt));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                spinner.abandon_with_message(format!("{}: failed", label));
                return Err(e);
            }
        };

        if let Some(value) = outcome {
            spinner.finish_with_message(format!("{}: done", label));
            info!("{} finished after {:.1} minutes", label, start.elapsed().as_secs_f64() / 60.0);
            return Ok(value);
        }

        if attempt >= policy.max_attempts {
            spinner.abandon_with_message(format!("{}: gave up", label));
            return Err(ClientError::Timeout {
                label: label.to_string(),
                attempts: attempt,
                elapsed: start.elapsed(),
            }
            .into());
        }

        spinner.set_message(format!("{} (attempt {}/{})", label, attempt, policy.max_attempts));
        info!("{} still running, elapsed {:.1} minutes", label, start.elapsed().as_secs_f64() / 60.0);
        sleep(policy.interval).await;
    }
}

/// First non-blank key among the flag/`MERU_API_KEY` value and the legacy variable.
pub fn resolve_api_key(flag: Option<String>, legacy: Option<String>) -> Option<String> {
    flag.into_iter()
        .chain(legacy)
        .find(|key| !key.trim().is_empty())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    create_dir_all(path).with_context(|| format!("Failed to create directory: {:?}", path))
}

pub fn timestamp_prefix() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

//! Configuration management for the mining engine
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with validation and defaults.

use crate::job::{Extranonce2Source, JobPolicy, MAX_EXTRANONCE2_SIZE};
use crate::worker::RunnerSettings;
use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Console log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Complete configuration for the miner
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "sha256d-miner",
    version = env!("CARGO_PKG_VERSION"),
    about = "SHA-256d block header search engine",
    long_about = "Searches Bitcoin block headers with a software engine and a register-driven hash accelerator, fed by a stream of upstream job events"
)]
pub struct Config {
    /// Print program info and exit
    #[arg(long)]
    #[serde(skip)]
    pub info: bool,

    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Newline-delimited JSON job events; stdin when omitted
    #[arg(short = 'j', long, value_name = "FILE", env = "SHA256D_MINER_JOBS_FILE")]
    #[serde(default)]
    pub jobs_file: Option<PathBuf>,

    /// Mine a synthetic job instead of reading job events
    #[arg(long)]
    #[serde(default)]
    pub benchmark: bool,

    /// How long the benchmark runs
    #[arg(long, default_value = "10s")]
    #[serde(default = "default_benchmark_duration")]
    pub benchmark_duration: String,

    /// Log level
    #[arg(short = 'l', long, default_value = "info", env = "SHA256D_MINER_LOG_LEVEL")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Console log format
    #[arg(long, default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write JSON logs to this file (rotated daily)
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Disable the software engine (nonce half A)
    #[arg(long)]
    #[serde(default)]
    pub disable_software: bool,

    /// Disable the accelerator engine (nonce half B)
    #[arg(long)]
    #[serde(default)]
    pub disable_accelerator: bool,

    /// Add up to 255 seconds to each job's timestamp
    #[arg(long)]
    #[serde(default)]
    pub randomize_timestamp: bool,

    /// Start each engine at a random nonce within its half
    #[arg(long)]
    #[serde(default)]
    pub randomize_start_nonce: bool,

    /// Use this extranonce2 value for every job instead of a random one
    #[arg(long, value_name = "VALUE")]
    #[serde(default)]
    pub fixed_extranonce2: Option<u64>,

    /// Pool difficulty used until the upstream sets one
    #[arg(short = 'd', long, default_value = "1.0")]
    #[serde(default = "default_pool_difficulty")]
    pub pool_difficulty: f64,

    /// Default extranonce1 for benchmark and replay sessions
    #[arg(long, default_value = "00000000")]
    #[serde(default = "default_extranonce1")]
    pub extranonce1: String,

    /// Default extranonce2 width in bytes
    #[arg(long, default_value = "4")]
    #[serde(default = "default_extranonce2_size")]
    pub extranonce2_size: usize,

    /// Engine poll interval while mining is disabled
    #[arg(long, default_value = "20ms")]
    #[serde(default = "default_idle_poll")]
    pub idle_poll: String,

    /// Nonces between yield points
    #[arg(long, default_value = "256")]
    #[serde(default = "default_yield_interval")]
    pub yield_interval: u32,

    /// Interval between statistics log lines
    #[arg(long, default_value = "30s")]
    #[serde(default = "default_stats_interval")]
    pub stats_interval: String,
}

impl Config {
    /// Parse the command line, merge the config file if given, and validate
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config.
    ///
    /// Optional values and switches left unset on the command line are taken
    /// from the file; valued arguments keep their command line value.
    pub fn merge_with_file(mut self, file: Self) -> Self {
        if self.jobs_file.is_none() {
            self.jobs_file = file.jobs_file;
        }
        if self.log_file.is_none() {
            self.log_file = file.log_file;
        }
        if self.fixed_extranonce2.is_none() {
            self.fixed_extranonce2 = file.fixed_extranonce2;
        }
        self.benchmark |= file.benchmark;
        self.disable_software |= file.disable_software;
        self.disable_accelerator |= file.disable_accelerator;
        self.randomize_timestamp |= file.randomize_timestamp;
        self.randomize_start_nonce |= file.randomize_start_nonce;

        let defaults = Self::defaults();
        if self.log_level == defaults.log_level {
            self.log_level = file.log_level;
        }
        if self.log_format == defaults.log_format {
            self.log_format = file.log_format;
        }
        if self.pool_difficulty == defaults.pool_difficulty {
            self.pool_difficulty = file.pool_difficulty;
        }
        if self.extranonce1 == defaults.extranonce1 {
            self.extranonce1 = file.extranonce1;
        }
        if self.extranonce2_size == defaults.extranonce2_size {
            self.extranonce2_size = file.extranonce2_size;
        }
        if self.idle_poll == defaults.idle_poll {
            self.idle_poll = file.idle_poll;
        }
        if self.yield_interval == defaults.yield_interval {
            self.yield_interval = file.yield_interval;
        }
        if self.stats_interval == defaults.stats_interval {
            self.stats_interval = file.stats_interval;
        }
        if self.benchmark_duration == defaults.benchmark_duration {
            self.benchmark_duration = file.benchmark_duration;
        }
        self
    }

    /// Configuration with every default applied
    pub fn defaults() -> Self {
        Self {
            info: false,
            print_config: false,
            config_file: None,
            jobs_file: None,
            benchmark: false,
            benchmark_duration: default_benchmark_duration(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_file: None,
            disable_software: false,
            disable_accelerator: false,
            randomize_timestamp: false,
            randomize_start_nonce: false,
            fixed_extranonce2: None,
            pool_difficulty: default_pool_difficulty(),
            extranonce1: default_extranonce1(),
            extranonce2_size: default_extranonce2_size(),
            idle_poll: default_idle_poll(),
            yield_interval: default_yield_interval(),
            stats_interval: default_stats_interval(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.disable_software && self.disable_accelerator {
            return Err(Error::config("At least one engine must be enabled"));
        }

        if !self.pool_difficulty.is_finite() || self.pool_difficulty <= 0.0 {
            return Err(Error::config("Pool difficulty must be a positive number"));
        }

        if self.extranonce2_size == 0 || self.extranonce2_size > MAX_EXTRANONCE2_SIZE {
            return Err(Error::config(format!(
                "Extranonce2 size must be between 1 and {}",
                MAX_EXTRANONCE2_SIZE
            )));
        }

        if self.yield_interval == 0 {
            return Err(Error::config("Yield interval must be greater than 0"));
        }

        if self.idle_poll_duration()?.is_zero() {
            return Err(Error::config("Idle poll interval must be greater than 0"));
        }
        if self.stats_interval_duration()?.is_zero() {
            return Err(Error::config("Stats interval must be greater than 0"));
        }
        self.benchmark_duration()?;

        crate::utils::validate_hex_string(&self.extranonce1, None)
            .map_err(|e| Error::config(format!("Invalid extranonce1: {}", e)))?;
        if self.extranonce1.len() % 2 != 0 {
            return Err(Error::config(
                "Extranonce1 must have an even number of hex digits",
            ));
        }

        Ok(())
    }

    /// Job assembly policy implied by this configuration
    pub fn job_policy(&self) -> JobPolicy {
        JobPolicy {
            randomize_timestamp: self.randomize_timestamp,
            randomize_start_nonce: self.randomize_start_nonce,
            extranonce2: match self.fixed_extranonce2 {
                Some(value) => Extranonce2Source::Fixed(value),
                None => Extranonce2Source::Random,
            },
        }
    }

    /// Engine loop tuning
    pub fn runner_settings(&self) -> Result<RunnerSettings> {
        Ok(RunnerSettings {
            yield_interval: self.yield_interval,
            idle_poll: self.idle_poll_duration()?,
        })
    }

    /// Get idle poll duration
    pub fn idle_poll_duration(&self) -> Result<Duration> {
        parse_duration("idle poll", &self.idle_poll)
    }

    /// Get stats interval duration
    pub fn stats_interval_duration(&self) -> Result<Duration> {
        parse_duration("stats interval", &self.stats_interval)
    }

    /// Get benchmark duration
    pub fn benchmark_duration(&self) -> Result<Duration> {
        parse_duration("benchmark duration", &self.benchmark_duration)
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", name, value, e)))
}

// Default value functions for serde
fn default_benchmark_duration() -> String { "10s".to_string() }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }
fn default_pool_difficulty() -> f64 { 1.0 }
fn default_extranonce1() -> String { "00000000".to_string() }
fn default_extranonce2_size() -> usize { 4 }
fn default_idle_poll() -> String { "20ms".to_string() }
fn default_yield_interval() -> u32 { 256 }
fn default_stats_interval() -> String { "30s".to_string() }

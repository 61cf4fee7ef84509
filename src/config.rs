//! Server configuration
//!
//! Loaded from a TOML file, falling back to the embedded
//! `files/intake.toml`, then adjusted from environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::core::models::ProjectId;

const DEFAULT_CONFIG: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/intake.toml"));

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    /// A client silent for this long is disconnected
    pub idle_timeout_secs: u64,
    /// Upper bound for one EOT terminated control frame
    pub max_frame_bytes: usize,
    /// Upper bound for one file payload
    pub max_payload_bytes: u64,
    pub allow_registration: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            ports: vec![8010],
            idle_timeout_secs: 300,
            max_frame_bytes: 1024 * 1024,
            max_payload_bytes: 64 * 1024 * 1024,
            allow_registration: false,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on simultaneously processed files
    pub workers: usize,
    pub queue_capacity: usize,
    pub tool_timeout_secs: u64,
    /// Extra attempts for invocations that failed on resource exhaustion
    pub start_retries: u32,
    pub memory_limit_mb: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 100,
            queue_capacity: 1024,
            tool_timeout_secs: 300,
            start_retries: 3,
            memory_limit_mb: None,
        }
    }
}

impl PipelineConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub file_name: String,
    pub flush_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            file_name: "active_submissions.json".into(),
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Lint,
    Test,
}

/// How a finished invocation is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessRule {
    /// Only a zero exit status counts
    #[default]
    ExitZero,
    /// Any exit status counts as long as the process ran to completion
    Completed,
}

#[derive(Debug, Deserialize)]
struct RawTool {
    name: String,
    stage: Stage,
    command: String,
    #[serde(default)]
    success: SuccessRule,
    timeout_secs: Option<u64>,
}

/// An external tool run against each source file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawTool")]
pub struct ToolConfig {
    pub name: String,
    pub stage: Stage,
    /// Command template, see [`crate::pipeline::target::Target::render`]
    pub command: Vec<String>,
    pub success: SuccessRule,
    pub timeout: Option<Duration>,
}

impl TryFrom<RawTool> for ToolConfig {
    type Error = String;

    fn try_from(raw: RawTool) -> Result<Self, Self::Error> {
        let command = into_command(&raw.command);
        if command.is_empty() {
            return Err(format!("tool {} has an empty command", raw.name));
        }
        Ok(Self {
            name: raw.name,
            stage: raw.stage,
            command,
            success: raw.success,
            timeout: raw.timeout_secs.map(Duration::from_secs),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    /// Source file extension without the dot
    pub extension: String,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

impl LanguageConfig {
    /// Tools in execution order: compile, then lint, then test
    pub fn ordered_tools(&self) -> Vec<&ToolConfig> {
        let mut tools: Vec<&ToolConfig> = self.tools.iter().collect();
        tools.sort_by_key(|t| t.stage);
        tools
    }
}

/// Project created at startup when no project of that name exists
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSeed {
    pub name: String,
    pub lang: String,
    pub id: Option<ProjectId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for staging, unpacked tests and the monitor file
    pub base_dir: PathBuf,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
    pub monitor: MonitorConfig,
    pub languages: HashMap<String, LanguageConfig>,
    pub projects: Vec<ProjectSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("intake-data"),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            pipeline: PipelineConfig::default(),
            monitor: MonitorConfig::default(),
            languages: HashMap::new(),
            projects: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the embedded defaults when `None`
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Self::parse(DEFAULT_CONFIG).context("Invalid embedded config")?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `INTAKE_*` / `REDIS_URL` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(dir) = lookup("INTAKE_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(backend) = lookup("INTAKE_STORE") {
            self.store.backend = match backend.to_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis,
                other => anyhow::bail!("Invalid INTAKE_STORE: {}", other),
            };
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(workers) = lookup("INTAKE_WORKERS") {
            self.pipeline.workers = workers
                .parse()
                .with_context(|| format!("Invalid INTAKE_WORKERS: {}", workers))?;
        }
        if let Some(secs) = lookup("INTAKE_TOOL_TIMEOUT_SECS") {
            self.pipeline.tool_timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid INTAKE_TOOL_TIMEOUT_SECS: {}", secs))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.ports.is_empty() {
            anyhow::bail!("At least one listening port is required");
        }
        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            anyhow::bail!("pipeline.queue_capacity must be at least 1");
        }
        for (name, lang) in &self.languages {
            let compilers = lang.tools.iter().filter(|t| t.stage == Stage::Compile).count();
            if compilers > 1 {
                anyhow::bail!("Language {} declares {} compile tools", name, compilers);
            }
        }
        for seed in &self.projects {
            if !self.languages.contains_key(&seed.lang) {
                anyhow::bail!("Project {} uses unknown language {}", seed.name, seed.lang);
            }
        }
        Ok(())
    }

    pub fn language(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.get(name)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join("staging")
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.base_dir.join("tests")
    }

    pub fn monitor_path(&self) -> PathBuf {
        self.base_dir.join(&self.monitor.file_name)
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

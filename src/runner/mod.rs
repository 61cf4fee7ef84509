//! Runner module - external process execution
//!
//! A runner executes one command, captures stdout and stderr separately,
//! enforces a timeout and classifies what went wrong. It does NOT decide
//! whether a tool invocation counts as a success: a linter that exits
//! non-zero while reporting warnings is judged by the pipeline, not here.

pub mod process;

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::models::{ToolError, ToolErrorKind};

/// Command specification for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// First element is the program, the rest are arguments
    pub fn from_vec(cmd: &[String]) -> Option<Self> {
        let (program, args) = cmd.split_first()?;
        Some(Self::new(program.clone()).with_args(args.iter().cloned()))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Limits for a single invocation
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Address space limit for the child, unlimited when `None`
    pub memory_mb: Option<u64>,
}

impl RunLimits {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            memory_mb: None,
        }
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Why an invocation failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    #[error("could not start {program}: {message}")]
    Start { program: String, message: String },
    #[error("{program} did not finish within {limit_ms} ms")]
    Timeout { program: String, limit_ms: u64 },
    #[error("{program} {message}")]
    End {
        program: String,
        message: String,
        exit_code: Option<i32>,
    },
    #[error("{program} ran out of memory: {message}")]
    OutOfMemory { program: String, message: String },
    #[error("{program} ran out of file descriptors: {message}")]
    BadDescriptor { program: String, message: String },
}

impl ProcessError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ProcessError::Start { .. } => ToolErrorKind::Start,
            ProcessError::Timeout { .. } => ToolErrorKind::Timeout,
            ProcessError::End { .. } => ToolErrorKind::End,
            ProcessError::OutOfMemory { .. } => ToolErrorKind::OutOfMemory,
            ProcessError::BadDescriptor { .. } => ToolErrorKind::BadDescriptor,
        }
    }

    /// Resource exhaustion may clear up on its own, everything else won't
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessError::OutOfMemory { .. } | ProcessError::BadDescriptor { .. }
        )
    }

    pub fn to_tool_error(&self) -> ToolError {
        ToolError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Outcome of running a program
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed by a signal or never ran
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub error: Option<ProcessError>,
}

impl RunOutcome {
    pub fn failed(error: ProcessError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The process ran to completion on its own, whatever its exit status
    pub fn completed(&self) -> bool {
        matches!(
            self.error,
            None | Some(ProcessError::End {
                exit_code: Some(_),
                ..
            })
        )
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command with the given limits and optional stdin
    async fn run(&self, cmd: &CommandSpec, limits: &RunLimits, stdin: Option<&[u8]>) -> RunOutcome;
}

pub use process::ProcessRunner;

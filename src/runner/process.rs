//! Direct child process execution
//!
//! Every child is made the leader of its own process group so that a
//! timeout can take down anything it forked as well.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{CommandSpec, ProcessError, RunLimits, RunOutcome, Runner};

#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn build(cmd: &CommandSpec, limits: &RunLimits, with_stdin: bool) -> Command {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if with_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let memory_bytes = limits
            .memory_mb
            .map(|mb| mb.saturating_mul(1024 * 1024) as nix::libc::rlim_t);
        // SAFETY: only async-signal-safe syscalls run between fork and exec
        unsafe {
            command.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)?;
                if let Some(bytes) = memory_bytes {
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        bytes,
                        bytes,
                    )
                    .map_err(io::Error::from)?;
                }
                Ok(())
            });
        }
        command
    }

    async fn kill_group(child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
            }
        }
        // Reap the leader so it does not linger as a zombie
        if let Err(e) = child.kill().await {
            debug!("Child already reaped: {}", e);
        }
    }
}

/// Map an OS error to the failure class callers care about
fn classify_os_error(program: &str, err: &io::Error, started: bool) -> ProcessError {
    let program = program.to_string();
    let message = err.to_string();
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOMEM) | Some(Errno::EAGAIN) => ProcessError::OutOfMemory { program, message },
        Some(Errno::EBADF) | Some(Errno::EMFILE) | Some(Errno::ENFILE) => {
            ProcessError::BadDescriptor { program, message }
        }
        _ if started => ProcessError::End {
            program,
            message,
            exit_code: None,
        },
        _ => ProcessError::Start { program, message },
    }
}

fn classify_status(program: &str, status: ExitStatus) -> Option<ProcessError> {
    match (status.code(), status.signal()) {
        (Some(0), _) => None,
        (Some(code), _) => Some(ProcessError::End {
            program: program.to_string(),
            message: format!("exited with status {}", code),
            exit_code: Some(code),
        }),
        (None, Some(signal)) => Some(ProcessError::End {
            program: program.to_string(),
            message: format!("killed by signal {}", signal),
            exit_code: None,
        }),
        (None, None) => Some(ProcessError::End {
            program: program.to_string(),
            message: "terminated abnormally".to_string(),
            exit_code: None,
        }),
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, cmd: &CommandSpec, limits: &RunLimits, stdin: Option<&[u8]>) -> RunOutcome {
        debug!("Running {} (timeout {:?})", cmd, limits.timeout);
        let started = Instant::now();

        let mut child = match Self::build(cmd, limits, stdin.is_some()).spawn() {
            Ok(child) => child,
            Err(e) => return RunOutcome::failed(classify_os_error(&cmd.program, &e, false)),
        };
        let pid = child.id();

        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(tokio::spawn(async move {
                    // A child that exits without reading its input closes the pipe early
                    let _ = pipe.write_all(&data).await;
                }))
            }
            _ => None,
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let waited = {
            let read_out = async {
                if let Some(pipe) = stdout_pipe.as_mut() {
                    pipe.read_to_end(&mut stdout).await?;
                }
                Ok::<_, io::Error>(())
            };
            let read_err = async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    pipe.read_to_end(&mut stderr).await?;
                }
                Ok::<_, io::Error>(())
            };
            let collect = async {
                let ((), (), status) = tokio::try_join!(read_out, read_err, child.wait())?;
                Ok::<_, io::Error>(status)
            };
            tokio::time::timeout(limits.timeout, collect).await
        };

        let error = match waited {
            Ok(Ok(status)) => classify_status(&cmd.program, status),
            Ok(Err(e)) => {
                Self::kill_group(&mut child, pid).await;
                Some(classify_os_error(&cmd.program, &e, true))
            }
            Err(_) => {
                warn!("{} timed out after {:?}, killing process group", cmd, limits.timeout);
                Self::kill_group(&mut child, pid).await;
                Some(ProcessError::Timeout {
                    program: cmd.program.clone(),
                    limit_ms: limits.timeout.as_millis() as u64,
                })
            }
        };

        if let Some(writer) = writer {
            writer.abort();
        }

        let exit_code = match &error {
            None => Some(0),
            Some(ProcessError::End { exit_code, .. }) => *exit_code,
            Some(_) => None,
        };

        RunOutcome {
            stdout,
            stderr,
            exit_code,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }
}

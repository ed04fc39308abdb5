use crate::distro::{Distribution, detect_distribution};
use crate::planner::HostCommand;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrivilegeHelper {
    Doas,
    Sudo,
    Su,
}

impl PrivilegeHelper {
    const PROBE_ORDER: [PrivilegeHelper; 3] = [Self::Doas, Self::Sudo, Self::Su];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Doas => "doas",
            Self::Sudo => "sudo",
            Self::Su => "su",
        }
    }

    /// First helper found on `PATH`, or `None` when the process is already
    /// root or no helper is installed.
    pub fn probe() -> Option<Self> {
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            return None;
        }
        Self::PROBE_ORDER
            .into_iter()
            .find(|helper| which::which(helper.as_str()).is_ok())
    }
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub exit: Option<i32>,
    pub output: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("program {0} is not an allowed host command")]
    NotAllowed(String),
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("command `{command}` failed (exit {}): {output}", exit_label(.exit))]
    CommandFailed {
        command: String,
        exit: Option<i32>,
        output: String,
    },
    #[error("command `{command}` timed out after {after_secs}s")]
    Timeout { command: String, after_secs: u64 },
    #[error("command `{command}` cancelled by shutdown")]
    Cancelled { command: String },
}

impl ExecError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAllowed(_) => "not_allowed",
            Self::Spawn { .. } => "spawn_failed",
            Self::CommandFailed { .. } => "command_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

// Output still buffered after the leader exits is collected for this long.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

fn exit_label(exit: &Option<i32>) -> String {
    exit.map_or_else(|| "signal".into(), |code| code.to_string())
}

/// Capability seam between the worker pool and the host.
#[async_trait]
pub trait SystemExecutor: Send + Sync {
    fn distribution(&self) -> Distribution;

    async fn run_privileged(
        &self,
        command: &HostCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError>;
}

pub struct LocalExecutor {
    helper: Option<PrivilegeHelper>,
    root: PathBuf,
    distro: OnceLock<Distribution>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        let helper = PrivilegeHelper::probe();
        match helper {
            Some(helper) => info!(helper = helper.as_str(), "privilege helper selected"),
            None => info!("no privilege helper; commands run directly"),
        }
        Self::with_helper(helper)
    }

    pub fn with_helper(helper: Option<PrivilegeHelper>) -> Self {
        Self {
            helper,
            root: PathBuf::from("/"),
            distro: OnceLock::new(),
        }
    }
}

#[async_trait]
impl SystemExecutor for LocalExecutor {
    fn distribution(&self) -> Distribution {
        *self.distro.get_or_init(|| {
            let distro = detect_distribution(&self.root);
            info!(distro = distro.as_str(), "host distribution detected");
            distro
        })
    }

    async fn run_privileged(
        &self,
        command: &HostCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        if !command.is_allowed() {
            return Err(ExecError::NotAllowed(command.program.to_string()));
        }

        let argv = build_argv(self.helper, command);
        let label = command.to_string();
        debug!(command = %label, argv = ?argv, "running host command");

        let result = run_argv(&argv, &label, command.timeout, cancel).await?;
        if exit_is_success(command, result.exit) {
            Ok(result)
        } else {
            Err(ExecError::CommandFailed {
                command: label,
                exit: result.exit,
                output: result.output,
            })
        }
    }
}

pub fn build_argv(helper: Option<PrivilegeHelper>, command: &HostCommand) -> Vec<String> {
    let mut plain = Vec::with_capacity(command.args.len() + 1);
    plain.push(command.program.to_string());
    plain.extend(command.args.iter().map(|arg| arg.to_string()));

    match helper {
        None => plain,
        Some(PrivilegeHelper::Su) => {
            let quoted: Vec<String> = plain.iter().map(|token| shell_quote(token)).collect();
            vec!["su".to_string(), "-c".to_string(), quoted.join(" ")]
        }
        Some(helper @ (PrivilegeHelper::Doas | PrivilegeHelper::Sudo)) => {
            let mut argv = Vec::with_capacity(plain.len() + 2);
            argv.push(helper.as_str().to_string());
            // Never block on a password prompt without a terminal.
            argv.push("-n".to_string());
            argv.extend(plain);
            argv
        }
    }
}

fn shell_quote(token: &str) -> String {
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// `yum check-update` / `dnf check-update` exit 100 when updates exist.
fn exit_is_success(command: &HostCommand, exit: Option<i32>) -> bool {
    match exit {
        Some(0) => true,
        Some(100) => {
            matches!(command.program, "yum" | "dnf")
                && command.args.first() == Some(&"check-update")
        }
        _ => false,
    }
}

async fn run_argv(
    argv: &[String],
    label: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ExecError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecError::Spawn {
            command: label.to_string(),
            reason: "empty argv".to_string(),
        });
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
        command: label.to_string(),
        reason: e.to_string(),
    })?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let status = {
        let capture = async {
            tokio::join!(
                drain_pipe(stdout, &mut stdout_buf),
                drain_pipe(stderr, &mut stderr_buf)
            );
        };
        tokio::pin!(capture);
        let mut captured = false;

        let waited = tokio::select! {
            waited = tokio::time::timeout(timeout, async {
                loop {
                    tokio::select! {
                        status = child.wait() => break status,
                        _ = &mut capture, if !captured => captured = true,
                    }
                }
            }) => waited,
            _ = cancel.cancelled() => {
                warn!(command = %label, "host command cancelled");
                terminate_group(pid);
                return Err(ExecError::Cancelled {
                    command: label.to_string(),
                });
            }
        };

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(ExecError::Spawn {
                    command: label.to_string(),
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %label, timeout_secs = timeout.as_secs(), "host command timed out");
                terminate_group(pid);
                return Err(ExecError::Timeout {
                    command: label.to_string(),
                    after_secs: timeout.as_secs(),
                });
            }
        };

        // A descendant left running in the background may keep the pipes open.
        if !captured && tokio::time::timeout(OUTPUT_GRACE, &mut capture).await.is_err() {
            debug!(command = %label, "output pipes still open after exit; keeping partial output");
        }
        status
    };

    let mut combined = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    Ok(CommandOutput {
        exit: status.code(),
        output: combined.trim().to_string(),
    })
}

async fn drain_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    if let Err(err) = pipe.read_to_end(buf).await {
        debug!(err = %err, "reading command output failed");
    }
}

// Signals the whole group so package managers spawned under a helper are not
// left running; the leader is also SIGKILLed by kill_on_drop.
fn terminate_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid targets the process group created
    // by process_group(0); it has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, err = %err, "process group signal failed");
        }
    }
}

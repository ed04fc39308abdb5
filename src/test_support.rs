use crate::distro::Distribution;
use crate::jobs::{Job, JobRegistry, JobState};
use crate::planner::HostCommand;
use crate::privileged::{CommandOutput, ExecError, SystemExecutor};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Executor double that records every command instead of running it.
pub struct RecordingExecutor {
    distro: Distribution,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    gate: Option<Semaphore>,
    honours_cancel: bool,
    fail_on: Option<&'static str>,
}

impl RecordingExecutor {
    pub fn new(distro: Distribution) -> Self {
        Self {
            distro,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: None,
            honours_cancel: true,
            fail_on: None,
        }
    }

    /// Every command blocks until [`RecordingExecutor::release`] or cancellation.
    pub fn gated(distro: Distribution) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(distro)
        }
    }

    /// Like [`RecordingExecutor::gated`], but cancellation is ignored.
    pub fn unresponsive(distro: Distribution) -> Self {
        Self {
            honours_cancel: false,
            ..Self::gated(distro)
        }
    }

    /// The command rendering as `command` exits non-zero.
    pub fn failing_on(distro: Distribution, command: &'static str) -> Self {
        Self {
            fail_on: Some(command),
            ..Self::new(distro)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.close();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SystemExecutor for RecordingExecutor {
    fn distribution(&self) -> Distribution {
        self.distro
    }

    async fn run_privileged(
        &self,
        command: &HostCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let rendered = command.to_string();
        self.calls.lock().unwrap().push(rendered.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let outcome = match &self.gate {
            Some(gate) => tokio::select! {
                _ = gate.acquire() => Ok(()),
                _ = cancel.cancelled(), if self.honours_cancel => Err(ExecError::Cancelled {
                    command: rendered.clone(),
                }),
            },
            None => {
                tokio::task::yield_now().await;
                Ok(())
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome?;

        if self.fail_on == Some(rendered.as_str()) {
            return Err(ExecError::CommandFailed {
                command: rendered,
                exit: Some(1),
                output: "simulated failure".to_string(),
            });
        }
        Ok(CommandOutput {
            exit: Some(0),
            output: String::new(),
        })
    }
}

/// Poll until the job satisfies `done`; panics after five seconds.
pub async fn wait_for_state(
    jobs: &JobRegistry,
    id: &str,
    done: impl Fn(JobState) -> bool,
) -> Job {
    for _ in 0..500 {
        if let Some(job) = jobs.get(id) {
            if done(job.state) {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached the expected state: {:?}", jobs.get(id));
}

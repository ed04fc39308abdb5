use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(3_600);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Update,
    Reinit,
    Reboot,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Reinit => "reinit",
            Self::Reboot => "reboot",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn can_advance_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: String,
    pub action: Action,
    pub state: JobState,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} cannot move from {from} to {to}")]
    Illegal {
        id: String,
        from: &'static str,
        to: &'static str,
    },
}

impl TransitionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "job_not_found",
            Self::Illegal { .. } => "illegal_transition",
        }
    }
}

/// In-memory job table. Every mutation goes through [`JobRegistry::transition`],
/// which only lets a job move forward and accepts a single terminal write.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
    retention: Duration,
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn create(&self, action: Action) -> String {
        self.create_at(action, crate::current_unix_secs())
    }

    fn create_at(&self, action: Action, now: u64) -> String {
        let mut jobs = self.lock_jobs();
        // Ids are never reused while the old record is still held.
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                action,
                state: JobState::Pending,
                created_at: now,
                started_at: None,
                finished_at: None,
                error_message: None,
            },
        );
        debug!(job_id = %id, action = %action, "job created");
        id
    }

    pub fn transition(
        &self,
        id: &str,
        next: JobState,
        error: Option<String>,
    ) -> Result<(), TransitionError> {
        self.transition_at(id, next, error, crate::current_unix_secs())
    }

    fn transition_at(
        &self,
        id: &str,
        next: JobState,
        error: Option<String>,
        now: u64,
    ) -> Result<(), TransitionError> {
        let mut jobs = self.lock_jobs();
        let Some(job) = jobs.get_mut(id) else {
            warn!(job_id = %id, to = next.as_str(), "transition for unknown job");
            return Err(TransitionError::NotFound(id.to_string()));
        };

        if !job.state.can_advance_to(next) {
            warn!(
                job_id = %id,
                from = job.state.as_str(),
                to = next.as_str(),
                "illegal job transition rejected"
            );
            return Err(TransitionError::Illegal {
                id: id.to_string(),
                from: job.state.as_str(),
                to: next.as_str(),
            });
        }

        job.state = next;
        match next {
            JobState::Running => job.started_at = Some(now),
            JobState::Succeeded | JobState::Failed => {
                job.finished_at = Some(now);
                job.error_message = error;
            }
            JobState::Pending => {}
        }
        debug!(job_id = %id, state = next.as_str(), "job transitioned");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock_jobs().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    /// Drop terminal jobs that finished at least `retention` ago.
    pub fn sweep(&self, now: u64) -> usize {
        let retention = self.retention.as_secs();
        let mut jobs = self.lock_jobs();
        let before = jobs.len();
        jobs.retain(|_, job| match (job.state.is_terminal(), job.finished_at) {
            (true, Some(finished)) => now.saturating_sub(finished) < retention,
            _ => true,
        });
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(DEFAULT_JOB_RETENTION)
    }

    #[test]
    fn create_inserts_pending_job_with_unique_id() {
        let registry = registry();
        let first = registry.create(Action::Update);
        let second = registry.create(Action::Update);

        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);
        let job = registry.get(&first).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.action, Action::Update);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn forward_transitions_record_timestamps() {
        let registry = registry();
        let id = registry.create_at(Action::Reinit, 100);

        registry
            .transition_at(&id, JobState::Running, None, 110)
            .unwrap();
        registry
            .transition_at(&id, JobState::Succeeded, None, 125)
            .unwrap();

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.created_at, 100);
        assert_eq!(job.started_at, Some(110));
        assert_eq!(job.finished_at, Some(125));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn pending_job_may_fail_without_running() {
        let registry = registry();
        let id = registry.create(Action::Update);
        registry
            .transition(&id, JobState::Failed, Some("queue_full".into()))
            .unwrap();

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("queue_full"));
        assert!(job.started_at.is_none());
    }

    #[test]
    fn terminal_states_are_immutable() {
        let registry = registry();
        let id = registry.create(Action::Reboot);
        registry.transition(&id, JobState::Running, None).unwrap();
        registry
            .transition(&id, JobState::Failed, Some("boom".into()))
            .unwrap();

        for next in [
            JobState::Pending,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            let err = registry.transition(&id, next, None).unwrap_err();
            assert_eq!(err.kind(), "illegal_transition");
        }
        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn backwards_and_skipping_transitions_are_rejected() {
        let registry = registry();
        let id = registry.create(Action::Update);
        assert!(registry.transition(&id, JobState::Succeeded, None).is_err());
        assert!(registry.transition(&id, JobState::Pending, None).is_err());

        registry.transition(&id, JobState::Running, None).unwrap();
        assert!(registry.transition(&id, JobState::Running, None).is_err());
        assert!(registry.transition(&id, JobState::Pending, None).is_err());
    }

    #[test]
    fn unknown_job_transition_reports_not_found() {
        let registry = registry();
        let err = registry
            .transition("missing", JobState::Running, None)
            .unwrap_err();
        assert_eq!(err, TransitionError::NotFound("missing".into()));
        assert_eq!(err.kind(), "job_not_found");
    }

    #[test]
    fn sweep_removes_only_expired_terminal_jobs() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let done_old = registry.create_at(Action::Update, 0);
        registry
            .transition_at(&done_old, JobState::Failed, Some("x".into()), 10)
            .unwrap();
        let done_recent = registry.create_at(Action::Update, 0);
        registry
            .transition_at(&done_recent, JobState::Running, None, 5)
            .unwrap();
        registry
            .transition_at(&done_recent, JobState::Succeeded, None, 50)
            .unwrap();
        let running = registry.create_at(Action::Update, 0);
        registry
            .transition_at(&running, JobState::Running, None, 1)
            .unwrap();
        let pending = registry.create_at(Action::Update, 0);

        let removed = registry.sweep(70);

        assert_eq!(removed, 1);
        assert!(registry.get(&done_old).is_none());
        assert!(registry.get(&done_recent).is_some());
        assert!(registry.get(&running).is_some());
        assert!(registry.get(&pending).is_some());

        assert_eq!(registry.sweep(110), 1);
        assert!(registry.get(&done_recent).is_none());
    }

    #[test]
    fn job_serializes_with_wire_field_names() {
        let registry = registry();
        let id = registry.create_at(Action::Update, 42);
        let value = serde_json::to_value(registry.get(&id).unwrap()).unwrap();

        assert_eq!(value["id"], serde_json::Value::from(id));
        assert_eq!(value["action"], "update");
        assert_eq!(value["state"], "pending");
        assert_eq!(value["created_at"], 42);
        assert!(value["started_at"].is_null());
        assert!(value["finished_at"].is_null());
        assert!(value["error_message"].is_null());
    }
}

use crate::config::QueueConfig;
use crate::types::{FailureOutcome, QueueStats, Task, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use hierarch_core::{HierarchError, HierarchResult};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Restricts which tasks a claim may pick up.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    task_types: Option<Vec<String>>,
}

impl ClaimFilter {
    /// Accept every task type.
    pub fn any() -> Self {
        Self::default()
    }

    /// Accept only the listed task types.
    pub fn task_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task_types: Some(types.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether `task` passes the type restriction.
    pub fn accepts(&self, task: &Task) -> bool {
        match &self.task_types {
            Some(types) => types.iter().any(|t| *t == task.task_type),
            None => true,
        }
    }
}

/// Result of one timeout sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Assigned or in-progress tasks that ran past their deadline.
    pub timed_out: Vec<(Uuid, FailureOutcome)>,
    /// Pending tasks nobody claimed before their deadline; now cancelled.
    pub expired: Vec<Uuid>,
}

impl SweepReport {
    /// Nothing timed out or expired.
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.expired.is_empty()
    }
}

struct QueueState {
    /// Non-terminal tasks.
    active: HashMap<Uuid, Task>,
    /// Terminal tasks (completed, dead-lettered, cancelled).
    archive: HashMap<Uuid, Task>,
    completed: HashSet<Uuid>,
    next_sequence: u64,
}

impl QueueState {
    fn contains(&self, id: Uuid) -> bool {
        self.active.contains_key(&id) || self.archive.contains_key(&id)
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn archive(&mut self, id: Uuid) {
        if let Some(task) = self.active.remove(&id) {
            if task.status == TaskStatus::Completed {
                self.completed.insert(id);
            }
            self.archive.insert(id, task);
        }
    }

    /// Look up a task that may still change state.
    fn active_mut(&mut self, id: Uuid, to: TaskStatus) -> HierarchResult<&mut Task> {
        if let Some(task) = self.archive.get(&id) {
            return Err(invalid_transition(task, to));
        }
        self.active.get_mut(&id).ok_or(HierarchError::TaskNotFound(id))
    }
}

fn invalid_transition(task: &Task, to: TaskStatus) -> HierarchError {
    HierarchError::InvalidTransition {
        entity: "task",
        id: task.id,
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

fn transition(task: &mut Task, next: TaskStatus) -> HierarchResult<()> {
    if !task.status.can_transition_to(next) {
        return Err(invalid_transition(task, next));
    }
    task.status = next;
    task.version += 1;
    Ok(())
}

/// Priority task queue with dependency gating and an optimistic claim protocol.
///
/// Ordering: higher priority first, then earliest `queued_at`, then insertion
/// sequence. There is no priority aging; lower levels only progress when the
/// levels above them are empty or blocked.
pub struct TaskQueue {
    state: RwLock<QueueState>,
    wakeup: Notify,
    claim_poll: std::time::Duration,
    claim_backoff: std::time::Duration,
}

impl TaskQueue {
    /// Empty queue with default claim polling.
    pub fn new() -> Self {
        Self::with_config(&QueueConfig::default())
    }

    /// Empty queue using the poll and backoff intervals from `config`.
    pub fn with_config(config: &QueueConfig) -> Self {
        Self {
            state: RwLock::new(QueueState {
                active: HashMap::new(),
                archive: HashMap::new(),
                completed: HashSet::new(),
                next_sequence: 0,
            }),
            wakeup: Notify::new(),
            claim_poll: config.claim_poll(),
            claim_backoff: config.claim_backoff(),
        }
    }

    /// Add a task as `pending`.
    ///
    /// Fails with `InvalidDependency` when a dependency is unknown (or the task
    /// itself), `InvalidPriority` outside 1..=10, `AlreadyExists` on a reused ID.
    pub fn submit(&self, mut task: Task) -> HierarchResult<Uuid> {
        if !(1..=10).contains(&task.priority) {
            return Err(HierarchError::InvalidPriority(task.priority));
        }

        let id = task.id;
        {
            let mut state = self.state.write();
            if state.contains(id) {
                return Err(HierarchError::AlreadyExists { entity: "task", id });
            }
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|dep| **dep == id || !state.contains(**dep))
            {
                return Err(HierarchError::InvalidDependency {
                    task: id,
                    dependency: *dep,
                });
            }

            let now = Utc::now();
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.queued_at = now;
            task.sequence = state.next_sequence();
            task.version = 0;
            task.deadline_window_ms = task
                .deadline
                .map(|d| (d - now).num_milliseconds().max(0));

            info!(
                task_id = %id,
                task_type = %task.task_type,
                priority = task.priority,
                dependencies = task.dependencies.len(),
                "Task submitted"
            );
            state.active.insert(id, task);
        }

        self.wakeup.notify_waiters();
        Ok(id)
    }

    /// Claim the best ready task of any type. `Ok(None)` when nothing is ready.
    pub fn claim(&self, agent_id: Uuid) -> HierarchResult<Option<Task>> {
        self.claim_matching(agent_id, &ClaimFilter::any())
    }

    /// Claim the best ready task accepted by `filter`.
    ///
    /// The candidate is chosen under a read lock and committed under the write
    /// lock only if its version is unchanged; a lost race is `ClaimConflict`.
    pub fn claim_matching(
        &self,
        agent_id: Uuid,
        filter: &ClaimFilter,
    ) -> HierarchResult<Option<Task>> {
        let now = Utc::now();
        let candidate = {
            let state = self.state.read();
            state
                .active
                .values()
                .filter(|t| filter.accepts(t) && t.is_ready(&state.completed, now))
                .max_by_key(|t| (t.priority, Reverse(t.queued_at), Reverse(t.sequence)))
                .map(|t| (t.id, t.version))
        };

        match candidate {
            Some((id, version)) => self.commit_claim(id, agent_id, Some(version), now).map(Some),
            None => Ok(None),
        }
    }

    /// Claim one specific task. Exactly one of several concurrent callers wins;
    /// the others receive `ClaimConflict`.
    pub fn try_claim(&self, task_id: Uuid, agent_id: Uuid) -> HierarchResult<Task> {
        self.commit_claim(task_id, agent_id, None, Utc::now())
    }

    fn commit_claim(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        expected_version: Option<u64>,
        now: DateTime<Utc>,
    ) -> HierarchResult<Task> {
        let mut state = self.state.write();
        let task = Self::reservable(&mut state, task_id, expected_version, now)?;
        transition(task, TaskStatus::Assigned)?;
        task.assigned_agent = Some(agent_id);
        transition(task, TaskStatus::InProgress)?;

        debug!(task_id = %task_id, agent_id = %agent_id, priority = task.priority, "Task claimed");
        Ok(task.clone())
    }

    /// Checks shared by every `pending -> assigned` path.
    fn reservable(
        state: &mut QueueState,
        task_id: Uuid,
        expected_version: Option<u64>,
        now: DateTime<Utc>,
    ) -> HierarchResult<&mut Task> {
        let QueueState {
            active,
            archive,
            completed,
            ..
        } = state;

        if archive.contains_key(&task_id) {
            return Err(HierarchError::ClaimConflict(task_id));
        }
        let task = active
            .get_mut(&task_id)
            .ok_or(HierarchError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Pending || expected_version.is_some_and(|v| v != task.version)
        {
            return Err(HierarchError::ClaimConflict(task_id));
        }
        if !task.is_ready(completed, now) {
            let reason = if task.is_expired(now) {
                "deadline elapsed"
            } else {
                "dependencies incomplete"
            };
            return Err(HierarchError::InvalidTransition {
                entity: "task",
                id: task_id,
                from: format!("pending ({reason})"),
                to: TaskStatus::Assigned.to_string(),
            });
        }
        Ok(task)
    }

    /// First half of a two-phase claim: `pending -> assigned`.
    pub fn reserve(&self, task_id: Uuid, agent_id: Uuid) -> HierarchResult<Task> {
        let mut state = self.state.write();
        let task = Self::reservable(&mut state, task_id, None, Utc::now())?;
        transition(task, TaskStatus::Assigned)?;
        task.assigned_agent = Some(agent_id);
        debug!(task_id = %task_id, agent_id = %agent_id, "Task reserved");
        Ok(task.clone())
    }

    /// Second half of a two-phase claim: `assigned -> in_progress`.
    pub fn start(&self, task_id: Uuid, agent_id: Uuid) -> HierarchResult<Task> {
        let mut state = self.state.write();
        let task = state.active_mut(task_id, TaskStatus::InProgress)?;
        if task.status == TaskStatus::Assigned && task.assigned_agent != Some(agent_id) {
            return Err(HierarchError::ClaimConflict(task_id));
        }
        transition(task, TaskStatus::InProgress)?;
        Ok(task.clone())
    }

    /// Wait until a task accepted by `filter` can be claimed, or `timeout` passes.
    ///
    /// This is the only blocking operation of the queue. Lost claim races are
    /// retried after a short backoff; otherwise the caller sleeps until a
    /// submission/requeue/completion wakes it or the poll interval elapses.
    pub async fn claim_wait(
        &self,
        agent_id: Uuid,
        filter: &ClaimFilter,
        timeout: std::time::Duration,
    ) -> HierarchResult<Option<Task>> {
        let give_up = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim_matching(agent_id, filter) {
                Ok(Some(task)) => return Ok(Some(task)),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    let now = tokio::time::Instant::now();
                    if now >= give_up {
                        return Ok(None);
                    }
                    debug!(agent_id = %agent_id, error = %e, "Claim lost, backing off");
                    tokio::time::sleep(self.claim_backoff.min(give_up - now)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let now = tokio::time::Instant::now();
            if now >= give_up {
                return Ok(None);
            }
            let wait = self.claim_poll.min(give_up - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// `in_progress -> completed`, storing the result.
    pub fn complete(&self, task_id: Uuid, result: serde_json::Value) -> HierarchResult<Task> {
        self.complete_attempt(task_id, None, result)
    }

    /// Like [`TaskQueue::complete`], but only for the agent that holds the
    /// current attempt. A result from a previous holder is `ClaimConflict`,
    /// a result for a cancelled task is `Cancelled`.
    pub fn complete_as(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        result: serde_json::Value,
    ) -> HierarchResult<Task> {
        self.complete_attempt(task_id, Some(agent_id), result)
    }

    fn complete_attempt(
        &self,
        task_id: Uuid,
        owner: Option<Uuid>,
        result: serde_json::Value,
    ) -> HierarchResult<Task> {
        let completed = {
            let mut state = self.state.write();
            if let Some(agent_id) = owner {
                Self::ensure_owner(&state, task_id, agent_id)?;
            }
            let task = state.active_mut(task_id, TaskStatus::Completed)?;
            transition(task, TaskStatus::Completed)?;
            task.result = Some(result);
            task.completed_at = Some(Utc::now());
            let completed = task.clone();
            state.archive(task_id);
            completed
        };

        info!(task_id = %task_id, agent_id = ?completed.assigned_agent, "Task completed");
        // Dependents may have become ready.
        self.wakeup.notify_waiters();
        Ok(completed)
    }

    /// Report a failed attempt. Only valid from `in_progress`.
    ///
    /// Requeues while `retry_count < max_retries`, otherwise dead-letters.
    pub fn fail(&self, task_id: Uuid, error: impl Into<String>) -> HierarchResult<FailureOutcome> {
        self.fail_attempt(task_id, None, error.into())
    }

    /// Like [`TaskQueue::fail`], but only for the agent that holds the current attempt.
    pub fn fail_as(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        error: impl Into<String>,
    ) -> HierarchResult<FailureOutcome> {
        self.fail_attempt(task_id, Some(agent_id), error.into())
    }

    fn fail_attempt(
        &self,
        task_id: Uuid,
        owner: Option<Uuid>,
        error: String,
    ) -> HierarchResult<FailureOutcome> {
        let outcome = {
            let mut state = self.state.write();
            if let Some(agent_id) = owner {
                Self::ensure_owner(&state, task_id, agent_id)?;
            }
            let task = state.active_mut(task_id, TaskStatus::Failed)?;
            if task.status != TaskStatus::InProgress {
                return Err(invalid_transition(task, TaskStatus::Failed));
            }
            Self::apply_failure(&mut state, task_id, error, Utc::now())?
        };
        if !outcome.is_dead_lettered() {
            self.wakeup.notify_waiters();
        }
        Ok(outcome)
    }

    /// Give up an `assigned` or `in_progress` attempt whose agent is gone.
    /// Follows the same retry/dead-letter rule as [`TaskQueue::fail`].
    pub fn abandon(&self, task_id: Uuid, reason: impl Into<String>) -> HierarchResult<FailureOutcome> {
        let outcome = {
            let mut state = self.state.write();
            let task = state.active_mut(task_id, TaskStatus::Failed)?;
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                return Err(invalid_transition(task, TaskStatus::Failed));
            }
            Self::apply_failure(&mut state, task_id, reason.into(), Utc::now())?
        };
        if !outcome.is_dead_lettered() {
            self.wakeup.notify_waiters();
        }
        Ok(outcome)
    }

    /// Whether the next failure of this task would dead-letter it.
    pub fn would_dead_letter(&self, task_id: Uuid) -> HierarchResult<bool> {
        let state = self.state.read();
        match state.active.get(&task_id) {
            Some(task) => Ok(!task.has_retries_left()),
            None if state.archive.contains_key(&task_id) => Ok(false),
            None => Err(HierarchError::TaskNotFound(task_id)),
        }
    }

    fn apply_failure(
        state: &mut QueueState,
        task_id: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> HierarchResult<FailureOutcome> {
        let sequence = state.next_sequence();
        let task = state
            .active
            .get_mut(&task_id)
            .ok_or(HierarchError::TaskNotFound(task_id))?;

        if task.has_retries_left() {
            transition(task, TaskStatus::Pending)?;
            task.retry_count += 1;
            task.assigned_agent = None;
            task.queued_at = now;
            task.sequence = sequence;
            if let Some(window) = task.deadline_window_ms {
                task.deadline = Some(now + Duration::milliseconds(window));
            }
            task.error = Some(error);
            info!(
                task_id = %task_id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "Task requeued after failure"
            );
            Ok(FailureOutcome::Requeued {
                retry_count: task.retry_count,
            })
        } else {
            transition(task, TaskStatus::Failed)?;
            task.completed_at = Some(now);
            warn!(
                task_id = %task_id,
                retry_count = task.retry_count,
                error = %error,
                "Task dead-lettered"
            );
            task.error = Some(error);
            let retry_count = task.retry_count;
            state.archive(task_id);
            Ok(FailureOutcome::DeadLettered { retry_count })
        }
    }

    /// Fail every assigned/in-progress task past its deadline with a timeout,
    /// and cancel pending tasks nobody claimed before their deadline.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        {
            let mut state = self.state.write();
            let expired: Vec<(Uuid, TaskStatus)> = state
                .active
                .values()
                .filter(|t| t.is_expired(now))
                .map(|t| (t.id, t.status))
                .collect();

            for (id, status) in expired {
                if status == TaskStatus::Pending {
                    let reason = "deadline elapsed before any agent claimed the task";
                    if Self::cancel_locked(&mut state, id, Some(reason.to_string())).is_ok() {
                        warn!(task_id = %id, "Pending task expired");
                        report.expired.push(id);
                    }
                    continue;
                }
                let error = HierarchError::Timeout(id).to_string();
                match Self::apply_failure(&mut state, id, error, now) {
                    Ok(outcome) => report.timed_out.push((id, outcome)),
                    Err(e) => warn!(task_id = %id, error = %e, "Timeout sweep skipped task"),
                }
            }
        }

        if report
            .timed_out
            .iter()
            .any(|(_, o)| !o.is_dead_lettered())
        {
            self.wakeup.notify_waiters();
        }
        report
    }

    /// Cancel a non-terminal task. No retry follows.
    pub fn cancel(&self, task_id: Uuid) -> HierarchResult<Task> {
        self.cancel_with_reason(task_id, None)
    }

    /// Cancel and record why.
    pub fn cancel_with_reason(&self, task_id: Uuid, reason: Option<String>) -> HierarchResult<Task> {
        let mut state = self.state.write();
        let task = Self::cancel_locked(&mut state, task_id, reason)?;
        info!(task_id = %task_id, "Task cancelled");
        Ok(task)
    }

    fn cancel_locked(
        state: &mut QueueState,
        task_id: Uuid,
        reason: Option<String>,
    ) -> HierarchResult<Task> {
        let task = state.active_mut(task_id, TaskStatus::Cancelled)?;
        transition(task, TaskStatus::Cancelled)?;
        task.completed_at = Some(Utc::now());
        if reason.is_some() {
            task.error = reason;
        }
        let cancelled = task.clone();
        state.archive(task_id);
        Ok(cancelled)
    }

    /// Cooperative cancellation point for the worker executing `task_id`.
    ///
    /// Returns `Cancelled` if the task was cancelled and `ClaimConflict` if the
    /// attempt no longer belongs to `agent_id` (timed out and requeued, or
    /// finished elsewhere).
    pub fn checkpoint(&self, task_id: Uuid, agent_id: Uuid) -> HierarchResult<()> {
        Self::ensure_owner(&self.state.read(), task_id, agent_id)
    }

    fn ensure_owner(state: &QueueState, task_id: Uuid, agent_id: Uuid) -> HierarchResult<()> {
        if let Some(task) = state.archive.get(&task_id) {
            return match task.status {
                TaskStatus::Cancelled => Err(HierarchError::Cancelled(task_id)),
                _ => Err(HierarchError::ClaimConflict(task_id)),
            };
        }
        let task = state
            .active
            .get(&task_id)
            .ok_or(HierarchError::TaskNotFound(task_id))?;
        if task.assigned_agent == Some(agent_id) {
            Ok(())
        } else {
            Err(HierarchError::ClaimConflict(task_id))
        }
    }

    /// Pending tasks that wait on a dependency which will never complete,
    /// paired with that dependency.
    pub fn blocked_by_terminal(&self) -> Vec<(Uuid, Uuid)> {
        let state = self.state.read();
        state
            .active
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                t.dependencies
                    .iter()
                    .find(|dep| {
                        state
                            .archive
                            .get(*dep)
                            .is_some_and(|d| d.status != TaskStatus::Completed)
                    })
                    .map(|dep| (t.id, *dep))
            })
            .collect()
    }

    /// Assigned or in-progress tasks bound to an agent.
    pub fn in_flight_for(&self, agent_id: Uuid) -> Vec<Uuid> {
        self.state
            .read()
            .active
            .values()
            .filter(|t| {
                t.assigned_agent == Some(agent_id)
                    && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
            })
            .map(|t| t.id)
            .collect()
    }

    /// Get a task by ID, active or archived.
    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        let state = self.state.read();
        state
            .active
            .get(&task_id)
            .or_else(|| state.archive.get(&task_id))
            .cloned()
    }

    /// Current status of a task.
    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        let state = self.state.read();
        state
            .active
            .get(&task_id)
            .or_else(|| state.archive.get(&task_id))
            .map(|t| t.status)
    }

    /// All tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<Task> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .active
            .values()
            .chain(state.archive.values())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        tasks
    }

    /// Dead-lettered tasks awaiting external intervention.
    pub fn dead_letters(&self) -> Vec<Task> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .archive
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.completed_at);
        tasks
    }

    /// Tasks waiting to be claimed, ready or not.
    pub fn pending_count(&self) -> usize {
        self.state
            .read()
            .active
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Every task ever submitted, active or archived.
    pub fn total_count(&self) -> usize {
        let state = self.state.read();
        state.active.len() + state.archive.len()
    }

    /// Task counts per status.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.read();
        QueueStats::from_statuses(
            state
                .active
                .values()
                .chain(state.archive.values())
                .map(|t| t.status),
        )
    }

    /// No task is pending, assigned, or in progress.
    pub fn is_drained(&self) -> bool {
        self.state.read().active.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn claim_one(queue: &TaskQueue) -> Task {
        queue.claim(Uuid::new_v4()).unwrap().expect("a ready task")
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::new();
        assert_eq!(queue.total_count(), 0);
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.is_drained());
        assert!(queue.claim(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_submit_and_retrieve() {
        let queue = TaskQueue::new();
        let id = queue.submit(Task::new("code", "Test task")).unwrap();

        assert_eq!(queue.total_count(), 1);
        let task = queue.get(id).unwrap();
        assert_eq!(task.description, "Test task");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.sequence, 1);
    }

    #[test]
    fn test_submit_rejects_unknown_dependency() {
        let queue = TaskQueue::new();
        let missing = Uuid::new_v4();
        let err = queue
            .submit(Task::new("code", "Orphan").with_dependencies(vec![missing]))
            .unwrap_err();
        assert!(matches!(err, HierarchError::InvalidDependency { dependency, .. } if dependency == missing));
        assert_eq!(queue.total_count(), 0);
    }

    #[test]
    fn test_submit_rejects_self_dependency_and_bad_priority() {
        let queue = TaskQueue::new();
        let task = Task::new("code", "Self");
        let id = task.id;
        let err = queue.submit(task.with_dependencies(vec![id])).unwrap_err();
        assert!(matches!(err, HierarchError::InvalidDependency { .. }));

        for priority in [0, 11] {
            let err = queue
                .submit(Task::new("code", "Bad").with_priority(priority))
                .unwrap_err();
            assert!(matches!(err, HierarchError::InvalidPriority(p) if p == priority));
        }
    }

    #[test]
    fn test_submit_rejects_duplicate_id() {
        let queue = TaskQueue::new();
        let task = Task::new("code", "Once");
        queue.submit(task.clone()).unwrap();
        let err = queue.submit(task).unwrap_err();
        assert!(matches!(err, HierarchError::AlreadyExists { .. }));
    }

    #[test]
    fn test_claim_priority_order() {
        let queue = TaskQueue::new();
        for priority in [5, 1, 9] {
            queue
                .submit(Task::new("work", format!("p{priority}")).with_priority(priority))
                .unwrap();
        }

        let order: Vec<u8> = (0..3).map(|_| claim_one(&queue).priority).collect();
        assert_eq!(order, vec![9, 5, 1]);
        assert!(queue.claim(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = TaskQueue::new();
        let first = queue.submit(Task::new("work", "first")).unwrap();
        let second = queue.submit(Task::new("work", "second")).unwrap();

        assert_eq!(claim_one(&queue).id, first);
        assert_eq!(claim_one(&queue).id, second);
    }

    #[test]
    fn test_claim_binds_agent_and_starts() {
        let queue = TaskQueue::new();
        let id = queue.submit(Task::new("work", "bind")).unwrap();
        let agent = Uuid::new_v4();

        let task = queue.claim(agent).unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent, Some(agent));
        assert_eq!(queue.in_flight_for(agent), vec![id]);
    }

    #[test]
    fn test_dependency_chain() {
        let queue = TaskQueue::new();
        let spec = queue.submit(Task::new("spec", "Spec")).unwrap();
        let code = queue
            .submit(Task::new("code", "Code").with_dependencies(vec![spec]).with_priority(10))
            .unwrap();

        // The high-priority dependent is blocked until its dependency completes.
        let claimed = claim_one(&queue);
        assert_eq!(claimed.id, spec);
        assert!(queue.claim(Uuid::new_v4()).unwrap().is_none());

        queue.complete(spec, serde_json::json!("spec done")).unwrap();
        assert_eq!(claim_one(&queue).id, code);
    }

    #[test]
    fn test_claim_skips_expired_task() {
        let queue = TaskQueue::new();
        queue
            .submit(Task::new("work", "late").with_deadline(Utc::now() - Duration::seconds(1)))
            .unwrap();
        assert!(queue.claim(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_claim_filter_by_type() {
        let queue = TaskQueue::new();
        queue.submit(Task::new("review", "r").with_priority(9)).unwrap();
        let code = queue.submit(Task::new("code", "c").with_priority(2)).unwrap();

        let filter = ClaimFilter::task_types(["code"]);
        let task = queue
            .claim_matching(Uuid::new_v4(), &filter)
            .unwrap()
            .unwrap();
        assert_eq!(task.id, code);
        assert!(queue
            .claim_matching(Uuid::new_v4(), &filter)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let queue = TaskQueue::new();
        let id = queue.submit(Task::new("work", "early")).unwrap();

        let err = queue.complete(id, serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, HierarchError::InvalidTransition { .. }));

        claim_one(&queue);
        let done = queue.complete(id, serde_json::json!({"ok": true})).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));

        // Terminal: a second completion is rejected.
        let err = queue.complete(id, serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, HierarchError::InvalidTransition { .. }));
        assert!(queue.is_drained());
    }

    #[test]
    fn test_fail_requires_in_progress() {
        let queue = TaskQueue::new();
        let id = queue.submit(Task::new("work", "not started")).unwrap();
        let err = queue.fail(id, "boom").unwrap_err();
        assert!(matches!(err, HierarchError::InvalidTransition { .. }));
        assert!(matches!(
            queue.fail(Uuid::new_v4(), "boom").unwrap_err(),
            HierarchError::TaskNotFound(_)
        ));
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let queue = TaskQueue::new();
        let id = queue
            .submit(Task::new("work", "flaky").with_max_retries(3))
            .unwrap();

        for attempt in 1..=3 {
            claim_one(&queue);
            let outcome = queue.fail(id, format!("attempt {attempt} failed")).unwrap();
            assert_eq!(outcome, FailureOutcome::Requeued { retry_count: attempt });
            assert_eq!(queue.status(id), Some(TaskStatus::Pending));
        }

        claim_one(&queue);
        let outcome = queue.fail(id, "attempt 4 failed").unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { retry_count: 3 });

        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.error.as_deref(), Some("attempt 4 failed"));
        assert!(queue.claim(Uuid::new_v4()).unwrap().is_none());
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[test]
    fn test_requeue_resets_fifo_position() {
        let queue = TaskQueue::new();
        let retried = queue.submit(Task::new("work", "retried")).unwrap();
        let waiting = queue.submit(Task::new("work", "waiting")).unwrap();

        assert_eq!(claim_one(&queue).id, retried);
        queue.fail(retried, "transient").unwrap();

        // The retried task re-enters behind the one that was already waiting.
        assert_eq!(claim_one(&queue).id, waiting);
        assert_eq!(claim_one(&queue).id, retried);
    }

    #[test]
    fn test_sweep_times_out_in_progress() {
        let queue = TaskQueue::new();
        let id = queue
            .submit(Task::new("work", "slow").with_timeout(Duration::seconds(10)))
            .unwrap();
        claim_one(&queue);

        let now = Utc::now() + Duration::seconds(11);
        let report = queue.sweep_timeouts(now);
        assert_eq!(
            report.timed_out,
            vec![(id, FailureOutcome::Requeued { retry_count: 1 })]
        );

        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.unwrap().contains("Timeout"));
        // The next attempt gets a fresh window.
        assert!(task.deadline.unwrap() > now);
    }

    #[test]
    fn test_sweep_dead_letters_after_budget() {
        let queue = TaskQueue::new();
        let id = queue
            .submit(
                Task::new("work", "always slow")
                    .with_timeout(Duration::seconds(5))
                    .with_max_retries(0),
            )
            .unwrap();
        claim_one(&queue);

        let report = queue.sweep_timeouts(Utc::now() + Duration::seconds(6));
        assert_eq!(
            report.timed_out,
            vec![(id, FailureOutcome::DeadLettered { retry_count: 0 })]
        );
        assert_eq!(queue.status(id), Some(TaskStatus::Failed));
    }

    #[test]
    fn test_sweep_times_out_assigned() {
        let queue = TaskQueue::new();
        let id = queue
            .submit(Task::new("work", "reserved").with_timeout(Duration::seconds(5)))
            .unwrap();
        queue.reserve(id, Uuid::new_v4()).unwrap();

        let report = queue.sweep_timeouts(Utc::now() + Duration::seconds(6));
        assert_eq!(report.timed_out.len(), 1);
        assert_eq!(queue.status(id), Some(TaskStatus::Pending));
    }

    #[test]
    fn test_sweep_cancels_expired_pending() {
        let queue = TaskQueue::new();
        let id = queue
            .submit(Task::new("work", "unclaimed").with_timeout(Duration::seconds(5)))
            .unwrap();

        let report = queue.sweep_timeouts(Utc::now() + Duration::seconds(6));
        assert_eq!(report.expired, vec![id]);
        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_some());
    }

    #[test]
    fn test_sweep_ignores_tasks_within_deadline() {
        let queue = TaskQueue::new();
        queue
            .submit(Task::new("work", "fine").with_timeout(Duration::seconds(60)))
            .unwrap();
        claim_one(&queue);
        assert!(queue.sweep_timeouts(Utc::now()).is_empty());
    }

    #[test]
    fn test_cancel_from_each_live_state() {
        let queue = TaskQueue::new();
        let pending = queue.submit(Task::new("work", "p")).unwrap();
        let assigned = queue.submit(Task::new("work", "a")).unwrap();
        let running = queue.submit(Task::new("work", "r")).unwrap();

        queue.reserve(assigned, Uuid::new_v4()).unwrap();
        queue.try_claim(running, Uuid::new_v4()).unwrap();

        for id in [pending, assigned, running] {
            let task = queue.cancel(id).unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
        }

        let err = queue.cancel(pending).unwrap_err();
        assert!(matches!(err, HierarchError::InvalidTransition { .. }));
        assert_eq!(queue.stats().cancelled, 3);
    }

    #[test]
    fn test_checkpoint_observes_cancellation() {
        let queue = TaskQueue::new();
        let agent = Uuid::new_v4();
        let id = queue.submit(Task::new("work", "long")).unwrap();
        queue.claim(agent).unwrap();

        assert!(queue.checkpoint(id, agent).is_ok());
        assert!(matches!(
            queue.checkpoint(id, Uuid::new_v4()).unwrap_err(),
            HierarchError::ClaimConflict(_)
        ));

        queue.cancel(id).unwrap();
        assert!(matches!(
            queue.checkpoint(id, agent).unwrap_err(),
            HierarchError::Cancelled(_)
        ));
    }

    #[test]
    fn test_two_phase_claim() {
        let queue = TaskQueue::new();
        let agent = Uuid::new_v4();
        let id = queue.submit(Task::new("work", "two phase")).unwrap();

        let reserved = queue.reserve(id, agent).unwrap();
        assert_eq!(reserved.status, TaskStatus::Assigned);

        // Assigned tasks cannot be completed without being started.
        assert!(queue.complete(id, serde_json::Value::Null).is_err());
        assert!(matches!(
            queue.start(id, Uuid::new_v4()).unwrap_err(),
            HierarchError::ClaimConflict(_)
        ));

        let started = queue.start(id, agent).unwrap();
        assert_eq!(started.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_try_claim_conflict() {
        let queue = TaskQueue::new();
        let id = queue.submit(Task::new("work", "contested")).unwrap();

        queue.try_claim(id, Uuid::new_v4()).unwrap();
        let err = queue.try_claim(id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, HierarchError::ClaimConflict(t) if t == id));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_try_claim_blocked_dependency() {
        let queue = TaskQueue::new();
        let dep = queue.submit(Task::new("work", "dep")).unwrap();
        let id = queue
            .submit(Task::new("work", "blocked").with_dependencies(vec![dep]))
            .unwrap();
        let err = queue.try_claim(id, Uuid::new_v4()).unwrap_err();
        assert!(err.to_string().contains("dependencies incomplete"));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let queue = Arc::new(TaskQueue::new());
        let id = queue.submit(Task::new("work", "race")).unwrap();

        let results: Vec<HierarchResult<Task>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    s.spawn(move || queue.try_claim(id, Uuid::new_v4()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(HierarchError::ClaimConflict(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 15);
    }

    #[test]
    fn test_concurrent_claim_never_duplicates() {
        let queue = Arc::new(TaskQueue::new());
        for i in 0..50 {
            queue
                .submit(Task::new("work", format!("t{i}")).with_priority((i % 10 + 1) as u8))
                .unwrap();
        }

        let claimed: Vec<Uuid> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    s.spawn(move || {
                        let agent = Uuid::new_v4();
                        let mut mine = Vec::new();
                        loop {
                            match queue.claim(agent) {
                                Ok(Some(task)) => mine.push(task.id),
                                Ok(None) => break,
                                Err(e) if e.is_retryable() => continue,
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                        mine
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let unique: HashSet<Uuid> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[test]
    fn test_blocked_by_terminal() {
        let queue = TaskQueue::new();
        let dep = queue.submit(Task::new("work", "doomed")).unwrap();
        let child = queue
            .submit(Task::new("work", "child").with_dependencies(vec![dep]))
            .unwrap();

        assert!(queue.blocked_by_terminal().is_empty());
        queue.cancel(dep).unwrap();
        assert_eq!(queue.blocked_by_terminal(), vec![(child, dep)]);
    }

    #[test]
    fn test_abandon_in_flight() {
        let queue = TaskQueue::new();
        let agent = Uuid::new_v4();
        let id = queue.submit(Task::new("work", "orphaned")).unwrap();
        queue.reserve(id, agent).unwrap();

        let outcome = queue.abandon(id, "agent lost").unwrap();
        assert_eq!(outcome, FailureOutcome::Requeued { retry_count: 1 });
        assert!(queue.in_flight_for(agent).is_empty());
        assert!(queue.abandon(id, "again").is_err());
    }

    #[test]
    fn test_would_dead_letter() {
        let queue = TaskQueue::new();
        let id = queue
            .submit(Task::new("work", "fragile").with_max_retries(0))
            .unwrap();
        assert!(queue.would_dead_letter(id).unwrap());
        assert!(queue.would_dead_letter(Uuid::new_v4()).is_err());
    }

    #[tokio::test]
    async fn test_claim_wait_wakes_on_submit() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .claim_wait(
                        Uuid::new_v4(),
                        &ClaimFilter::any(),
                        std::time::Duration::from_secs(5),
                    )
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let id = queue.submit(Task::new("work", "late arrival")).unwrap();

        let claimed = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_claim_wait_times_out() {
        let queue = TaskQueue::new();
        let result = queue
            .claim_wait(
                Uuid::new_v4(),
                &ClaimFilter::any(),
                std::time::Duration::from_millis(30),
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_stale_holder_cannot_finish_requeued_attempt() {
        let queue = TaskQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let id = queue
            .submit(Task::new("work", "slow").with_timeout(Duration::seconds(5)))
            .unwrap();

        queue.claim(first).unwrap().unwrap();
        queue.sweep_timeouts(Utc::now() + Duration::seconds(6));
        assert_eq!(queue.claim(second).unwrap().unwrap().id, id);

        let err = queue
            .complete_as(id, first, serde_json::json!("from first"))
            .unwrap_err();
        assert!(matches!(err, HierarchError::ClaimConflict(t) if t == id));
        let err = queue.fail_as(id, first, "late failure").unwrap_err();
        assert!(matches!(err, HierarchError::ClaimConflict(_)));

        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent, Some(second));
        assert!(task.result.is_none());

        let done = queue
            .complete_as(id, second, serde_json::json!("from second"))
            .unwrap();
        assert_eq!(done.result, Some(serde_json::json!("from second")));
    }

    #[test]
    fn test_complete_as_after_cancel() {
        let queue = TaskQueue::new();
        let agent = Uuid::new_v4();
        let id = queue.submit(Task::new("work", "dropped")).unwrap();
        queue.claim(agent).unwrap().unwrap();
        queue.cancel(id).unwrap();

        let err = queue.complete_as(id, agent, serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, HierarchError::Cancelled(_)));
        assert_eq!(queue.status(id), Some(TaskStatus::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_wait_under_contention_ends_within_timeout() {
        let config = QueueConfig {
            claim_backoff_ms: 1_000,
            ..QueueConfig::default()
        };
        let queue = Arc::new(TaskQueue::with_config(&config));
        for i in 0..200 {
            queue.submit(Task::new("work", format!("t{i}"))).unwrap();
        }

        let started = std::time::Instant::now();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let agent = Uuid::new_v4();
                    let timeout = std::time::Duration::from_millis(50);
                    while queue
                        .claim_wait(agent, &ClaimFilter::any(), timeout)
                        .await
                        .unwrap()
                        .is_some()
                    {}
                })
            })
            .collect();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        // Every waiter ends on a timeout; none sleeps a full backoff past it.
        assert!(started.elapsed() < std::time::Duration::from_millis(900));
    }
}

use crate::config::SupervisorConfig;
use crate::mailbox::Mailbox;
use crate::types::{AgentNode, AgentStatus};
use chrono::Utc;
use hierarch_core::{HierarchError, HierarchResult, Message};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A request to spawn an agent, either as a new root or under an existing parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// `None` spawns a root agent at depth 0.
    pub parent_id: Option<Uuid>,
    /// Role of the new agent.
    pub agent_type: String,
    /// Fan-out limit of the new agent; the configured default when unset.
    #[serde(default)]
    pub max_children: Option<u32>,
    /// Opaque collaborator data stored on the node.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SpawnRequest {
    /// Request for a root agent.
    pub fn root(agent_type: impl Into<String>) -> Self {
        Self {
            parent_id: None,
            agent_type: agent_type.into(),
            max_children: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Request for a child of `parent_id`.
    pub fn child(parent_id: Uuid, agent_type: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::root(agent_type)
        }
    }

    /// Override the fan-out limit.
    pub fn with_max_children(mut self, max: u32) -> Self {
        self.max_children = Some(max);
        self
    }

    /// Attach opaque collaborator data.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Owns every [`AgentNode`] and enforces the spawn hierarchy limits:
/// depth, per-parent fan-out and per-type concurrency.
///
/// All checks and counter updates for one operation run under a single write
/// lock, so `0 <= current_children <= max_children` holds at every point.
pub struct AgentSupervisor {
    agents: RwLock<HashMap<Uuid, AgentNode>>,
    config: SupervisorConfig,
    mailbox: Arc<Mailbox>,
}

impl AgentSupervisor {
    /// Empty hierarchy; lifecycle messages go to `mailbox`.
    pub fn new(config: SupervisorConfig, mailbox: Arc<Mailbox>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            config,
            mailbox,
        }
    }

    /// Hierarchy limits in force.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn an agent.
    ///
    /// Fails with `AgentNotFound`/`AgentNotActive` for a missing or terminated
    /// parent, `DepthExceeded` when the parent is already at the depth cap,
    /// `CapacityExceeded` when it has no free child slot, and
    /// `TypeConcurrencyExceeded` when the type's active cap is reached.
    pub fn spawn(&self, request: SpawnRequest) -> HierarchResult<AgentNode> {
        let mut agents = self.agents.write();

        let depth = match request.parent_id {
            Some(parent_id) => {
                let parent = agents
                    .get(&parent_id)
                    .ok_or(HierarchError::AgentNotFound(parent_id))?;
                self.check_parent(parent)?;
                parent.depth + 1
            }
            None => 0,
        };
        self.check_type_limit(&agents, &request.agent_type)?;

        let node = AgentNode {
            id: Uuid::new_v4(),
            parent_id: request.parent_id,
            agent_type: request.agent_type,
            depth,
            status: AgentStatus::Active,
            max_children: request
                .max_children
                .unwrap_or(self.config.default_max_children),
            current_children: 0,
            restart_count: 0,
            abandoned: false,
            created_at: Utc::now(),
            terminated_at: None,
            error: None,
            metadata: request.metadata,
        };

        if let Some(parent) = node.parent_id.and_then(|p| agents.get_mut(&p)) {
            parent.current_children += 1;
        }
        agents.insert(node.id, node.clone());

        info!(
            agent_id = %node.id,
            parent_id = ?node.parent_id,
            agent_type = %node.agent_type,
            depth = node.depth,
            "Agent spawned"
        );
        Ok(node)
    }

    fn check_parent(&self, parent: &AgentNode) -> HierarchResult<()> {
        if parent.status != AgentStatus::Active {
            return Err(HierarchError::AgentNotActive(parent.id));
        }
        if parent.depth >= self.config.max_depth {
            return Err(HierarchError::DepthExceeded {
                parent: parent.id,
                depth: parent.depth,
                max: self.config.max_depth,
            });
        }
        if !parent.has_capacity() {
            return Err(HierarchError::CapacityExceeded {
                parent: parent.id,
                current: parent.current_children,
                max: parent.max_children,
            });
        }
        Ok(())
    }

    fn check_type_limit(
        &self,
        agents: &HashMap<Uuid, AgentNode>,
        agent_type: &str,
    ) -> HierarchResult<()> {
        if let Some(max) = self.config.type_limit(agent_type) {
            let active = count_active(agents, agent_type);
            if active >= max {
                return Err(HierarchError::TypeConcurrencyExceeded {
                    agent_type: agent_type.to_string(),
                    active,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Move an agent to a terminal status and release its parent's slot.
    ///
    /// Returns `Ok(false)` if the agent was already terminal (nothing changes,
    /// nothing is posted). The parent, or the coordinator for a root, receives
    /// `task_completion` for completed/cancelled and `error_report` for
    /// failed/timeout.
    pub fn mark_terminal(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        reason: Option<String>,
    ) -> HierarchResult<bool> {
        let message = {
            let mut agents = self.agents.write();
            let node = agents
                .get_mut(&agent_id)
                .ok_or(HierarchError::AgentNotFound(agent_id))?;

            if !status.is_terminal() {
                return Err(HierarchError::InvalidTransition {
                    entity: "agent",
                    id: agent_id,
                    from: node.status.to_string(),
                    to: status.to_string(),
                });
            }
            if node.status.is_terminal() {
                return Ok(false);
            }

            node.status = status;
            node.terminated_at = Some(Utc::now());
            node.error = reason.clone();
            let parent_id = node.parent_id;
            let payload = serde_json::json!({
                "agent_id": agent_id,
                "agent_type": node.agent_type,
                "status": status,
                "reason": reason,
            });
            release_slot(&mut agents, parent_id);

            match status {
                AgentStatus::Failed | AgentStatus::Timeout => {
                    Message::error_report(agent_id, parent_id, payload)
                }
                _ => Message::completion(agent_id, parent_id, payload),
            }
        };

        match status {
            AgentStatus::Failed | AgentStatus::Timeout => {
                warn!(agent_id = %agent_id, status = %status, "Agent terminated abnormally")
            }
            _ => info!(agent_id = %agent_id, status = %status, "Agent terminated"),
        }
        self.mailbox.post(message);
        Ok(true)
    }

    /// Bring a failed or timed-out agent back to `active`.
    ///
    /// The parent slot and the type slot are acquired again. Once the agent has
    /// been restarted `max_attempts` times its subtree is abandoned: every
    /// active descendant is cancelled, an `error_report` goes to the parent and
    /// `RestartBudgetExhausted` is returned (on this and every later call).
    pub fn restart(&self, agent_id: Uuid, max_attempts: u32) -> HierarchResult<AgentNode> {
        let mut agents = self.agents.write();
        let node = agents
            .get(&agent_id)
            .ok_or(HierarchError::AgentNotFound(agent_id))?;

        if node.abandoned {
            return Err(HierarchError::RestartBudgetExhausted {
                agent: agent_id,
                attempts: node.restart_count,
            });
        }
        if !node.status.is_restartable() {
            return Err(HierarchError::InvalidTransition {
                entity: "agent",
                id: agent_id,
                from: node.status.to_string(),
                to: AgentStatus::Active.to_string(),
            });
        }

        if node.restart_count >= max_attempts {
            let attempts = node.restart_count;
            let parent_id = node.parent_id;
            let cancelled = abandon_subtree(&mut agents, agent_id);
            drop(agents);

            warn!(
                agent_id = %agent_id,
                attempts,
                cancelled_descendants = cancelled.len(),
                "Restart budget exhausted, subtree abandoned"
            );
            self.mailbox.post(Message::error_report(
                agent_id,
                parent_id,
                serde_json::json!({
                    "agent_id": agent_id,
                    "status": "abandoned",
                    "restart_attempts": attempts,
                    "cancelled_descendants": cancelled,
                }),
            ));
            return Err(HierarchError::RestartBudgetExhausted {
                agent: agent_id,
                attempts,
            });
        }

        let parent_id = node.parent_id;
        let agent_type = node.agent_type.clone();
        if let Some(parent) = parent_id.and_then(|p| agents.get(&p)) {
            // Depth is unchanged, so only liveness and capacity matter here.
            if parent.status != AgentStatus::Active {
                return Err(HierarchError::AgentNotActive(parent.id));
            }
            if !parent.has_capacity() {
                return Err(HierarchError::CapacityExceeded {
                    parent: parent.id,
                    current: parent.current_children,
                    max: parent.max_children,
                });
            }
        }
        self.check_type_limit(&agents, &agent_type)?;

        if let Some(parent) = parent_id.and_then(|p| agents.get_mut(&p)) {
            parent.current_children += 1;
        }
        let node = agents
            .get_mut(&agent_id)
            .ok_or(HierarchError::AgentNotFound(agent_id))?;
        node.status = AgentStatus::Active;
        node.restart_count += 1;
        node.terminated_at = None;
        node.error = None;

        info!(
            agent_id = %agent_id,
            restart_count = node.restart_count,
            max_attempts,
            "Agent restarted"
        );
        Ok(node.clone())
    }

    /// Admission check before an agent may claim work.
    pub fn admit(&self, agent_id: Uuid) -> HierarchResult<AgentNode> {
        let agents = self.agents.read();
        let node = agents
            .get(&agent_id)
            .ok_or(HierarchError::AgentNotFound(agent_id))?;
        if node.status != AgentStatus::Active {
            return Err(HierarchError::AgentNotActive(agent_id));
        }
        Ok(node.clone())
    }

    /// Replace the opaque metadata blob of an agent.
    pub fn attach_metadata(&self, agent_id: Uuid, metadata: serde_json::Value) -> HierarchResult<()> {
        let mut agents = self.agents.write();
        let node = agents
            .get_mut(&agent_id)
            .ok_or(HierarchError::AgentNotFound(agent_id))?;
        node.metadata = metadata;
        Ok(())
    }

    /// Look up an agent by ID.
    pub fn get(&self, agent_id: Uuid) -> Option<AgentNode> {
        self.agents.read().get(&agent_id).cloned()
    }

    /// Direct children of an agent, in spawn order.
    pub fn children_of(&self, parent_id: Uuid) -> Vec<AgentNode> {
        let mut children: Vec<AgentNode> = self
            .agents
            .read()
            .values()
            .filter(|a| a.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|a| a.created_at);
        children
    }

    /// Every agent below `agent_id`, at any depth.
    pub fn descendants(&self, agent_id: Uuid) -> Vec<Uuid> {
        collect_descendants(&self.agents.read(), agent_id)
    }

    /// Active agents of one type.
    pub fn active_count_by_type(&self, agent_type: &str) -> usize {
        count_active(&self.agents.read(), agent_type)
    }

    /// Active agents of any type.
    pub fn active_count(&self) -> usize {
        self.agents
            .read()
            .values()
            .filter(|a| a.status == AgentStatus::Active)
            .count()
    }

    /// All agents, oldest first.
    pub fn all_agents(&self) -> Vec<AgentNode> {
        let mut agents: Vec<AgentNode> = self.agents.read().values().cloned().collect();
        agents.sort_by_key(|a| (a.depth, a.created_at));
        agents
    }
}

fn count_active(agents: &HashMap<Uuid, AgentNode>, agent_type: &str) -> usize {
    agents
        .values()
        .filter(|a| a.agent_type == agent_type && a.status == AgentStatus::Active)
        .count()
}

fn release_slot(agents: &mut HashMap<Uuid, AgentNode>, parent_id: Option<Uuid>) {
    if let Some(parent) = parent_id.and_then(|p| agents.get_mut(&p)) {
        parent.current_children = parent.current_children.saturating_sub(1);
    }
}

fn collect_descendants(agents: &HashMap<Uuid, AgentNode>, root: Uuid) -> Vec<Uuid> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        for child in agents.values().filter(|a| a.parent_id == Some(current)) {
            found.push(child.id);
            frontier.push(child.id);
        }
    }
    found
}

/// Flag `agent_id` abandoned and cancel its active descendants.
/// Returns the IDs that were cancelled.
fn abandon_subtree(agents: &mut HashMap<Uuid, AgentNode>, agent_id: Uuid) -> Vec<Uuid> {
    if let Some(node) = agents.get_mut(&agent_id) {
        node.abandoned = true;
    }

    let now = Utc::now();
    let mut cancelled = Vec::new();
    for id in collect_descendants(agents, agent_id) {
        let Some(node) = agents.get_mut(&id) else {
            continue;
        };
        if node.status != AgentStatus::Active {
            continue;
        }
        node.status = AgentStatus::Cancelled;
        node.terminated_at = Some(now);
        node.error = Some(format!("ancestor {agent_id} abandoned"));
        let parent_id = node.parent_id;
        release_slot(agents, parent_id);
        cancelled.push(id);
    }
    cancelled
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hierarch_core::MessageType;

    fn supervisor() -> (AgentSupervisor, Arc<Mailbox>) {
        let mailbox = Arc::new(Mailbox::new());
        (
            AgentSupervisor::new(SupervisorConfig::default(), Arc::clone(&mailbox)),
            mailbox,
        )
    }

    #[test]
    fn test_spawn_root_and_child() {
        let (sup, _) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        assert_eq!(root.depth, 0);
        assert!(root.is_root());
        assert_eq!(root.max_children, 5);

        let child = sup
            .spawn(SpawnRequest::child(root.id, "coder").with_metadata(serde_json::json!({"persona": "terse"})))
            .unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(sup.get(root.id).unwrap().current_children, 1);
        assert_eq!(sup.children_of(root.id).len(), 1);
    }

    #[test]
    fn test_depth_limit() {
        let (sup, _) = supervisor();
        let mut parent = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        for depth in 1..=3 {
            parent = sup.spawn(SpawnRequest::child(parent.id, "worker")).unwrap();
            assert_eq!(parent.depth, depth);
        }

        let err = sup
            .spawn(SpawnRequest::child(parent.id, "worker"))
            .unwrap_err();
        assert!(matches!(err, HierarchError::DepthExceeded { depth: 3, max: 3, .. }));
        assert!(err.is_hierarchy_violation());
        assert_eq!(sup.get(parent.id).unwrap().current_children, 0);
    }

    #[test]
    fn test_capacity_limit() {
        let (sup, _) = supervisor();
        let root = sup
            .spawn(SpawnRequest::root("orchestrator").with_max_children(2))
            .unwrap();
        sup.spawn(SpawnRequest::child(root.id, "a")).unwrap();
        sup.spawn(SpawnRequest::child(root.id, "b")).unwrap();

        let err = sup.spawn(SpawnRequest::child(root.id, "c")).unwrap_err();
        assert!(matches!(err, HierarchError::CapacityExceeded { current: 2, max: 2, .. }));
    }

    #[test]
    fn test_type_concurrency_limit() {
        let mailbox = Arc::new(Mailbox::new());
        let mut config = SupervisorConfig::default();
        config.type_limits.insert("coder".into(), 1);
        let sup = AgentSupervisor::new(config, mailbox);

        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        let coder = sup.spawn(SpawnRequest::child(root.id, "coder")).unwrap();
        let err = sup.spawn(SpawnRequest::child(root.id, "coder")).unwrap_err();
        assert!(matches!(err, HierarchError::TypeConcurrencyExceeded { active: 1, max: 1, .. }));

        // A terminated agent frees its type slot.
        sup.mark_terminal(coder.id, AgentStatus::Completed, None).unwrap();
        assert_eq!(sup.active_count_by_type("coder"), 0);
        sup.spawn(SpawnRequest::child(root.id, "coder")).unwrap();
    }

    #[test]
    fn test_spawn_under_missing_or_terminated_parent() {
        let (sup, _) = supervisor();
        let err = sup
            .spawn(SpawnRequest::child(Uuid::new_v4(), "worker"))
            .unwrap_err();
        assert!(matches!(err, HierarchError::AgentNotFound(_)));

        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        sup.mark_terminal(root.id, AgentStatus::Cancelled, None).unwrap();
        let err = sup.spawn(SpawnRequest::child(root.id, "worker")).unwrap_err();
        assert!(matches!(err, HierarchError::AgentNotActive(_)));
    }

    #[test]
    fn test_mark_terminal_is_idempotent() {
        let (sup, mailbox) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        let child = sup.spawn(SpawnRequest::child(root.id, "worker")).unwrap();

        assert!(sup
            .mark_terminal(child.id, AgentStatus::Failed, Some("crashed".into()))
            .unwrap());
        assert!(!sup
            .mark_terminal(child.id, AgentStatus::Failed, Some("crashed".into()))
            .unwrap());
        assert!(!sup.mark_terminal(child.id, AgentStatus::Completed, None).unwrap());

        assert_eq!(sup.get(root.id).unwrap().current_children, 0);
        let inbox = mailbox.inbox(Some(root.id));
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_type, MessageType::ErrorReport);
        assert_eq!(inbox[0].payload["reason"], "crashed");

        let node = sup.get(child.id).unwrap();
        assert_eq!(node.status, AgentStatus::Failed);
        assert_eq!(node.error.as_deref(), Some("crashed"));
        assert!(node.terminated_at.is_some());
    }

    #[test]
    fn test_mark_terminal_root_reports_to_coordinator() {
        let (sup, mailbox) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        sup.mark_terminal(root.id, AgentStatus::Completed, None).unwrap();

        let inbox = mailbox.inbox(None);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_type, MessageType::TaskCompletion);
    }

    #[test]
    fn test_mark_terminal_rejects_active() {
        let (sup, _) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        let err = sup
            .mark_terminal(root.id, AgentStatus::Active, None)
            .unwrap_err();
        assert!(matches!(err, HierarchError::InvalidTransition { .. }));
    }

    #[test]
    fn test_restart_reacquires_slot() {
        let (sup, _) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        let child = sup.spawn(SpawnRequest::child(root.id, "worker")).unwrap();

        // Only failed/timeout agents can restart.
        assert!(matches!(
            sup.restart(child.id, 3).unwrap_err(),
            HierarchError::InvalidTransition { .. }
        ));

        sup.mark_terminal(child.id, AgentStatus::Timeout, None).unwrap();
        assert_eq!(sup.get(root.id).unwrap().current_children, 0);

        let restarted = sup.restart(child.id, 3).unwrap();
        assert_eq!(restarted.status, AgentStatus::Active);
        assert_eq!(restarted.restart_count, 1);
        assert_eq!(sup.get(root.id).unwrap().current_children, 1);
        assert!(sup.admit(child.id).is_ok());
    }

    #[test]
    fn test_cancelled_agent_cannot_restart() {
        let (sup, _) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        sup.mark_terminal(root.id, AgentStatus::Cancelled, None).unwrap();
        assert!(matches!(
            sup.restart(root.id, 3).unwrap_err(),
            HierarchError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_restart_budget_abandons_subtree() {
        let (sup, mailbox) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        let lead = sup.spawn(SpawnRequest::child(root.id, "lead")).unwrap();
        let helper = sup.spawn(SpawnRequest::child(lead.id, "helper")).unwrap();
        let leaf = sup.spawn(SpawnRequest::child(helper.id, "leaf")).unwrap();

        sup.mark_terminal(lead.id, AgentStatus::Failed, None).unwrap();
        sup.restart(lead.id, 1).unwrap();
        sup.mark_terminal(lead.id, AgentStatus::Failed, None).unwrap();

        let err = sup.restart(lead.id, 1).unwrap_err();
        assert!(matches!(err, HierarchError::RestartBudgetExhausted { attempts: 1, .. }));

        assert!(sup.get(lead.id).unwrap().abandoned);
        for id in [helper.id, leaf.id] {
            assert_eq!(sup.get(id).unwrap().status, AgentStatus::Cancelled);
        }
        assert_eq!(sup.get(helper.id).unwrap().current_children, 0);
        assert_eq!(sup.get(root.id).unwrap().current_children, 0);
        assert_eq!(sup.descendants(lead.id).len(), 2);

        let reports = mailbox.sent_by(lead.id, MessageType::ErrorReport);
        assert_eq!(reports.last().unwrap().payload["status"], "abandoned");

        // Later calls keep failing without reposting.
        let before = mailbox.all().len();
        assert!(sup.restart(lead.id, 5).is_err());
        assert_eq!(mailbox.all().len(), before);
    }

    #[test]
    fn test_admit() {
        let (sup, _) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        assert_eq!(sup.admit(root.id).unwrap().id, root.id);
        assert!(matches!(
            sup.admit(Uuid::new_v4()).unwrap_err(),
            HierarchError::AgentNotFound(_)
        ));
        sup.mark_terminal(root.id, AgentStatus::Completed, None).unwrap();
        assert!(matches!(
            sup.admit(root.id).unwrap_err(),
            HierarchError::AgentNotActive(_)
        ));
    }

    #[test]
    fn test_attach_metadata() {
        let (sup, _) = supervisor();
        let root = sup.spawn(SpawnRequest::root("orchestrator")).unwrap();
        sup.attach_metadata(root.id, serde_json::json!({"mood": "calm"}))
            .unwrap();
        assert_eq!(sup.get(root.id).unwrap().metadata["mood"], "calm");
    }

    #[test]
    fn test_children_bounds_under_races() {
        let (sup, _) = supervisor();
        let sup = Arc::new(sup);
        let root = sup
            .spawn(SpawnRequest::root("orchestrator").with_max_children(3))
            .unwrap();
        let root_id = root.id;

        std::thread::scope(|s| {
            for _ in 0..8 {
                let sup = Arc::clone(&sup);
                s.spawn(move || {
                    for _ in 0..50 {
                        if let Ok(child) = sup.spawn(SpawnRequest::child(root_id, "worker")) {
                            let current = sup.get(root_id).unwrap().current_children;
                            assert!(current <= 3);
                            sup.mark_terminal(child.id, AgentStatus::Completed, None)
                                .unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(sup.get(root_id).unwrap().current_children, 0);
        assert_eq!(sup.active_count(), 1);
    }
}

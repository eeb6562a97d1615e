//! Node execution store.
//!
//! Records live in one collection keyed by runtime id with two secondary
//! indexes (by parent, by plan execution). Every status change goes through
//! `transition`, a compare-and-swap that rejects moves the status table does
//! not allow.

use crate::error::StorageError;
use crate::execution::{NodeExecution, ProgressEntry, Status};
use crate::store::{Collection, KeyIndex, Storage, Update};
use crate::types::now_millis;
use std::collections::VecDeque;
use tracing::{debug, warn};

const TREE_NODE_EXECUTIONS: &str = "node_executions";
const TREE_BY_PARENT: &str = "node_executions_by_parent";
const TREE_BY_PLAN: &str = "node_executions_by_plan";
const ROOT_GROUP: &str = "~root";

/// Outcome of a status transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(NodeExecution),
    /// The current status does not allow the move; nothing was written
    Rejected { current: Status },
    Missing,
}

impl Transition {
    pub fn applied(self) -> Option<NodeExecution> {
        match self {
            Transition::Applied(node) => Some(node),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct NodeExecutionStore {
    records: Collection<NodeExecution>,
    by_parent: KeyIndex,
    by_plan: KeyIndex,
}

impl NodeExecutionStore {
    pub fn open(storage: &Storage) -> Result<Self, StorageError> {
        Ok(Self {
            records: Collection::open(storage, TREE_NODE_EXECUTIONS)?,
            by_parent: KeyIndex::open(storage, TREE_BY_PARENT)?,
            by_plan: KeyIndex::open(storage, TREE_BY_PLAN)?,
        })
    }

    /// Persist a new attempt. Fails if the runtime id is taken.
    pub fn create(&self, record: &NodeExecution) -> Result<(), StorageError> {
        if !self.records.insert_new(&record.uuid, record)? {
            return Err(StorageError::AlreadyExists {
                collection: TREE_NODE_EXECUTIONS.to_string(),
                key: record.uuid.clone(),
            });
        }
        let parent = record.parent_id.as_deref().unwrap_or(ROOT_GROUP);
        self.by_parent
            .add(&format!("{}:{}", record.plan_execution_id, parent), &record.uuid)?;
        self.by_plan.add(&record.plan_execution_id, &record.uuid)?;
        debug!(
            node_execution_id = %record.uuid,
            node_id = %record.node_id,
            parent_id = ?record.parent_id,
            "Node execution created"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<NodeExecution>, StorageError> {
        self.records.get(id)
    }

    pub fn require(&self, id: &str) -> Result<NodeExecution, StorageError> {
        self.records.require(id)
    }

    /// Conditional update of non-status fields; bumps the version when applied.
    pub fn update<F>(&self, id: &str, mut mutate: F) -> Result<Update<NodeExecution>, StorageError>
    where
        F: FnMut(&mut NodeExecution) -> bool,
    {
        self.records.update(id, |node| {
            if !mutate(node) {
                return false;
            }
            node.version += 1;
            node.last_updated_at = now_millis();
            true
        })
    }

    /// Move `id` to `to` if the table allows it from the stored status and,
    /// when given, the stored status is one of `expected`. `ops` runs on the
    /// record inside the same write.
    pub fn transition<F>(
        &self,
        id: &str,
        to: Status,
        expected: Option<&[Status]>,
        mut ops: F,
    ) -> Result<Transition, StorageError>
    where
        F: FnMut(&mut NodeExecution),
    {
        let mut rejected_from = None;
        let outcome = self.records.update(id, |node| {
            let allowed = node.status.can_transition_to(to)
                && expected.map(|e| e.contains(&node.status)).unwrap_or(true);
            if !allowed {
                rejected_from = Some(node.status);
                return false;
            }
            rejected_from = None;
            let now = now_millis();
            if to == Status::Running && node.start_ts.is_none() {
                node.start_ts = Some(now);
            }
            if to.is_final() {
                node.end_ts = Some(now);
            }
            node.status = to;
            ops(node);
            node.version += 1;
            node.last_updated_at = now;
            true
        })?;

        Ok(match outcome {
            Update::Applied(node) => {
                debug!(
                    node_execution_id = %id,
                    status = %to,
                    version = node.version,
                    "Status transition applied"
                );
                Transition::Applied(node)
            }
            Update::Unchanged(node) => {
                let current = rejected_from.unwrap_or(node.status);
                debug!(
                    node_execution_id = %id,
                    from = %current,
                    to = %to,
                    "Status transition rejected"
                );
                Transition::Rejected { current }
            }
            Update::Missing => {
                warn!(node_execution_id = %id, to = %to, "Transition on unknown node execution");
                Transition::Missing
            }
        })
    }

    pub fn append_progress(&self, id: &str, message: impl Into<String>) -> Result<(), StorageError> {
        let message = message.into();
        self.update(id, |node| {
            node.progress.push(ProgressEntry {
                ts: now_millis(),
                message: message.clone(),
            });
            true
        })?;
        Ok(())
    }

    /// Every attempt of every node in a plan execution
    pub fn for_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>, StorageError> {
        self.load_all(self.by_plan.members(plan_execution_id)?)
    }

    /// Direct children, including superseded attempts
    pub fn children(&self, plan_execution_id: &str, parent_id: &str) -> Result<Vec<NodeExecution>, StorageError> {
        let ids = self
            .by_parent
            .members(&format!("{}:{}", plan_execution_id, parent_id))?;
        let mut children = self.load_all(ids)?;
        children.sort_by_key(|n| n.created_at);
        Ok(children)
    }

    /// Nodes without a parent
    pub fn roots(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>, StorageError> {
        self.children(plan_execution_id, ROOT_GROUP)
    }

    pub fn children_without_old_retries(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
    ) -> Result<Vec<NodeExecution>, StorageError> {
        Ok(self
            .children(plan_execution_id, parent_id)?
            .into_iter()
            .filter(|n| !n.old_retry)
            .collect())
    }

    /// All live descendants of `parent_id`, breadth first
    pub fn descendants_without_old_retries(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
    ) -> Result<Vec<NodeExecution>, StorageError> {
        let mut out = Vec::new();
        let mut frontier = VecDeque::from([parent_id.to_string()]);
        while let Some(current) = frontier.pop_front() {
            for child in self.children_without_old_retries(plan_execution_id, &current)? {
                frontier.push_back(child.uuid.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    pub fn count_children_by_status(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
        statuses: &[Status],
    ) -> Result<usize, StorageError> {
        Ok(self
            .children_without_old_retries(plan_execution_id, parent_id)?
            .iter()
            .filter(|n| statuses.contains(&n.status))
            .count())
    }

    /// Newest live attempt of a plan node
    pub fn latest_attempt(
        &self,
        plan_execution_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, StorageError> {
        Ok(self
            .for_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|n| n.node_id == node_id && !n.old_retry)
            .max_by_key(|n| (n.retry_index(), n.created_at)))
    }

    /// Move the given leaves to `Discontinuing`; returns how many moved.
    pub fn mark_leaves_discontinuing(&self, ids: &[String]) -> Result<usize, StorageError> {
        let mut moved = 0;
        for id in ids {
            if let Transition::Applied(_) =
                self.transition(id, Status::Discontinuing, None, |_| {})?
            {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Move every live leaf or queued node whose status is in `statuses`
    /// to `Discontinuing`; returns the ids that moved.
    pub fn mark_all_leaves_and_queued_discontinuing(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> Result<Vec<String>, StorageError> {
        let candidates: Vec<String> = self
            .for_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|n| !n.old_retry && statuses.contains(&n.status))
            .filter(|n| n.is_leaf() || n.status == Status::Queued)
            .map(|n| n.uuid)
            .collect();
        let mut moved = Vec::new();
        for id in candidates {
            if let Transition::Applied(node) =
                self.transition(&id, Status::Discontinuing, None, |_| {})?
            {
                moved.push(node.uuid);
            }
        }
        Ok(moved)
    }

    fn load_all(&self, ids: Vec<String>) -> Result<Vec<NodeExecution>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.records.get(&id)? {
                out.push(node);
            }
        }
        Ok(out)
    }
}

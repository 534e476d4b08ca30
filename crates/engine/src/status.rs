//! Pass/fail/skip bookkeeping for the workflow → job → step hierarchy.
//!
//! [`StatusTree`] is an arena that owns every [`RunnableStatus`] node of one
//! run. Parents refer to children by [`StatusId`]; the name index on each node
//! is a non-owning lookup used by template expressions.
//!
//! [`StatusTree::snapshot`] lists children in execution order. Scripts see
//! those lists as Lua sequences, so the first job is `workflow.jobs[1]` there
//! while [`StatusTree::get_child_by_index`] counts from zero.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnableType {
    Workflow,
    Job,
    Step,
}

impl RunnableType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnableType::Workflow => "workflow",
            RunnableType::Job => "job",
            RunnableType::Step => "step",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStart,
    Running,
    Pass,
    Fail,
    Skipped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStart => "not_start",
            Status::Running => "running",
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Pass | Status::Fail | Status::Skipped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a node inside a [`StatusTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusId(usize);

#[derive(Debug, Clone)]
pub struct RunnableStatus {
    name: String,
    kind: RunnableType,
    status: Status,
    children: Vec<StatusId>,
    by_name: IndexMap<String, StatusId>,
    errors: Vec<String>,
    continue_on_err: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunnableStatus {
    fn new(name: &str, kind: RunnableType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            status: Status::NotStart,
            children: Vec::new(),
            by_name: IndexMap::new(),
            errors: Vec::new(),
            continue_on_err: false,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RunnableType {
        self.kind
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn children(&self) -> &[StatusId] {
        &self.children
    }

    pub fn continue_on_err(&self) -> bool {
        self.continue_on_err
    }
}

/// Arena owning the status nodes of one workflow run.
#[derive(Debug, Default)]
pub struct StatusTree {
    nodes: Vec<RunnableStatus>,
}

impl StatusTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, name: &str, kind: RunnableType) -> StatusId {
        self.push(RunnableStatus::new(name, kind))
    }

    /// Create a child under `parent`. Anonymous (empty-named) children are
    /// only reachable by index.
    pub fn add_child(&mut self, parent: StatusId, name: &str, kind: RunnableType) -> StatusId {
        let id = self.push(RunnableStatus::new(name, kind));
        let parent = &mut self.nodes[parent.0];
        parent.children.push(id);
        if !name.is_empty() {
            parent.by_name.insert(name.to_string(), id);
        }
        id
    }

    /// Node behind `id`. Ids are only minted by this tree.
    pub fn node(&self, id: StatusId) -> &RunnableStatus {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn start(&mut self, id: StatusId) {
        if let Some(node) = self.mutable(id, "start") {
            node.status = Status::Running;
            node.started_at = Some(Utc::now());
            debug!(name = %node.name, kind = node.kind.as_str(), "status running");
        }
    }

    /// Mark the node finished: `Pass` without errors, `Fail` otherwise.
    pub fn finish<I, S>(&mut self, id: StatusId, errors: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(node) = self.mutable(id, "finish") {
            node.errors.extend(errors.into_iter().map(Into::into));
            node.status = if node.errors.is_empty() { Status::Pass } else { Status::Fail };
            node.finished_at = Some(Utc::now());
            debug!(name = %node.name, kind = node.kind.as_str(), status = %node.status, "status finished");
        }
    }

    pub fn skipped(&mut self, id: StatusId) {
        if let Some(node) = self.mutable(id, "skip") {
            node.status = Status::Skipped;
            node.finished_at = Some(Utc::now());
        }
    }

    pub fn set_continue_on_err(&mut self, id: StatusId, continue_on_err: bool) {
        self.nodes[id.0].continue_on_err = continue_on_err;
    }

    pub fn status(&self, id: StatusId) -> Status {
        self.nodes[id.0].status
    }

    /// Outcome the subtree resolves to once continue-on-error is applied.
    ///
    /// Never returns a non-terminal status: pending nodes count as `Pass`
    /// unless a descendant already failed.
    pub fn future_status(&self, id: StatusId) -> Status {
        let node = &self.nodes[id.0];
        if node.continue_on_err {
            return Status::Pass;
        }
        if node.status == Status::Fail {
            return Status::Fail;
        }
        if node.children.iter().any(|child| self.future_status(*child) == Status::Fail) {
            Status::Fail
        } else {
            Status::Pass
        }
    }

    /// Own and descendant error messages, depth-first, newline-joined.
    /// Repeated lines are reported once.
    pub fn reason(&self, id: StatusId) -> String {
        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        self.collect_reasons(id, &mut seen, &mut lines);
        lines.join("\n")
    }

    pub fn get_child(&self, id: StatusId, name: &str) -> Option<StatusId> {
        self.nodes[id.0].by_name.get(name).copied()
    }

    pub fn get_child_by_index(&self, id: StatusId, index: usize) -> Option<StatusId> {
        self.nodes[id.0].children.get(index).copied()
    }

    /// JSON view of a subtree, exposed to templates as `workflow` / `job`.
    pub fn snapshot(&self, id: StatusId) -> Value {
        let node = &self.nodes[id.0];
        let children: Vec<Value> = node.children.iter().map(|child| self.snapshot(*child)).collect();
        let by_name: Map<String, Value> = node
            .by_name
            .iter()
            .map(|(name, child)| (name.clone(), self.snapshot(*child)))
            .collect();

        let mut snapshot = json!({
            "name": node.name,
            "type": node.kind.as_str(),
            "status": node.status.as_str(),
            "future_status": self.future_status(id).as_str(),
            "reason": self.reason(id),
            "continue_on_error": node.continue_on_err,
            "started_at": node.started_at.map(|at| at.to_rfc3339()),
            "finished_at": node.finished_at.map(|at| at.to_rfc3339()),
            "children": children,
            "by_name": by_name,
        });
        let alias = match node.kind {
            RunnableType::Workflow => Some("jobs"),
            RunnableType::Job => Some("steps"),
            RunnableType::Step => None,
        };
        if let (Some(alias), Some(object)) = (alias, snapshot.as_object_mut()) {
            let children = object.get("children").cloned().unwrap_or(Value::Null);
            object.insert(alias.to_string(), children);
        }
        snapshot
    }

    fn push(&mut self, node: RunnableStatus) -> StatusId {
        self.nodes.push(node);
        StatusId(self.nodes.len() - 1)
    }

    fn mutable(&mut self, id: StatusId, action: &str) -> Option<&mut RunnableStatus> {
        let node = &mut self.nodes[id.0];
        if node.status.is_terminal() {
            warn!(name = %node.name, status = %node.status, action, "ignoring transition of a finished status node");
            return None;
        }
        Some(node)
    }

    fn collect_reasons(&self, id: StatusId, seen: &mut HashSet<String>, lines: &mut Vec<String>) {
        let node = &self.nodes[id.0];
        for line in node.errors.iter().flat_map(|error| error.lines()) {
            if seen.insert(line.to_string()) {
                lines.push(line.to_string());
            }
        }
        for child in &node.children {
            self.collect_reasons(*child, seen, lines);
        }
    }
}

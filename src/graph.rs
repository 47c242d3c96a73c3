//! The build graph: named targets, their prerequisites, and the commands
//! that produce them.  The graph is constructed up front (by `load` or by
//! API callers) and then driven by the scheduler in `work`, which is the
//! only mutator of target states.

use crate::densemap::{self, DenseMap};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::path::PathBuf;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TargetId(usize);

impl densemap::Index for TargetId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for TargetId {
    fn from(u: usize) -> TargetId {
        TargetId(u)
    }
}

/// Scheduling state of a target.  Terminal states (Done, Failed) are never
/// left once entered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TargetState {
    /// Waiting on at least one prerequisite.
    Pending,
    /// All prerequisites done; eligible for dispatch.
    Ready,
    /// A slot is executing this target's commands.
    Running,
    Done,
    Failed,
}

/// A response file: a file to write before the command runs, whose path the
/// command line references.  Collected and deleted at the end of the run.
#[derive(Debug)]
pub struct RspFile {
    pub path: PathBuf,
    pub content: String,
}

/// One command line of a target.
#[derive(Debug)]
pub struct Command {
    pub cmdline: String,
    pub rspfile: Option<RspFile>,
}

impl Command {
    pub fn new(cmdline: impl Into<String>) -> Self {
        Command {
            cmdline: cmdline.into(),
            rspfile: None,
        }
    }
}

#[derive(Debug)]
pub struct Target {
    pub name: String,
    /// Targets that must be Done before this one may run.
    pub prereqs: Vec<TargetId>,
    /// Reverse edges, filled in as targets are defined.
    pub dependents: Vec<TargetId>,
    pub commands: Vec<Command>,
    state: TargetState,
    /// True once the target appeared as the subject of a definition, not
    /// merely as someone's prerequisite.
    defined: bool,
    /// Whether the current run needs this target.
    wanted: bool,
    /// Prerequisites not yet Done; valid only while wanted.
    pending_prereqs: usize,
}

impl Target {
    fn new(name: String) -> Self {
        Target {
            name,
            prereqs: Vec::new(),
            dependents: Vec::new(),
            commands: Vec::new(),
            state: TargetState::Pending,
            defined: false,
            wanted: false,
            pending_prereqs: 0,
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn wanted(&self) -> bool {
        self.wanted
    }
}

#[derive(Debug)]
pub struct Graph {
    targets: DenseMap<TargetId, Target>,
    by_name: FxHashMap<String, TargetId>,
    /// Ready targets, kept sorted by id so dispatch order matches
    /// declaration order.
    ready: Vec<TargetId>,
    wanted_count: usize,
    finished_count: usize,
    failed_count: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            targets: DenseMap::default(),
            by_name: FxHashMap::default(),
            ready: Vec::new(),
            wanted_count: 0,
            finished_count: 0,
            failed_count: 0,
        }
    }

    /// Intern a target name, creating an undefined placeholder node if it
    /// hasn't been seen yet.
    pub fn target_id(&mut self, name: &str) -> TargetId {
        match self.by_name.get(name) {
            Some(&id) => id,
            None => {
                let id = self.targets.push(Target::new(name.to_owned()));
                self.by_name.insert(name.to_owned(), id);
                id
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<TargetId> {
        self.by_name.get(name).copied()
    }

    pub fn target(&self, id: TargetId) -> &Target {
        &self.targets[id]
    }

    /// Define a target: attach its prerequisites and commands.  Defining the
    /// same name twice is an error.
    pub fn add_target(
        &mut self,
        name: &str,
        prereqs: &[&str],
        commands: Vec<Command>,
    ) -> anyhow::Result<TargetId> {
        let id = self.target_id(name);
        if self.targets[id].defined {
            bail!("duplicate target {:?}", name);
        }
        let prereq_ids: Vec<TargetId> = prereqs.iter().map(|p| self.target_id(p)).collect();
        for &p in &prereq_ids {
            self.targets[p].dependents.push(id);
        }
        let target = &mut self.targets[id];
        target.defined = true;
        target.prereqs = prereq_ids;
        target.commands = commands;
        Ok(id)
    }

    /// Verify every node referenced as a prerequisite was also defined.
    /// We have no notion of "the file already exists", so an undefined
    /// prerequisite can never be brought up to date.
    pub fn validate(&self) -> anyhow::Result<()> {
        for id in self.targets.all_ids() {
            let target = &self.targets[id];
            if !target.defined {
                let needed_by = target
                    .dependents
                    .first()
                    .map(|&d| self.targets[d].name.as_str())
                    .unwrap_or("?");
                bail!(
                    "don't know how to make {:?} (needed by {:?})",
                    target.name,
                    needed_by
                );
            }
        }
        Ok(())
    }

    /// Mark a target and its transitive prerequisites as needed by this run,
    /// computing initial readiness.
    pub fn want(&mut self, id: TargetId) {
        if self.targets[id].wanted {
            return;
        }
        self.targets[id].wanted = true;
        self.wanted_count += 1;
        let prereqs = self.targets[id].prereqs.clone();
        for &p in &prereqs {
            self.want(p);
        }
        let pending = prereqs
            .iter()
            .filter(|&&p| self.targets[p].state != TargetState::Done)
            .count();
        let target = &mut self.targets[id];
        target.pending_prereqs = pending;
        if pending == 0 && target.state == TargetState::Pending {
            target.state = TargetState::Ready;
            self.insert_ready(id);
        }
    }

    fn insert_ready(&mut self, id: TargetId) {
        if let Err(pos) = self.ready.binary_search(&id) {
            self.ready.insert(pos, id);
        }
    }

    fn remove_ready(&mut self, id: TargetId) {
        if let Ok(pos) = self.ready.binary_search(&id) {
            self.ready.remove(pos);
        }
    }

    /// The lowest-id ready target, if any.
    pub fn next_ready(&self) -> Option<TargetId> {
        self.ready.first().copied()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn mark_running(&mut self, id: TargetId) {
        self.remove_ready(id);
        self.targets[id].state = TargetState::Running;
    }

    /// Transition a target to Done and recompute readiness of its wanted
    /// dependents.  No-op if the target already reached a terminal state.
    pub fn mark_done(&mut self, id: TargetId) {
        match self.targets[id].state {
            TargetState::Done | TargetState::Failed => return,
            TargetState::Ready => self.remove_ready(id),
            _ => {}
        }
        self.targets[id].state = TargetState::Done;
        self.finished_count += 1;
        let dependents = self.targets[id].dependents.clone();
        for d in dependents {
            let dep = &mut self.targets[d];
            if !dep.wanted || dep.state != TargetState::Pending {
                continue;
            }
            dep.pending_prereqs -= 1;
            if dep.pending_prereqs == 0 {
                dep.state = TargetState::Ready;
                self.insert_ready(d);
            }
        }
    }

    /// Transition a target to Failed, and fail every wanted target that
    /// transitively depends on it: none of them can ever become ready.
    pub fn mark_failed(&mut self, id: TargetId) {
        match self.targets[id].state {
            TargetState::Done | TargetState::Failed => return,
            TargetState::Ready => self.remove_ready(id),
            _ => {}
        }
        self.targets[id].state = TargetState::Failed;
        self.finished_count += 1;
        self.failed_count += 1;
        let dependents = self.targets[id].dependents.clone();
        for d in dependents {
            let dep = &self.targets[d];
            if dep.wanted && dep.state == TargetState::Pending {
                self.mark_failed(d);
            }
        }
    }

    /// True when every wanted target reached Done or Failed.
    pub fn is_complete(&self) -> bool {
        self.finished_count == self.wanted_count
    }

    pub fn failed_count(&self) -> usize {
        self.failed_count
    }

    /// Name of some wanted target that can never run, for cycle reporting.
    pub fn first_stuck_target(&self) -> Option<&str> {
        for id in self.targets.all_ids() {
            let t = &self.targets[id];
            if t.wanted && t.state == TargetState::Pending {
                return Some(&t.name);
            }
        }
        None
    }
}

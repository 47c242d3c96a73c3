//! The scheduler: walks the dependency graph dispatching ready targets
//! onto a bounded pool of execution slots, and reacts to command
//! completions until the requested targets are built or the run aborts.
//!
//! All scheduler state lives on the thread that calls `run`.  The poll
//! thread only appends output bytes and posts completion events into the
//! channel drained here, so no lock guards any of the dispatch machinery.

use crate::executor::{CommandExecutor, CommandOutcome};
use crate::graph::{Graph, TargetId};
use crate::poller::{CompletionEvent, IoRegistry};
use crate::process::{default_crash_predicate, CrashPredicate};
use crate::progress::Progress;
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

pub struct BuildOptions {
    /// Maximum number of concurrently running commands; clamped to >= 1.
    pub parallelism: usize,
    /// After a failure, keep building targets that don't depend on it.
    pub keep_going: bool,
    /// Working directory for every spawned command.
    pub working_dir: Option<PathBuf>,
    /// Environment for spawned commands; empty means inherit.
    pub environment: SmallMap<String, String>,
    pub crash_predicate: CrashPredicate,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            parallelism: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            keep_going: false,
            working_dir: None,
            environment: SmallMap::new(),
            crash_predicate: default_crash_predicate,
        }
    }
}

pub struct Work<'a> {
    graph: &'a mut Graph,
    progress: &'a mut dyn Progress,
    options: BuildOptions,
    slots: Vec<CommandExecutor>,
    events: mpsc::Receiver<CompletionEvent>,
    /// Response files written during the run, removed at the end.
    temp_files: Vec<PathBuf>,
    /// Set on the first failure when keep_going is off: stop issuing new
    /// work and let running commands drain.
    aborting: bool,
    first_failure: Option<i32>,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a mut Graph,
        progress: &'a mut dyn Progress,
        registry: Arc<dyn IoRegistry>,
        options: BuildOptions,
    ) -> Work<'a> {
        let parallelism = std::cmp::max(1, options.parallelism);
        let (notify, events) = mpsc::channel();
        // One command can never interleave with another, so a single-slot
        // pool streams output through instead of buffering it.
        let streaming = parallelism == 1;
        let slots = (0..parallelism)
            .map(|slot| {
                CommandExecutor::new(
                    slot,
                    registry.clone(),
                    notify.clone(),
                    streaming,
                    options.crash_predicate,
                )
            })
            .collect();
        Work {
            graph,
            progress,
            options,
            slots,
            events,
            temp_files: Vec::new(),
            aborting: false,
            first_failure: None,
        }
    }

    /// Resolve the requested target names and mark everything they need.
    /// An unknown name fails the run here, before any process is spawned.
    pub fn apply(&mut self, targets: &[String]) -> anyhow::Result<()> {
        let mut ids = Vec::new();
        for name in targets {
            let id = self
                .graph
                .lookup(name)
                .ok_or_else(|| anyhow!("unknown target {:?}", name))?;
            ids.push(id);
        }
        for id in ids {
            self.graph.want(id);
        }
        Ok(())
    }

    /// Drive the build to completion.  Returns the overall exit code: 0
    /// only if every requested target reached Done, otherwise the first
    /// failing command's code.
    pub fn run(&mut self) -> anyhow::Result<i32> {
        loop {
            if !self.aborting {
                self.dispatch();
            }
            if self.slots.iter().all(|slot| slot.is_idle()) {
                if !self.aborting && !self.graph.is_complete() {
                    let stuck = self.graph.first_stuck_target().unwrap_or("?").to_owned();
                    self.remove_temp_files();
                    bail!("dependency cycle involving {:?}", stuck);
                }
                break;
            }
            let event = self.events.recv()?;
            self.on_command_finished(event);
        }
        self.remove_temp_files();
        Ok(if self.graph.failed_count() == 0 {
            0
        } else {
            self.first_failure.unwrap_or(1)
        })
    }

    /// Fill idle slots with ready targets, in declaration order, filling
    /// lower-numbered slots first.
    fn dispatch(&mut self) {
        loop {
            let id = match self.graph.next_ready() {
                Some(id) => id,
                None => break,
            };
            if self.graph.target(id).commands.is_empty() {
                // Nothing to run; the target exists to group prerequisites.
                self.graph.mark_done(id);
                continue;
            }
            let slot = match self.slots.iter().position(|slot| slot.is_idle()) {
                Some(slot) => slot,
                None => break,
            };
            self.graph.mark_running(id);
            self.slots[slot].begin_target(id);
            self.start_command(slot);
        }
    }

    /// Launch the current target's next command on `slot`.  The caller has
    /// checked a command remains.  A dispatch failure is a command failure.
    fn start_command(&mut self, slot: usize) {
        let id = self.slots[slot].target().unwrap();
        let cmdline = self.slots[slot].peek_command(self.graph).to_owned();
        self.progress
            .command_started(id, self.graph.target(id), &cmdline);
        let started = self.slots[slot].start_next_command(
            self.graph,
            self.options.working_dir.as_deref(),
            &self.options.environment,
            &mut self.temp_files,
        );
        if let Err(err) = started {
            self.progress.log(&format!("failed to start: {}", err));
            let output = self.slots[slot].take_output();
            self.finish_command(slot, CommandOutcome::FailedToStart, output);
        }
    }

    fn on_command_finished(&mut self, event: CompletionEvent) {
        let slot = event.token;
        if let Some(errno) = event.error {
            self.slots[slot].note_io_error(errno);
        }
        let (outcome, output) = self.slots[slot].on_finished();
        self.finish_command(slot, outcome, output);
    }

    fn finish_command(&mut self, slot: usize, outcome: CommandOutcome, output: Vec<u8>) {
        let id = self.slots[slot].target().unwrap();
        self.progress
            .command_finished(id, self.graph.target(id), outcome, &output);
        if outcome.is_success() {
            if self.slots[slot].has_more_commands(self.graph) {
                self.start_command(slot);
            } else {
                self.graph.mark_done(id);
                self.slots[slot].release();
            }
        } else {
            if self.first_failure.is_none() {
                self.first_failure = Some(outcome.exit_code());
            }
            self.graph.mark_failed(id);
            self.slots[slot].release();
            if !self.options.keep_going {
                self.aborting = true;
            }
        }
    }

    /// Delete response files written during the run.  Best-effort; runs
    /// once on every exit path after all slots have drained.
    pub fn remove_temp_files(&mut self) {
        for path in self.temp_files.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Command, RspFile, TargetState};
    use crate::poller::Poller;
    use crate::progress::Progress;
    use std::path::Path;

    /// Captures progress callbacks for assertions.
    #[derive(Default)]
    struct TestProgress {
        started: Vec<String>,
        finished: Vec<(String, CommandOutcome, Vec<u8>)>,
        logs: Vec<String>,
    }

    impl Progress for TestProgress {
        fn command_started(&mut self, _id: TargetId, target: &crate::graph::Target, _cmdline: &str) {
            self.started.push(target.name.clone());
        }
        fn command_finished(
            &mut self,
            _id: TargetId,
            target: &crate::graph::Target,
            outcome: CommandOutcome,
            output: &[u8],
        ) {
            self.finished
                .push((target.name.clone(), outcome, output.to_vec()));
        }
        fn log(&mut self, msg: &str) {
            self.logs.push(msg.to_owned());
        }
    }

    fn graph_of(decls: &[(&str, &[&str], &[&str])]) -> Graph {
        let mut graph = Graph::new();
        for &(name, prereqs, cmds) in decls {
            let commands = cmds.iter().map(|c| Command::new(*c)).collect();
            graph.add_target(name, prereqs, commands).unwrap();
        }
        graph.validate().unwrap();
        graph
    }

    fn build(
        graph: &mut Graph,
        targets: &[&str],
        options: BuildOptions,
    ) -> (anyhow::Result<i32>, TestProgress) {
        let poller = Arc::new(Poller::new().unwrap());
        let mut progress = TestProgress::default();
        let names: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        let result = {
            let mut work = Work::new(graph, &mut progress, poller, options);
            work.apply(&names).and_then(|_| work.run())
        };
        (result, progress)
    }

    #[test]
    fn single_target_success() {
        let mut graph = graph_of(&[("t1", &[], &["exit 0"])]);
        let (result, _) = build(&mut graph, &["t1"], BuildOptions::default());
        assert_eq!(result.unwrap(), 0);
        let t1 = graph.lookup("t1").unwrap();
        assert_eq!(graph.target(t1).state(), TargetState::Done);
    }

    #[test]
    fn single_target_failure_code() {
        let mut graph = graph_of(&[("t1", &[], &["exit 3"])]);
        let (result, _) = build(&mut graph, &["t1"], BuildOptions::default());
        assert_eq!(result.unwrap(), 3);
        let t1 = graph.lookup("t1").unwrap();
        assert_eq!(graph.target(t1).state(), TargetState::Failed);
    }

    #[test]
    fn failure_stops_unstarted_work() {
        let mut graph = graph_of(&[("bad", &[], &["exit 2"]), ("after", &["bad"], &["true"])]);
        let (result, progress) = build(&mut graph, &["after"], BuildOptions::default());
        assert_eq!(result.unwrap(), 2);
        // Only the failing target ever started.
        assert_eq!(progress.started, vec!["bad"]);
        let after = graph.lookup("after").unwrap();
        assert_eq!(graph.target(after).state(), TargetState::Failed);
    }

    #[test]
    fn prerequisite_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let mut graph = Graph::new();
        graph
            .add_target(
                "t2",
                &[],
                vec![Command::new(format!("echo x >> {}", log.display()))],
            )
            .unwrap();
        graph
            .add_target(
                "t1",
                &["t2"],
                vec![Command::new(format!("echo y >> {}", log.display()))],
            )
            .unwrap();
        graph.validate().unwrap();
        let (result, _) = build(&mut graph, &["t1"], BuildOptions::default());
        assert_eq!(result.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "x\ny\n");
    }

    #[test]
    fn commands_run_in_order_and_stop_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let mut graph = Graph::new();
        graph
            .add_target(
                "t",
                &[],
                vec![
                    Command::new(format!("echo a >> {}", log.display())),
                    Command::new("exit 9"),
                    Command::new(format!("echo never >> {}", log.display())),
                ],
            )
            .unwrap();
        graph.validate().unwrap();
        let (result, _) = build(&mut graph, &["t"], BuildOptions::default());
        assert_eq!(result.unwrap(), 9);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "a\n");
    }

    #[test]
    fn keep_going_builds_independent_branches() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let mut graph = Graph::new();
        graph
            .add_target("bad", &[], vec![Command::new("exit 5")])
            .unwrap();
        graph
            .add_target(
                "good",
                &[],
                vec![Command::new(format!("echo ok >> {}", log.display()))],
            )
            .unwrap();
        graph.validate().unwrap();
        let options = BuildOptions {
            parallelism: 2,
            keep_going: true,
            ..BuildOptions::default()
        };
        let (result, _) = build(&mut graph, &["bad", "good"], options);
        assert_eq!(result.unwrap(), 5);
        let good = graph.lookup("good").unwrap();
        assert_eq!(graph.target(good).state(), TargetState::Done);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "ok\n");
    }

    #[test]
    fn abort_drains_running_but_dispatches_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let mut graph = Graph::new();
        graph
            .add_target("bad", &[], vec![Command::new("exit 7")])
            .unwrap();
        graph
            .add_target(
                "slow",
                &[],
                vec![Command::new(format!(
                    "sleep 0.3 && echo late >> {}",
                    log.display()
                ))],
            )
            .unwrap();
        graph
            .add_target("queued", &[], vec![Command::new("true")])
            .unwrap();
        graph.validate().unwrap();
        let options = BuildOptions {
            parallelism: 2,
            ..BuildOptions::default()
        };
        let (result, _) = build(&mut graph, &["bad", "slow", "queued"], options);
        assert_eq!(result.unwrap(), 7);
        // The in-flight command ran to completion rather than being killed.
        let slow = graph.lookup("slow").unwrap();
        assert_eq!(graph.target(slow).state(), TargetState::Done);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "late\n");
        // The third target was never issued.
        let queued = graph.lookup("queued").unwrap();
        assert_eq!(graph.target(queued).state(), TargetState::Ready);
    }

    #[test]
    fn unknown_target_fails_before_spawning() {
        let mut graph = graph_of(&[("t1", &[], &["true"])]);
        let (result, progress) = build(&mut graph, &["tx"], BuildOptions::default());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown target"), "{}", err);
        assert!(err.contains("tx"), "{}", err);
        assert!(progress.started.is_empty());
    }

    #[test]
    fn command_that_cannot_start_fails_target() {
        let mut graph = graph_of(&[("t", &[], &["true"])]);
        let options = BuildOptions {
            working_dir: Some(PathBuf::from("/no/such/dir")),
            ..BuildOptions::default()
        };
        let (result, progress) = build(&mut graph, &["t"], options);
        assert_eq!(result.unwrap(), 127);
        assert_eq!(progress.finished.len(), 1);
        assert_eq!(progress.finished[0].1, CommandOutcome::FailedToStart);
    }

    #[test]
    fn crash_reported_distinctly() {
        let mut graph = graph_of(&[("t", &[], &["kill -9 $$"])]);
        let (result, progress) = build(&mut graph, &["t"], BuildOptions::default());
        assert_eq!(result.unwrap(), 128 + 9);
        assert!(matches!(
            progress.finished[0].1,
            CommandOutcome::Crashed(_)
        ));
    }

    #[test]
    fn custom_crash_predicate() {
        fn crashy(code: i32) -> bool {
            code == 42
        }
        let mut graph = graph_of(&[("t", &[], &["exit 42"])]);
        let options = BuildOptions {
            crash_predicate: crashy,
            ..BuildOptions::default()
        };
        let (result, progress) = build(&mut graph, &["t"], options);
        assert_eq!(result.unwrap(), 42);
        assert_eq!(progress.finished[0].1, CommandOutcome::Crashed(42));
    }

    #[test]
    fn concurrency_never_exceeds_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let mut graph = Graph::new();
        for name in ["a", "b", "c", "d"] {
            graph
                .add_target(
                    name,
                    &[],
                    vec![Command::new(format!(
                        "echo start >> {log}; sleep 0.2; echo end >> {log}",
                        log = log.display()
                    ))],
                )
                .unwrap();
        }
        graph.validate().unwrap();
        let options = BuildOptions {
            parallelism: 2,
            ..BuildOptions::default()
        };
        let (result, _) = build(&mut graph, &["a", "b", "c", "d"], options);
        assert_eq!(result.unwrap(), 0);
        let text = std::fs::read_to_string(&log).unwrap();
        let mut running: i32 = 0;
        let mut peak = 0;
        for line in text.lines() {
            match line {
                "start" => running += 1,
                "end" => running -= 1,
                other => panic!("unexpected log line {:?}", other),
            }
            peak = std::cmp::max(peak, running);
        }
        assert_eq!(running, 0);
        assert!(peak <= 2, "ran {} commands concurrently", peak);
    }

    #[test]
    fn dependency_cycle_detected() {
        let mut graph = graph_of(&[("a", &["b"], &["true"]), ("b", &["a"], &["true"])]);
        let (result, _) = build(&mut graph, &["a"], BuildOptions::default());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("cycle"), "{}", err);
    }

    #[test]
    fn grouping_target_with_no_commands() {
        let mut graph = graph_of(&[
            ("a", &[], &["true"]),
            ("b", &[], &["true"]),
            ("all", &["a", "b"], &[]),
        ]);
        let (result, _) = build(&mut graph, &["all"], BuildOptions::default());
        assert_eq!(result.unwrap(), 0);
        let all = graph.lookup("all").unwrap();
        assert_eq!(graph.target(all).state(), TargetState::Done);
    }

    #[test]
    fn captured_output_per_command() {
        let mut graph = graph_of(&[("t", &[], &["echo hello"])]);
        let (result, progress) = build(&mut graph, &["t"], BuildOptions::default());
        assert_eq!(result.unwrap(), 0);
        let streamed = progress.finished[0].2.clone();
        // Default parallelism may be 1 (streaming straight to the console);
        // with more than one slot the bytes arrive buffered here.
        if BuildOptions::default().parallelism > 1 {
            assert_eq!(streamed, b"hello\n");
        }
    }

    #[test]
    fn rspfile_written_then_removed() {
        let dir = tempfile::tempdir().unwrap();
        let rsp = dir.path().join("t.rsp");
        let mut graph = Graph::new();
        let mut command = Command::new(format!("cat {}", rsp.display()));
        command.rspfile = Some(RspFile {
            path: rsp.clone(),
            content: "from the rsp file".to_owned(),
        });
        graph.add_target("t", &[], vec![command]).unwrap();
        graph.validate().unwrap();
        let options = BuildOptions {
            parallelism: 2,
            ..BuildOptions::default()
        };
        let (result, progress) = build(&mut graph, &["t"], options);
        assert_eq!(result.unwrap(), 0);
        assert_eq!(progress.finished[0].2, b"from the rsp file");
        // Removed once the run drained.
        assert!(!Path::new(&rsp).exists());
    }
}

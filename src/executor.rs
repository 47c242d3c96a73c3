//! A command execution slot: one reusable pairing of a child process with
//! the build command it currently runs.  The scheduler owns a fixed pool of
//! these, so resource usage is bounded by the parallelism setting no matter
//! how large the graph is.

use crate::graph::{Graph, RspFile, TargetId};
use crate::output::{OutputMode, OutputSink};
use crate::poller::{CompletionEvent, IoRegistry};
use crate::process::{ChildProcess, CrashPredicate};
use crate::smallmap::SmallMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// How one command's execution ended, from the target's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    NonZeroExit(i32),
    Crashed(i32),
    /// The OS could not create the process at all.
    FailedToStart,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success)
    }

    /// The code this outcome contributes to the overall build result.
    /// 127 is reserved for processes that never started.
    pub fn exit_code(&self) -> i32 {
        match *self {
            CommandOutcome::Success => 0,
            CommandOutcome::NonZeroExit(code) => code,
            CommandOutcome::Crashed(code) => code,
            CommandOutcome::FailedToStart => 127,
        }
    }
}

fn write_rspfile(rspfile: &RspFile) -> anyhow::Result<()> {
    if let Some(parent) = rspfile.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&rspfile.path, &rspfile.content)?;
    Ok(())
}

/// One slot of the execution pool.  Identified by its index, which doubles
/// as the multiplexer token for its child's pipe.
pub struct CommandExecutor {
    pub slot: usize,
    child: ChildProcess,
    target: Option<TargetId>,
    /// Index into the current target's command list.
    next_command: usize,
}

impl CommandExecutor {
    pub fn new(
        slot: usize,
        registry: Arc<dyn IoRegistry>,
        notify: Sender<CompletionEvent>,
        streaming: bool,
        crash_predicate: CrashPredicate,
    ) -> Self {
        let sink = Arc::new(OutputSink::new(OutputMode::Buffered));
        if streaming {
            sink.set_mode(OutputMode::Streaming);
        }
        CommandExecutor {
            slot,
            child: ChildProcess::new(registry, slot, sink, notify, crash_predicate),
            target: None,
            next_command: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.target.is_none()
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    /// Begin serving a target; its commands will run in order on this slot.
    pub fn begin_target(&mut self, id: TargetId) {
        self.target = Some(id);
        self.next_command = 0;
    }

    pub fn has_more_commands(&self, graph: &Graph) -> bool {
        let id = self.target.unwrap();
        self.next_command < graph.target(id).commands.len()
    }

    pub fn peek_command<'a>(&self, graph: &'a Graph) -> &'a str {
        let id = self.target.unwrap();
        &graph.target(id).commands[self.next_command].cmdline
    }

    /// Start the next command of the current target.  Non-blocking; the
    /// finish arrives later as a completion event carrying this slot's
    /// index.  Response files written here are recorded in `temp_files`
    /// for end-of-run removal.
    pub fn start_next_command(
        &mut self,
        graph: &Graph,
        cwd: Option<&Path>,
        env: &SmallMap<String, String>,
        temp_files: &mut Vec<PathBuf>,
    ) -> anyhow::Result<()> {
        let id = self.target.unwrap();
        let command = &graph.target(id).commands[self.next_command];
        self.next_command += 1;
        if let Some(rspfile) = &command.rspfile {
            write_rspfile(rspfile)?;
            temp_files.push(rspfile.path.clone());
        }
        self.child.start(&command.cmdline, cwd, env)
    }

    /// Collect the finished child, translating its exit into an outcome and
    /// draining the buffered output.
    pub fn on_finished(&mut self) -> (CommandOutcome, Vec<u8>) {
        let outcome = match self.child.finish() {
            Ok(exit) if exit.crashed => CommandOutcome::Crashed(exit.code),
            Ok(exit) if exit.code != 0 => CommandOutcome::NonZeroExit(exit.code),
            Ok(_) => CommandOutcome::Success,
            Err(err) => {
                // Exit status unobtainable; surface the reason in the
                // command's output and treat it as a crash.
                self.child
                    .sink()
                    .append(format!("pmk: {}\n", err).as_bytes());
                CommandOutcome::Crashed(1)
            }
        };
        let output = self.child.sink().take();
        self.child.reset();
        (outcome, output)
    }

    /// Note a pipe read failure reported by the multiplexer.
    pub fn note_io_error(&self, errno: i32) {
        let err = std::io::Error::from_raw_os_error(errno);
        self.child
            .sink()
            .append(format!("pmk: pipe read: {}\n", err).as_bytes());
    }

    /// Drain any output produced by a command that failed to start.
    pub fn take_output(&mut self) -> Vec<u8> {
        let output = self.child.sink().take();
        self.child.reset();
        output
    }

    /// Stop serving the current target.
    pub fn release(&mut self) {
        self.target = None;
        self.next_command = 0;
    }
}

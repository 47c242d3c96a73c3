//! Build progress reporting, for the purpose of display to the user.

use crate::executor::CommandOutcome;
use crate::graph::{Target, TargetId};
use std::io::Write;

/// Trait for build progress notifications.  Invoked only from the control
/// thread; command output arrives already assembled into one contiguous
/// block per command.
pub trait Progress {
    /// Called when a command is dispatched.
    fn command_started(&mut self, id: TargetId, target: &Target, cmdline: &str);

    /// Called when a command completes, with its captured output.  Empty
    /// output means the command was silent (or streamed directly to the
    /// console in a single-slot run).
    fn command_finished(&mut self, id: TargetId, target: &Target, outcome: CommandOutcome, output: &[u8]);

    /// Log a line of output.
    fn log(&mut self, msg: &str);
}

/// Plain console reporting, one line per event, no overprinting.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print command lines of started programs.
    verbose: bool,

    /// The id of the target last printed, used to avoid printing a target's
    /// name once per command when it has several.
    last_started: Option<TargetId>,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress {
            verbose,
            last_started: None,
        }
    }
}

impl Progress for ConsoleProgress {
    fn command_started(&mut self, id: TargetId, target: &Target, cmdline: &str) {
        if self.verbose {
            self.log(cmdline);
        } else if self.last_started != Some(id) {
            self.log(&target.name);
        }
        self.last_started = Some(id);
    }

    fn command_finished(&mut self, _id: TargetId, target: &Target, outcome: CommandOutcome, output: &[u8]) {
        match outcome {
            CommandOutcome::Success => {}
            CommandOutcome::NonZeroExit(code) => {
                self.log(&format!("failed: {} (exit {})", target.name, code))
            }
            CommandOutcome::Crashed(_) => self.log(&format!("crashed: {}", target.name)),
            CommandOutcome::FailedToStart => {
                self.log(&format!("could not start: {}", target.name))
            }
        }
        if !output.is_empty() {
            let _ = std::io::stdout().write_all(output);
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

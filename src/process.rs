//! Launching one external command and capturing its output.
//!
//! We spawn via posix_spawn with stdout and stderr dup2'd onto a single
//! pipe, so a command's two streams land in one capture channel in the
//! order the child wrote them.  The pipe's read end is handed to the
//! multiplexer; this module never blocks on output I/O.

use crate::output::OutputSink;
use crate::poller::{CompletionEvent, IoRegistry};
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Exit code some runtimes report for catastrophic termination.
pub const CRASH_SENTINEL: i32 = 0xf291;

/// Decides whether an exit code counts as a crash rather than an ordinary
/// failure.  The default covers the sentinel and negative-as-signed codes;
/// callers with other conventions substitute their own.
pub type CrashPredicate = fn(i32) -> bool;

pub fn default_crash_predicate(code: i32) -> bool {
    code == CRASH_SENTINEL || code < 0
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running,
    Finished,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct ExitInfo {
    pub code: i32,
    pub crashed: bool,
}

/// One child process and its output pipe.  Reused across commands: finish()
/// and reset() return it to NotRunning with all handles closed.
pub struct ChildProcess {
    registry: Arc<dyn IoRegistry>,
    /// Identifies this process's pipe in completion events.
    token: usize,
    sink: Arc<OutputSink>,
    notify: Sender<CompletionEvent>,
    crash_predicate: CrashPredicate,
    state: ProcessState,
    pid: Option<libc::pid_t>,
    pipe_read: Option<RawFd>,
    last_exit: ExitInfo,
}

fn check_spawn(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    // posix_spawn-family functions return the error code directly.
    if ret != 0 {
        bail!("{}: {}", func, std::io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_spawn(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }

    fn addchdir(&mut self, dir: &Path) -> anyhow::Result<()> {
        let dir = CString::new(dir.to_string_lossy().into_owned())?;
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_addchdir_np",
                libc::posix_spawn_file_actions_addchdir_np(&mut self.0, dir.as_ptr()),
            )
        }
    }
}

impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Builds the NAME=value environment entries for a child.  An empty caller
/// list means "inherit everything".  A non-empty list is passed through,
/// with PATH and SystemRoot pulled from our own environment when the caller
/// omitted them, preserving executable/library search resolution.
fn make_env_block(env: &SmallMap<String, String>) -> Vec<CString> {
    let mut entries: Vec<(String, String)> = Vec::new();
    if env.is_empty() {
        entries.extend(std::env::vars());
    } else {
        for (k, v) in env.iter() {
            if k.is_empty() {
                continue;
            }
            entries.push((k.clone(), v.clone()));
        }
        for inherited in ["PATH", "SystemRoot"] {
            if env.get(inherited).is_none() {
                if let Ok(value) = std::env::var(inherited) {
                    entries.push((inherited.to_owned(), value));
                }
            }
        }
    }
    entries
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect()
}

impl ChildProcess {
    pub fn new(
        registry: Arc<dyn IoRegistry>,
        token: usize,
        sink: Arc<OutputSink>,
        notify: Sender<CompletionEvent>,
        crash_predicate: CrashPredicate,
    ) -> Self {
        ChildProcess {
            registry,
            token,
            sink,
            notify,
            crash_predicate,
            state: ProcessState::NotRunning,
            pid: None,
            pipe_read: None,
            last_exit: ExitInfo::default(),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn sink(&self) -> &Arc<OutputSink> {
        &self.sink
    }

    /// Launch `cmdline` under the shell.  On success the process is Running
    /// with its pipe registered for async reads; on error it is back to
    /// NotRunning with no handles held, and the caller reports the command
    /// as failed-to-start.
    pub fn start(
        &mut self,
        cmdline: &str,
        cwd: Option<&Path>,
        env: &SmallMap<String, String>,
    ) -> anyhow::Result<()> {
        if self.state != ProcessState::NotRunning {
            bail!("process already in use (state {:?})", self.state);
        }
        if cmdline.is_empty() {
            bail!("empty command line");
        }
        if let Some(dir) = cwd {
            if !dir.is_dir() {
                bail!("invalid working directory {:?}", dir);
            }
        }
        self.state = ProcessState::Starting;
        match self.spawn(cmdline, cwd, env) {
            Ok(()) => {
                self.state = ProcessState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = ProcessState::NotRunning;
                Err(err)
            }
        }
    }

    fn spawn(
        &mut self,
        cmdline: &str,
        cwd: Option<&Path>,
        env: &SmallMap<String, String>,
    ) -> anyhow::Result<()> {
        let env_block = make_env_block(env);
        let mut envp: Vec<*mut libc::c_char> = env_block
            .iter()
            .map(|e| e.as_ptr() as *mut libc::c_char)
            .collect();
        envp.push(std::ptr::null_mut());

        let (pipe_read, pipe_write) = unsafe {
            let mut pipe: [libc::c_int; 2] = [0; 2];
            if libc::pipe(pipe.as_mut_ptr()) < 0 {
                bail!("pipe: {}", std::io::Error::last_os_error());
            }
            (pipe[0], pipe[1])
        };
        let close_both = |a: RawFd, b: RawFd| unsafe {
            libc::close(a);
            libc::close(b);
        };

        let mut actions = match PosixSpawnFileActions::new() {
            Ok(actions) => actions,
            Err(err) => {
                close_both(pipe_read, pipe_write);
                return Err(err);
            }
        };
        let setup = (|| -> anyhow::Result<()> {
            // stdout/stderr => pipe; both pipe ends closed in the child.
            actions.adddup2(pipe_write, 1)?;
            actions.adddup2(pipe_write, 2)?;
            actions.addclose(pipe_read)?;
            actions.addclose(pipe_write)?;
            if let Some(dir) = cwd {
                actions.addchdir(dir)?;
            }
            Ok(())
        })();
        if let Err(err) = setup {
            close_both(pipe_read, pipe_write);
            return Err(err);
        }

        let cmdline_nul = CString::new(cmdline)?;
        let sh = b"/bin/sh\0".as_ptr() as *const libc::c_char;
        let argv: [*mut libc::c_char; 4] = [
            sh as *mut libc::c_char,
            b"-c\0".as_ptr() as *mut libc::c_char,
            cmdline_nul.as_ptr() as *mut libc::c_char,
            std::ptr::null_mut(),
        ];

        let mut pid: libc::pid_t = 0;
        let rc = unsafe {
            libc::posix_spawn(
                &mut pid,
                sh,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr(),
                envp.as_ptr(),
            )
        };
        if rc != 0 {
            close_both(pipe_read, pipe_write);
            bail!("posix_spawn: {}", std::io::Error::from_raw_os_error(rc));
        }

        unsafe {
            libc::close(pipe_write);
            libc::fcntl(pipe_read, libc::F_SETFL, libc::O_NONBLOCK);
        }
        self.pid = Some(pid);
        self.pipe_read = Some(pipe_read);

        // Queue the first asynchronous read.  If this fails we cannot
        // observe the child's output or exit; reap it and report the
        // command as never started.
        if let Err(err) = self.registry.register(
            self.token,
            pipe_read,
            self.sink.clone(),
            self.notify.clone(),
        ) {
            self.pipe_read = None;
            unsafe { libc::close(pipe_read) };
            if let Some(pid) = self.pid.take() {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    libc::waitpid(pid, std::ptr::null_mut(), 0);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Collect the child's exit status and release every handle.  Called
    /// after the multiplexer reports the output pipe closed.  Safe to call
    /// again on an already-finished process: returns the recorded exit.
    pub fn finish(&mut self) -> anyhow::Result<ExitInfo> {
        if self.state != ProcessState::Running {
            return Ok(self.last_exit);
        }
        // The poll thread already dropped the watch at EOF; this covers the
        // error paths where it did not.
        self.registry.unregister(self.token);
        if let Some(fd) = self.pipe_read.take() {
            unsafe { libc::close(fd) };
        }
        let mut exit = ExitInfo::default();
        if let Some(pid) = self.pid.take() {
            let mut status: libc::c_int = 0;
            loop {
                let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
                if rc >= 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                self.state = ProcessState::Finished;
                bail!("waitpid: {}", err);
            }
            if libc::WIFSIGNALED(status) {
                exit.code = 128 + libc::WTERMSIG(status);
                exit.crashed = true;
            } else if libc::WIFEXITED(status) {
                exit.code = libc::WEXITSTATUS(status);
                exit.crashed = (self.crash_predicate)(exit.code);
            }
        }
        self.state = ProcessState::Finished;
        self.last_exit = exit;
        Ok(exit)
    }

    /// Return to NotRunning so the next command can reuse this process slot.
    pub fn reset(&mut self) {
        self.state = ProcessState::NotRunning;
        self.last_exit = ExitInfo::default();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Normal paths finish() first; this is the crash/abort path.
        self.registry.unregister(self.token);
        if let Some(fd) = self.pipe_read.take() {
            unsafe { libc::close(fd) };
        }
        if let Some(pid) = self.pid.take() {
            unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        }
    }
}

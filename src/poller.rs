//! The I/O multiplexer: one thread watches the output pipes of every
//! running command, so hundreds of concurrent children share a single OS
//! thread instead of needing one reader thread each.
//!
//! Pipes register with the poller when a command starts; the poll thread
//! reads whatever becomes available into the owning command's output sink,
//! and on EOF or error posts a completion event back to the control thread
//! over a channel.  The poll thread never touches scheduler state.

use crate::output::OutputSink;
use dashmap::DashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// Posted to the control thread when a watched pipe reaches EOF or fails.
/// `token` identifies the slot that owns the pipe.
#[derive(Debug)]
pub struct CompletionEvent {
    pub token: usize,
    /// errno of a failed read, or None for a clean EOF.
    pub error: Option<i32>,
}

/// Registration interface of the multiplexer.  A trait so process tests can
/// substitute a fake that delivers completions by hand.
pub trait IoRegistry: Send + Sync {
    /// Start watching `fd` on behalf of `token`.  Bytes read are appended to
    /// `sink`; EOF/error produces one `CompletionEvent` on `notify` and ends
    /// the watch.
    fn register(
        &self,
        token: usize,
        fd: RawFd,
        sink: Arc<OutputSink>,
        notify: Sender<CompletionEvent>,
    ) -> anyhow::Result<()>;

    /// Stop watching on behalf of `token`.  Unregistering a token with no
    /// active watch is a no-op: completion and teardown race benignly.
    fn unregister(&self, token: usize);
}

struct Watch {
    fd: RawFd,
    sink: Arc<OutputSink>,
    notify: Sender<CompletionEvent>,
}

pub struct Poller {
    watches: Arc<DashMap<usize, Watch>>,
    shutdown: Arc<AtomicBool>,
    /// Write end of the self-pipe; poking it makes the poll thread rebuild
    /// its fd set (or notice shutdown).
    wake_fd: RawFd,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl Poller {
    pub fn new() -> anyhow::Result<Poller> {
        let mut pipe: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(pipe.as_mut_ptr()) } < 0 {
            anyhow::bail!("pipe: {}", std::io::Error::last_os_error());
        }
        let (wake_read, wake_write) = (pipe[0], pipe[1]);
        unsafe {
            libc::fcntl(wake_read, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(wake_write, libc::F_SETFL, libc::O_NONBLOCK);
        }

        let watches: Arc<DashMap<usize, Watch>> = Arc::new(DashMap::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = std::thread::spawn({
            let watches = watches.clone();
            let shutdown = shutdown.clone();
            move || {
                poll_loop(&watches, &shutdown, wake_read);
                unsafe { libc::close(wake_read) };
            }
        });

        Ok(Poller {
            watches,
            shutdown,
            wake_fd: wake_write,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn wake(&self) {
        let buf = [1u8];
        unsafe { libc::write(self.wake_fd, buf.as_ptr() as *const libc::c_void, 1) };
    }
}

impl IoRegistry for Poller {
    fn register(
        &self,
        token: usize,
        fd: RawFd,
        sink: Arc<OutputSink>,
        notify: Sender<CompletionEvent>,
    ) -> anyhow::Result<()> {
        self.watches.insert(token, Watch { fd, sink, notify });
        self.wake();
        Ok(())
    }

    fn unregister(&self, token: usize) {
        self.watches.remove(&token);
        self.wake();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        unsafe { libc::close(self.wake_fd) };
    }
}

/// What a single read attempt on a watched pipe produced.
enum ReadStep {
    Data,
    Eof,
    Err(i32),
    /// Unregistered between poll and read.
    Gone,
}

fn poll_loop(watches: &DashMap<usize, Watch>, shutdown: &AtomicBool, wake_read: RawFd) {
    let mut buf = [0u8; 65536];
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        // Snapshot the registry into a pollfd set.  Index 0 is the wake pipe.
        let mut fds = vec![libc::pollfd {
            fd: wake_read,
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut tokens = vec![usize::MAX];
        for entry in watches.iter() {
            fds.push(libc::pollfd {
                fd: entry.value().fd,
                events: libc::POLLIN,
                revents: 0,
            });
            tokens.push(*entry.key());
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            if last_errno() == libc::EINTR {
                continue;
            }
            return;
        }

        if fds[0].revents != 0 {
            // Drain the wake pipe; the next iteration rebuilds the set.
            while unsafe { libc::read(wake_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
                > 0
            {}
        }

        for i in 1..fds.len() {
            if fds[i].revents == 0 {
                continue;
            }
            let token = tokens[i];
            let step = match watches.get(&token) {
                None => ReadStep::Gone,
                Some(watch) => {
                    let n = unsafe {
                        libc::read(watch.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n > 0 {
                        watch.sink.append(&buf[..n as usize]);
                        ReadStep::Data
                    } else if n == 0 {
                        ReadStep::Eof
                    } else {
                        match last_errno() {
                            libc::EAGAIN | libc::EINTR => ReadStep::Data,
                            errno => ReadStep::Err(errno),
                        }
                    }
                }
            };
            match step {
                ReadStep::Data | ReadStep::Gone => {}
                ReadStep::Eof => complete(watches, token, None),
                ReadStep::Err(errno) => complete(watches, token, Some(errno)),
            }
        }
    }
}

fn complete(watches: &DashMap<usize, Watch>, token: usize, error: Option<i32>) {
    if let Some((_, watch)) = watches.remove(&token) {
        // Send failure means the control thread is gone; nothing to do.
        let _ = watch.notify.send(CompletionEvent { token, error });
    }
}

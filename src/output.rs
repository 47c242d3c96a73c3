//! Per-command console output collection.
//!
//! Each execution slot owns one `OutputSink`.  While several commands run
//! concurrently, their bytes are accumulated here and printed as one block
//! when the command finishes, so output of different commands never
//! interleaves.  A single-slot run instead streams bytes through as they
//! arrive.

use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OutputMode {
    /// Hold bytes until the command completes.
    Buffered,
    /// Write bytes to the console as they arrive.  Only safe when no other
    /// command can be running concurrently.
    Streaming,
}

struct Inner {
    mode: OutputMode,
    buf: Vec<u8>,
    console: Box<dyn Write + Send>,
}

/// Monitor guarding a command's pending output and the buffered/streaming
/// mode flag.  Appends arrive on the I/O thread; mode switches and drains
/// happen on the control thread.
pub struct OutputSink(Mutex<Inner>);

impl OutputSink {
    pub fn new(mode: OutputMode) -> Self {
        Self::with_console(mode, Box::new(std::io::stdout()))
    }

    /// Like `new`, but writing to the given console.  Used by tests.
    pub fn with_console(mode: OutputMode, console: Box<dyn Write + Send>) -> Self {
        OutputSink(Mutex::new(Inner {
            mode,
            buf: Vec::new(),
            console,
        }))
    }

    pub fn mode(&self) -> OutputMode {
        self.0.lock().unwrap().mode
    }

    /// Switch output modes.  Switching to streaming flushes any held bytes
    /// before the lock is released, so an append racing the switch cannot
    /// be reordered around them.
    pub fn set_mode(&self, mode: OutputMode) {
        let mut inner = self.0.lock().unwrap();
        if inner.mode == mode {
            return;
        }
        inner.mode = mode;
        if mode == OutputMode::Streaming && !inner.buf.is_empty() {
            let buf = std::mem::take(&mut inner.buf);
            let _ = inner.console.write_all(&buf);
            let _ = inner.console.flush();
        }
    }

    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.0.lock().unwrap();
        match inner.mode {
            OutputMode::Buffered => inner.buf.extend_from_slice(bytes),
            OutputMode::Streaming => {
                let _ = inner.console.write_all(bytes);
                let _ = inner.console.flush();
            }
        }
    }

    /// Drain the accumulated bytes.  A second call returns nothing, which is
    /// what makes the finish path safe to run twice.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().unwrap().buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A Write that appends into a shared buffer.
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sink_and_console(mode: OutputMode) -> (OutputSink, Arc<Mutex<Vec<u8>>>) {
        let console = Arc::new(Mutex::new(Vec::new()));
        let sink = OutputSink::with_console(mode, Box::new(SharedBuf(console.clone())));
        (sink, console)
    }

    #[test]
    fn buffered_holds_until_take() {
        let (sink, console) = sink_and_console(OutputMode::Buffered);
        sink.append(b"hello ");
        sink.append(b"world");
        assert!(console.lock().unwrap().is_empty());
        assert_eq!(sink.take(), b"hello world");
        // Drained: taking again yields nothing.
        assert_eq!(sink.take(), b"");
    }

    #[test]
    fn streaming_writes_through() {
        let (sink, console) = sink_and_console(OutputMode::Streaming);
        sink.append(b"now");
        assert_eq!(&*console.lock().unwrap(), b"now");
        assert_eq!(sink.take(), b"");
    }

    #[test]
    fn switch_to_streaming_flushes() {
        let (sink, console) = sink_and_console(OutputMode::Buffered);
        sink.append(b"held");
        sink.set_mode(OutputMode::Streaming);
        assert_eq!(&*console.lock().unwrap(), b"held");
        sink.append(b"+live");
        assert_eq!(&*console.lock().unwrap(), b"held+live");
    }
}

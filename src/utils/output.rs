/// Bounded collection of merged renderer output
///
/// stdout and stderr of the renderer are pointed at the same pipe so the
/// captured text keeps the renderer's own interleaving. The collector
/// drains the pipe until EOF and keeps at most `limit` bytes (the tail,
/// where error summaries land); excess is read and discarded so the child
/// never stalls on a full pipe.
///
/// Every complete line is also offered to an optional line filter while it
/// streams past, so lines of interest are caught even when the tail limit
/// later drops them from the retained text.
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{FromRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Flagged lines kept per run; later matches are only counted
pub const MAX_FLAGGED_LINES: usize = 64;
/// Longer lines are cut to this many bytes before filtering
pub const MAX_LINE_BYTES: usize = 16 * 1024;

type LineFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Integrity of the captured stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputIntegrity {
    Complete,
    /// Older output was dropped to stay within the limit
    TruncatedByLimit,
    /// Pipe still open when collection gave up (a descendant kept it)
    CollectionTimeout,
    ReadError,
}

impl fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::CollectionTimeout => write!(f, "collection_timeout"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
        }
    }
}

/// Captured output of one renderer run
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub integrity: OutputIntegrity,
    /// Total bytes read from the pipe, including discarded ones
    pub total_bytes: u64,
    /// Lines accepted by the line filter, in stream order
    pub flagged_lines: Vec<String>,
    /// Flagged lines beyond `MAX_FLAGGED_LINES`
    pub flagged_overflow: u64,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Create one pipe whose write end backs both stdout and stderr
pub fn merged_pipe() -> io::Result<(File, Stdio, Stdio)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 just returned two fresh descriptors that nothing else owns.
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let write_dup = write_end.try_clone()?;
    Ok((
        File::from(read_end),
        Stdio::from(write_end),
        Stdio::from(write_dup),
    ))
}

#[derive(Debug, Default)]
struct SharedBuffer {
    bytes: Vec<u8>,
    total: u64,
    truncated: bool,
    flagged: Vec<String>,
    flagged_overflow: u64,
}

/// Splits the byte stream into lines across read boundaries
#[derive(Default)]
struct LineScanner {
    partial: Vec<u8>,
    /// Current line already exceeded `MAX_LINE_BYTES`
    overlong: bool,
}

impl LineScanner {
    fn feed(&mut self, chunk: &[u8], filter: &LineFilter, buf: &mut SharedBuffer) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.push_bytes(&rest[..pos]);
            self.finish_line(filter, buf);
            rest = &rest[pos + 1..];
        }
        self.push_bytes(rest);
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let room = MAX_LINE_BYTES.saturating_sub(self.partial.len());
        if bytes.len() > room {
            self.overlong = true;
        }
        self.partial.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Evaluate whatever is buffered as one line
    fn finish_line(&mut self, filter: &LineFilter, buf: &mut SharedBuffer) {
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let line = String::from_utf8_lossy(&self.partial);
        if filter(&line) {
            if buf.flagged.len() < MAX_FLAGGED_LINES {
                buf.flagged.push(line.into_owned());
            } else {
                buf.flagged_overflow += 1;
            }
        }
        if self.overlong {
            log::debug!("Output line longer than {} bytes was cut", MAX_LINE_BYTES);
        }
        self.partial.clear();
        self.overlong = false;
    }

    fn flush(&mut self, filter: &LineFilter, buf: &mut SharedBuffer) {
        if !self.partial.is_empty() {
            self.finish_line(filter, buf);
        }
    }
}

/// Output collector with bounded collection
#[derive(Clone)]
pub struct OutputCollector {
    limit: usize,
    filter: Option<LineFilter>,
}

impl fmt::Debug for OutputCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCollector")
            .field("limit", &self.limit)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Collection running on a background thread
pub struct PendingOutput {
    buffer: Arc<Mutex<SharedBuffer>>,
    done: Receiver<io::Result<()>>,
}

impl OutputCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            filter: None,
        }
    }

    /// Record every full line for which `filter` returns true
    pub fn flag_lines<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Start draining `reader` on a background thread
    pub fn start(&self, reader: File) -> PendingOutput {
        let buffer = Arc::new(Mutex::new(SharedBuffer::default()));
        let (tx, rx) = bounded(1);
        let limit = self.limit;
        let filter = self.filter.clone();
        let shared = Arc::clone(&buffer);

        thread::spawn(move || {
            let result = collect_stream(reader, limit, filter.as_ref(), &shared);
            let _ = tx.send(result);
        });

        PendingOutput { buffer, done: rx }
    }
}

impl PendingOutput {
    /// Wait up to `timeout` for EOF and return what was captured
    pub fn finish(self, timeout: Duration) -> CapturedOutput {
        let outcome = self.done.recv_timeout(timeout);
        let buf = match self.buffer.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };

        let integrity = match outcome {
            Ok(Ok(())) if buf.truncated => OutputIntegrity::TruncatedByLimit,
            Ok(Ok(())) => OutputIntegrity::Complete,
            Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => OutputIntegrity::ReadError,
            Err(RecvTimeoutError::Timeout) => OutputIntegrity::CollectionTimeout,
        };

        CapturedOutput {
            bytes: buf.bytes.clone(),
            integrity,
            total_bytes: buf.total,
            flagged_lines: buf.flagged.clone(),
            flagged_overflow: buf.flagged_overflow,
        }
    }
}

fn lock_buffer(shared: &Mutex<SharedBuffer>) -> MutexGuard<'_, SharedBuffer> {
    match shared.lock() {
        Ok(buf) => buf,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drain a stream to EOF, keeping the last `limit` bytes and flagging
/// lines from the whole stream
fn collect_stream<R: Read>(
    mut stream: R,
    limit: usize,
    filter: Option<&LineFilter>,
    shared: &Mutex<SharedBuffer>,
) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    let mut scanner = LineScanner::default();
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                if let Some(filter) = filter {
                    scanner.flush(filter, &mut lock_buffer(shared));
                }
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if let Some(filter) = filter {
                    scanner.flush(filter, &mut lock_buffer(shared));
                }
                return Err(e);
            }
        };

        let mut buf = lock_buffer(shared);
        if let Some(filter) = filter {
            scanner.feed(&chunk[..n], filter, &mut buf);
        }
        buf.total += n as u64;
        buf.bytes.extend_from_slice(&chunk[..n]);
        if buf.bytes.len() > limit {
            let excess = buf.bytes.len() - limit;
            buf.bytes.drain(..excess);
            buf.truncated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn merges_stdout_and_stderr() {
        let (reader, out, err) = merged_pipe().unwrap();
        let pending = OutputCollector::new(1024).start(reader);

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("echo to-stdout; echo to-stderr 1>&2")
            .stdout(out)
            .stderr(err);
        let status = cmd.status().unwrap();
        drop(cmd);
        assert!(status.success());

        let captured = pending.finish(Duration::from_secs(5));
        let text = captured.text();
        assert_eq!(captured.integrity, OutputIntegrity::Complete);
        assert!(text.contains("to-stdout"));
        assert!(text.contains("to-stderr"));
    }

    #[test]
    fn keeps_tail_when_over_limit() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| format!("{}\n", i).into_bytes()).collect();
        let shared = Mutex::new(SharedBuffer::default());
        collect_stream(&data[..], 64, None, &shared).unwrap();

        let buf = shared.into_inner().unwrap();
        assert_eq!(buf.bytes.len(), 64);
        assert!(buf.truncated);
        assert_eq!(buf.total, data.len() as u64);
        assert!(String::from_utf8_lossy(&buf.bytes).ends_with("9999\n"));
    }

    /// Reader that hands out the data in fixed-size pieces
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(self.data.len()).min(out.len());
            out[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn error_filter() -> LineFilter {
        Arc::new(|line: &str| line.contains("Error:"))
    }

    #[test]
    fn flags_lines_that_fell_out_of_the_tail() {
        let mut data = b"Error: Cannot read file\r\n".to_vec();
        for i in 0..2000 {
            data.extend_from_slice(format!("Fra:1 Sample {}/2000\n", i).as_bytes());
        }
        let shared = Mutex::new(SharedBuffer::default());
        collect_stream(&data[..], 256, Some(&error_filter()), &shared).unwrap();

        let buf = shared.into_inner().unwrap();
        assert!(buf.truncated);
        assert!(!String::from_utf8_lossy(&buf.bytes).contains("Error:"));
        assert_eq!(buf.flagged, vec!["Error: Cannot read file".to_string()]);
    }

    #[test]
    fn flags_lines_split_across_reads() {
        let data = b"progress\nErr";
        let tail = b"or: split marker\nno newline Error: at end";
        let joined = [&data[..], &tail[..]].concat();
        let shared = Mutex::new(SharedBuffer::default());
        let reader = Trickle {
            data: &joined,
            step: 3,
        };
        collect_stream(reader, 1024, Some(&error_filter()), &shared).unwrap();

        let buf = shared.into_inner().unwrap();
        assert_eq!(
            buf.flagged,
            vec![
                "Error: split marker".to_string(),
                "no newline Error: at end".to_string()
            ]
        );
    }

    #[test]
    fn flagged_lines_are_bounded() {
        let data: Vec<u8> = (0..MAX_FLAGGED_LINES + 10)
            .flat_map(|i| format!("Error: {}\n", i).into_bytes())
            .collect();
        let shared = Mutex::new(SharedBuffer::default());
        collect_stream(&data[..], 1 << 20, Some(&error_filter()), &shared).unwrap();

        let buf = shared.into_inner().unwrap();
        assert_eq!(buf.flagged.len(), MAX_FLAGGED_LINES);
        assert_eq!(buf.flagged_overflow, 10);
        assert_eq!(buf.flagged[0], "Error: 0");
    }

    #[test]
    fn open_pipe_reports_collection_timeout() {
        let (reader, out, _err) = merged_pipe().unwrap();
        let pending = OutputCollector::new(1024).start(reader);

        let captured = pending.finish(Duration::from_millis(50));
        assert_eq!(captured.integrity, OutputIntegrity::CollectionTimeout);
        drop(out);
    }

    #[test]
    fn integrity_display() {
        assert_eq!(OutputIntegrity::Complete.to_string(), "complete");
        assert_eq!(OutputIntegrity::TruncatedByLimit.to_string(), "truncated_by_limit");
        assert_eq!(OutputIntegrity::CollectionTimeout.to_string(), "collection_timeout");
    }
}

//! Byte sources feeding the reassembler.
//!
//! - [`ProcessSource`]: a live `powermetrics` child. stdout is drained by a
//!   reader thread into a channel; the collection loop waits on the channel
//!   with a bounded timeout, so a silent child never turns into a busy loop.
//! - [`FileSource`]: a recorded powermetrics output file, read to the end.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Name of the measurement binary.
pub const POWERMETRICS: &str = "powermetrics";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("read failed: {0}")]
    Read(#[from] io::Error),
    #[error("powermetrics output closed unexpectedly")]
    PrematureClose,
}

/// Result of one poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    Data(Vec<u8>),
    /// Nothing arrived within the wait bound.
    Idle,
    /// No more data will arrive.
    Closed,
}

pub trait ChunkSource {
    fn next_chunk(&mut self) -> Result<Poll, SourceError>;

    /// Whether the source ends by itself (offline input).
    fn is_finite(&self) -> bool;
}

/// Builds the powermetrics invocation for `interval`.
pub fn powermetrics_command(interval: Duration) -> Command {
    let mut cmd = Command::new(POWERMETRICS);
    cmd.args(["--show-all", "-i"])
        .arg(interval.as_millis().to_string())
        .args(["-f", "plist"]);
    cmd
}

pub struct ProcessSource {
    child: Child,
    rx: Receiver<io::Result<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    wait: Duration,
}

impl ProcessSource {
    /// Starts powermetrics sampling every `interval`; polls wait at most
    /// `2 × interval`.
    pub fn spawn(interval: Duration) -> Result<Self, SourceError> {
        Self::spawn_command(powermetrics_command(interval), interval.saturating_mul(2))
    }

    pub fn spawn_command(mut cmd: Command, wait: Duration) -> Result<Self, SourceError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: program.clone(),
                source,
            })?;

        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(SourceError::Spawn {
                program,
                source: io::Error::other("stdout not captured"),
            });
        };

        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("powermetrics-reader".into())
            .spawn(move || {
                let mut buf = vec![0u8; READ_BUF_SIZE];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(Ok(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            })
            .map_err(SourceError::Read)?;

        debug!(program, pid = child.id(), "started measurement process");
        Ok(Self {
            child,
            rx,
            reader: Some(reader),
            wait: wait.max(Duration::from_millis(1)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl ChunkSource for ProcessSource {
    fn next_chunk(&mut self) -> Result<Poll, SourceError> {
        match self.rx.recv_timeout(self.wait) {
            Ok(Ok(data)) => Ok(Poll::Data(data)),
            Ok(Err(e)) => Err(SourceError::Read(e)),
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Poll::Closed),
        }
    }

    fn is_finite(&self) -> bool {
        false
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "measurement process already gone");
        }
        match self.child.wait() {
            Ok(status) => debug!(%status, "measurement process exited"),
            Err(e) => warn!(error = %e, "cannot reap measurement process"),
        }
        // stdout is closed now, so the reader thread is about to finish
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Offline input read from any reader, typically a recorded file.
pub struct FileSource<R = File> {
    reader: R,
    buf: Vec<u8>,
}

impl FileSource<File> {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read> FileSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; READ_BUF_SIZE],
        }
    }
}

impl<R: Read> ChunkSource for FileSource<R> {
    fn next_chunk(&mut self) -> Result<Poll, SourceError> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => return Ok(Poll::Closed),
                Ok(n) => return Ok(Poll::Data(self.buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SourceError::Read(e)),
            }
        }
    }

    fn is_finite(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn powermetrics_is_invoked_with_plist_output() {
        let cmd = powermetrics_command(Duration::from_millis(5000));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), POWERMETRICS);
        assert_eq!(args, ["--show-all", "-i", "5000", "-f", "plist"]);
    }

    #[test]
    fn file_source_reads_to_end() {
        let mut source = FileSource::new(&b"<?xml?>\n</plist>\n"[..]);
        assert!(source.is_finite());
        assert_eq!(
            source.next_chunk().unwrap(),
            Poll::Data(b"<?xml?>\n</plist>\n".to_vec())
        );
        assert_eq!(source.next_chunk().unwrap(), Poll::Closed);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(&dir.path().join("nope.plist")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn process_source_delivers_output_then_closes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'hello\\n'"]);
        let mut source = ProcessSource::spawn_command(cmd, Duration::from_secs(5)).unwrap();
        assert!(!source.is_finite());

        let mut data = Vec::new();
        loop {
            match source.next_chunk().unwrap() {
                Poll::Data(chunk) => data.extend(chunk),
                Poll::Idle => continue,
                Poll::Closed => break,
            }
        }
        assert_eq!(data, b"hello\n");
    }

    #[cfg(unix)]
    #[test]
    fn silent_process_times_out_instead_of_spinning() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut source = ProcessSource::spawn_command(cmd, Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        assert_eq!(source.next_chunk().unwrap(), Poll::Idle);
        assert!(started.elapsed() >= Duration::from_millis(200));
        // dropping kills the child
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let cmd = Command::new("powerhog-definitely-not-a-program");
        assert!(matches!(
            ProcessSource::spawn_command(cmd, Duration::from_secs(1)),
            Err(SourceError::Spawn { .. })
        ));
    }
}

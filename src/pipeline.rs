// src/pipeline.rs

//! Streaming decode pipeline
//!
//! Turns a pull-based stream of encoded section bytes into a pull-based
//! stream of decoded bytes by running them through one or two external
//! filter processes (decrypt, then decompress). The filters are chained
//! process-to-process; this side only feeds the head of the chain and
//! drains its tail.
//!
//! Two worker threads own the filter pipes:
//!
//! ```text
//!  source --read--> caller --input channel--> feeder --> [decrypt | decompress] --> drainer --output channel--> caller
//! ```
//!
//! Both channels are bounded, so a slow filter pushes back on the caller and
//! the caller keeps draining output while input is still queued. The caller
//! waits on the output channel with a short poll interval and declares the
//! transfer stalled when neither direction moves for the configured timeout.
//! A failed pipe operation in either worker is reported as a fault, which
//! kills the filters.

use crate::compression::CompressionFormat;
use crate::hash::RollingDigest;
use crate::manifest::ImageSection;
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Encryption scheme number for AES-256-CTR with the device key file
pub const ENCRYPTION_AES_CTR: i64 = 1;

/// Default encoded chunk size pushed into the filters
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CHANNEL_DEPTH: usize = 32;
const DRAIN_BUFFER: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unsupported encryption scheme {0}")]
    UnsupportedEncryption(i64),

    #[error("unsupported compression scheme {0:?}")]
    UnsupportedCompression(String),

    #[error("section {0} is neither compressed nor encrypted")]
    NothingToDecode(String),

    #[error("failed to start filter {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("filter {program} exited with status {code}")]
    FilterFailed { program: String, code: i32 },

    #[error("filter {program} did not exit")]
    FilterHung { program: String },

    #[error("decoded {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("transfer stalled for {secs} seconds")]
    Stalled { secs: u64 },

    #[error("exceptional condition on filter pipe: {0}")]
    Exceptional(String),

    #[error("failed to read bundle stream: {0}")]
    Source(io::Error),

    #[error("failed to write decoded data: {0}")]
    Destination(io::Error),
}

/// One external filter invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    program: PathBuf,
    args: Vec<String>,
}

impl FilterProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn name(&self) -> String {
        self.program.display().to_string()
    }

    fn spawn(&self, stdin: Stdio) -> Result<Child, PipelineError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                program: self.name(),
                source,
            })
    }
}

/// Filters and limits shared by every pipeline of a run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub decrypt: FilterProgram,
    pub decompress: FilterProgram,
    pub chunk_size: usize,
    pub stall_timeout: Duration,
    /// Accumulate a SHA-256 of decoded output
    pub digest: bool,
}

impl PipelineOptions {
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_digest(mut self, digest: bool) -> Self {
        self.digest = digest;
        self
    }
}

enum PipeEvent {
    Data(Vec<u8>),
    Eof,
    Fault(String),
}

struct RunningFilter {
    name: String,
    child: Child,
}

/// Decoded view of one encoded section
pub struct DecodePipeline<R> {
    source: R,
    source_done: bool,
    chunk_size: usize,
    stall_timeout: Duration,
    staged: Option<Vec<u8>>,
    input: Option<flume::Sender<Vec<u8>>>,
    output: flume::Receiver<PipeEvent>,
    filters: Vec<RunningFilter>,
    workers: Vec<JoinHandle<()>>,
    pending: Vec<u8>,
    pending_pos: usize,
    digest: Option<RollingDigest>,
    produced: u64,
    expected_len: u64,
    finished: bool,
}

impl<R: Read> DecodePipeline<R> {
    /// Start the filters for `section`
    pub fn new(source: R, section: &ImageSection, options: &PipelineOptions) -> Result<Self, PipelineError> {
        let programs = filter_chain(section, options)?;

        let mut filters: Vec<RunningFilter> = Vec::with_capacity(programs.len());
        let mut head: Option<ChildStdin> = None;
        let mut tail: Option<ChildStdout> = None;

        for program in programs {
            let stdin = match tail.take() {
                Some(upstream) => Stdio::from(upstream),
                None => Stdio::piped(),
            };
            let mut child = match program.spawn(stdin) {
                Ok(child) => child,
                Err(e) => {
                    kill_all(&mut filters);
                    return Err(e);
                }
            };
            if head.is_none() {
                head = child.stdin.take();
            }
            tail = child.stdout.take();
            debug!("Started filter {} for {}", program.name(), section.kind);
            filters.push(RunningFilter {
                name: program.name(),
                child,
            });
        }

        let (Some(head), Some(tail)) = (head, tail) else {
            kill_all(&mut filters);
            return Err(PipelineError::Exceptional(
                "filter pipes were not created".to_string(),
            ));
        };

        let (input_tx, input_rx) = flume::bounded::<Vec<u8>>(CHANNEL_DEPTH);
        let (output_tx, output_rx) = flume::bounded::<PipeEvent>(CHANNEL_DEPTH);

        let workers = vec![
            spawn_feeder(head, input_rx, output_tx.clone()),
            spawn_drainer(tail, output_tx),
        ];

        Ok(Self {
            source,
            source_done: false,
            chunk_size: options.chunk_size.max(1),
            stall_timeout: options.stall_timeout,
            staged: None,
            input: Some(input_tx),
            output: output_rx,
            filters,
            workers,
            pending: Vec::new(),
            pending_pos: 0,
            digest: options.digest.then(RollingDigest::new),
            produced: 0,
            expected_len: section.bytes,
            finished: false,
        })
    }

    /// Decoded bytes produced so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Digest of decoded output, when enabled
    pub fn digest(&self) -> Option<&RollingDigest> {
        self.digest.as_ref()
    }

    /// Read decoded bytes; 0 means the section is complete
    pub fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending_pos >= self.pending.len() {
            match self.next_chunk()? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }

    /// Copy the whole decoded section to `dest` in `block`-sized writes
    ///
    /// `progress` receives the running byte count after every block.
    pub fn copy_to<W, F>(&mut self, dest: &mut W, block: usize, mut progress: F) -> Result<u64, PipelineError>
    where
        W: Write + ?Sized,
        F: FnMut(u64),
    {
        let mut buf = vec![0u8; block.max(1)];
        let mut written = 0u64;

        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.read_decoded(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            dest.write_all(&buf[..filled])
                .map_err(PipelineError::Destination)?;
            written += filled as u64;
            progress(written);
            if filled < buf.len() {
                break;
            }
        }

        dest.flush().map_err(PipelineError::Destination)?;
        Ok(written)
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        if self.finished {
            return Ok(None);
        }

        let mut last_movement = Instant::now();
        loop {
            if self.pump_input()? {
                last_movement = Instant::now();
            }

            match self.output.recv_timeout(POLL_INTERVAL) {
                Ok(PipeEvent::Data(chunk)) => {
                    let produced = self.produced + chunk.len() as u64;
                    if produced > self.expected_len {
                        warn!(
                            "Filter output passed declared length {} of section",
                            self.expected_len
                        );
                        self.abort();
                        return Err(PipelineError::LengthMismatch {
                            expected: self.expected_len,
                            actual: produced,
                        });
                    }
                    self.produced = produced;
                    if let Some(digest) = self.digest.as_mut() {
                        digest.update(&chunk);
                    }
                    return Ok(Some(chunk));
                }
                Ok(PipeEvent::Eof) => {
                    self.finish()?;
                    return Ok(None);
                }
                Ok(PipeEvent::Fault(message)) => {
                    warn!("Filter pipe fault: {}", message);
                    self.abort();
                    return Err(PipelineError::Exceptional(message));
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    if last_movement.elapsed() >= self.stall_timeout {
                        warn!("No filter progress for {:?}", self.stall_timeout);
                        self.abort();
                        return Err(PipelineError::Stalled {
                            secs: self.stall_timeout.as_secs(),
                        });
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    self.abort();
                    return Err(PipelineError::Exceptional(
                        "filter workers exited without reporting".to_string(),
                    ));
                }
            }
        }
    }

    /// Move encoded chunks into the input channel until it is full
    ///
    /// Returns whether anything moved.
    fn pump_input(&mut self) -> Result<bool, PipelineError> {
        let mut moved = false;

        while let Some(input) = self.input.as_ref() {
            let chunk = match self.staged.take() {
                Some(chunk) => chunk,
                None if self.source_done => break,
                None => {
                    let mut buf = vec![0u8; self.chunk_size];
                    let n = match self.source.read(&mut buf) {
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                            self.abort();
                            return Err(PipelineError::Stalled {
                                secs: self.stall_timeout.as_secs(),
                            });
                        }
                        Err(e) => {
                            self.abort();
                            return Err(PipelineError::Source(e));
                        }
                    };
                    if n == 0 {
                        // Closing the channel closes the head filter's stdin
                        self.source_done = true;
                        self.input = None;
                        moved = true;
                        break;
                    }
                    buf.truncate(n);
                    buf
                }
            };

            match input.try_send(chunk) {
                Ok(()) => moved = true,
                Err(flume::TrySendError::Full(chunk)) => {
                    self.staged = Some(chunk);
                    break;
                }
                // Feeder is gone; its fault is already queued on the output side
                Err(flume::TrySendError::Disconnected(_)) => {
                    self.input = None;
                    break;
                }
            }
        }

        Ok(moved)
    }

    /// Reap filters after the tail reported end of stream
    fn finish(&mut self) -> Result<(), PipelineError> {
        self.finished = true;
        self.input = None;

        for filter in &mut self.filters {
            let status = filter
                .child
                .wait_timeout(self.stall_timeout)
                .map_err(|e| PipelineError::Exceptional(e.to_string()))?;
            match status {
                Some(status) if status.success() => {}
                Some(status) => {
                    return Err(PipelineError::FilterFailed {
                        program: filter.name.clone(),
                        code: status.code().unwrap_or(-1),
                    });
                }
                None => {
                    let _ = filter.child.kill();
                    return Err(PipelineError::FilterHung {
                        program: filter.name.clone(),
                    });
                }
            }
        }
        self.filters.clear();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        if self.produced != self.expected_len {
            return Err(PipelineError::LengthMismatch {
                expected: self.expected_len,
                actual: self.produced,
            });
        }
        debug!("Decoded {} bytes", self.produced);
        Ok(())
    }

    fn abort(&mut self) {
        self.finished = true;
        self.input = None;
        kill_all(&mut self.filters);
    }
}

impl<R: Read> Read for DecodePipeline<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_decoded(buf).map_err(|e| match e {
            PipelineError::Stalled { .. } => io::Error::new(ErrorKind::TimedOut, e),
            other => io::Error::other(other),
        })
    }
}

impl<R> Drop for DecodePipeline<R> {
    fn drop(&mut self) {
        self.input = None;
        kill_all(&mut self.filters);
    }
}

/// Filters required for a section, in chain order
fn filter_chain(section: &ImageSection, options: &PipelineOptions) -> Result<Vec<FilterProgram>, PipelineError> {
    let mut chain = Vec::with_capacity(2);

    match section.encryption {
        0 => {}
        ENCRYPTION_AES_CTR => chain.push(options.decrypt.clone()),
        other => return Err(PipelineError::UnsupportedEncryption(other)),
    }

    match CompressionFormat::from_manifest(&section.compression) {
        Ok(CompressionFormat::None) => {}
        Ok(CompressionFormat::Gzip) => chain.push(options.decompress.clone()),
        Ok(CompressionFormat::Xz) | Err(_) => {
            return Err(PipelineError::UnsupportedCompression(
                section.compression.clone(),
            ));
        }
    }

    if chain.is_empty() {
        return Err(PipelineError::NothingToDecode(section.kind.to_string()));
    }
    Ok(chain)
}

fn kill_all(filters: &mut Vec<RunningFilter>) {
    for mut filter in filters.drain(..) {
        if let Ok(None) = filter.child.try_wait() {
            debug!("Killing filter {}", filter.name);
            let _ = filter.child.kill();
        }
        let _ = filter.child.wait();
    }
}

fn spawn_feeder(
    mut stdin: ChildStdin,
    input: flume::Receiver<Vec<u8>>,
    events: flume::Sender<PipeEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for chunk in input.iter() {
            if let Err(e) = stdin.write_all(&chunk) {
                let _ = events.send(PipeEvent::Fault(format!("writing to filter: {}", e)));
                return;
            }
        }
    })
}

fn spawn_drainer(mut stdout: ChildStdout, events: flume::Sender<PipeEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; DRAIN_BUFFER];
        loop {
            let event = match stdout.read(&mut buf) {
                Ok(0) => PipeEvent::Eof,
                Ok(n) => PipeEvent::Data(buf[..n].to_vec()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => PipeEvent::Fault(format!("reading from filter: {}", e)),
            };
            let last = !matches!(event, PipeEvent::Data(_));
            if events.send(event).is_err() || last {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_hex;
    use crate::manifest::SectionKind;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn section(bytes: u64, compression: &str, encryption: i64) -> ImageSection {
        ImageSection {
            kind: SectionKind::System,
            bytes,
            compression: compression.to_string(),
            encryption,
            sha256: None,
            base_version: None,
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            decrypt: FilterProgram::new("cat"),
            decompress: FilterProgram::new("gzip").with_args(["-dc"]),
            chunk_size: 512,
            stall_timeout: Duration::from_secs(10),
            digest: true,
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_construction_rejects_unsupported_schemes() {
        let opts = options();
        assert!(matches!(
            DecodePipeline::new(&b""[..], &section(0, "gz", 2), &opts),
            Err(PipelineError::UnsupportedEncryption(2))
        ));
        assert!(matches!(
            DecodePipeline::new(&b""[..], &section(0, "bz2", 0), &opts),
            Err(PipelineError::UnsupportedCompression(c)) if c == "bz2"
        ));
        assert!(matches!(
            DecodePipeline::new(&b""[..], &section(0, "xz", 0), &opts),
            Err(PipelineError::UnsupportedCompression(_))
        ));
        assert!(matches!(
            DecodePipeline::new(&b""[..], &section(0, "", 0), &opts),
            Err(PipelineError::NothingToDecode(_))
        ));
    }

    #[test]
    fn test_chained_filters_round_trip() {
        let data = plaintext(300_000);
        let encoded = gzip(&data);
        let mut pipeline =
            DecodePipeline::new(encoded.as_slice(), &section(data.len() as u64, "gz", 1), &options())
                .unwrap();

        let mut out = Vec::new();
        let mut reports = Vec::new();
        let written = pipeline
            .copy_to(&mut out, 64 * 1024, |n| reports.push(n))
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(pipeline.produced(), data.len() as u64);
        assert_eq!(
            pipeline.digest().unwrap().hex_digest(),
            sha256_hex(&data)
        );
        assert!(reports.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(reports.last().copied(), Some(data.len() as u64));
    }

    #[test]
    fn test_read_trait() {
        let encoded = gzip(b"hello pipeline");
        let mut pipeline =
            DecodePipeline::new(encoded.as_slice(), &section(14, "gz", 0), &options()).unwrap();
        let mut out = String::new();
        pipeline.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello pipeline");
    }

    #[test]
    fn test_length_mismatch() {
        let encoded = gzip(b"short");
        let mut pipeline =
            DecodePipeline::new(encoded.as_slice(), &section(100, "gz", 0), &options()).unwrap();
        let err = pipeline.copy_to(&mut io::sink(), 16, |_| {}).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::LengthMismatch {
                expected: 100,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_overlong_output_never_reaches_destination() {
        let encoded = gzip(&vec![0u8; 5_000_000]);
        let mut pipeline =
            DecodePipeline::new(encoded.as_slice(), &section(10, "gz", 0), &options()).unwrap();

        let mut out = Vec::new();
        let err = pipeline.copy_to(&mut out, 4096, |_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::LengthMismatch { expected: 10, actual } if actual > 10));
        assert!(out.len() <= 10);
        assert!(pipeline.produced() <= 10);
    }

    #[test]
    fn test_corrupt_input_fails_filter() {
        let mut pipeline = DecodePipeline::new(
            &b"definitely not gzip data"[..],
            &section(10, "gz", 0),
            &options(),
        )
        .unwrap();
        let err = pipeline.copy_to(&mut io::sink(), 16, |_| {}).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::FilterFailed { .. } | PipelineError::Exceptional(_)
        ));
    }

    #[test]
    fn test_silent_filter_stalls() {
        let mut opts = options().with_stall_timeout(Duration::from_millis(300));
        opts.decompress = FilterProgram::new("sleep").with_args(["5"]);

        let encoded = gzip(b"never decoded");
        let mut pipeline =
            DecodePipeline::new(encoded.as_slice(), &section(13, "gz", 0), &opts).unwrap();

        let started = Instant::now();
        let err = pipeline.copy_to(&mut io::sink(), 16, |_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::Stalled { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_closed_filter_input_is_exceptional() {
        let mut opts = options();
        opts.decompress = FilterProgram::new("sh").with_args(["-c", "exec 0<&-; exec sleep 5"]);

        let encoded = plaintext(256 * 1024);
        let mut pipeline =
            DecodePipeline::new(encoded.as_slice(), &section(1, "gz", 0), &opts).unwrap();

        let started = Instant::now();
        let err = pipeline.copy_to(&mut io::sink(), 16, |_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::Exceptional(_)));
        assert!(started.elapsed() < opts.stall_timeout);
    }

    #[test]
    fn test_source_timeout_is_stall() {
        struct TimingOut;
        impl Read for TimingOut {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::TimedOut, "read timed out"))
            }
        }

        let mut pipeline = DecodePipeline::new(TimingOut, &section(1, "gz", 0), &options()).unwrap();
        let err = pipeline.copy_to(&mut io::sink(), 16, |_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::Stalled { .. }));
    }
}

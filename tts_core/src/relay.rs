//! External encoder relay.
//!
//! PCM goes into an encoder subprocess (ffmpeg by default) on its stdin and
//! the encoded stream comes back on its stdout. Feeding and draining run
//! concurrently: the feeder is its own task writing stdin in bounded chunks,
//! while the drainer forwards each stdout chunk to the client as soon as it
//! arrives. Writing all input before reading any output would deadlock once
//! either pipe buffer fills. stderr is drained by a third task so a chatty
//! encoder can't block on it either.
//!
//! Every exit path reaps the child: success waits for it, any failure kills
//! it first. The `Child` is also `kill_on_drop`, covering a dropped future.

use std::{pin::Pin, process::ExitStatus, process::Stdio, time::Duration};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::transport::Transport;

/// Bytes written to the encoder per write call.
pub const FEED_CHUNK: usize = 8 * 1024;
/// Bytes read from the encoder per read call.
pub const DRAIN_CHUNK: usize = 4 * 1024;
/// Cap on retained encoder diagnostics.
const STDERR_LIMIT: usize = 16 * 1024;
/// How long to wait for stderr to close after the encoder is gone.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Raw `s16le` mono PCM, produced incrementally.
pub type PcmStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, PipelineError>> + Send>>;

/// Command-line contract of the external encoder. `{sample_rate}` and
/// `{bitrate}` in `args` are substituted at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSpec {
    pub program: String,
    pub args: Vec<String>,
    pub bitrate: String,
    pub content_type: String,
}

impl EncoderSpec {
    /// ffmpeg reading mono s16le on stdin and writing MP3 on stdout.
    pub fn mp3(program: impl Into<String>, bitrate: impl Into<String>) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "s16le",
            "-ar",
            "{sample_rate}",
            "-ac",
            "1",
            "-i",
            "pipe:0",
            "-f",
            "mp3",
            "-b:a",
            "{bitrate}",
            "pipe:1",
        ];
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            bitrate: bitrate.into(),
            content_type: "audio/mpeg".to_string(),
        }
    }

    pub fn render_args(&self, sample_rate: u32) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{sample_rate}", &sample_rate.to_string())
                    .replace("{bitrate}", &self.bitrate)
            })
            .collect()
    }
}

/// Byte counts for one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub chunks_out: usize,
}

/// A running encoder with its three pipes. Used for exactly one request.
#[derive(Debug)]
pub struct EncoderProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

enum FeedError {
    Source(PipelineError),
    Pipe(std::io::Error),
}

/// Aborts the task when dropped.
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl EncoderProcess {
    pub fn spawn(spec: &EncoderSpec, sample_rate: u32) -> Result<Self, PipelineError> {
        let mut child = Command::new(&spec.program)
            .args(spec.render_args(sample_rate))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::encoding(format!("failed to start {}: {e}", spec.program)))?;

        let missing = || PipelineError::encoding("encoder pipes unavailable");
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;
        debug!(program = %spec.program, pid = ?child.id(), "Encoder started");

        Ok(Self {
            program: spec.program.clone(),
            child,
            stdin: Some(stdin),
            stdout,
            stderr: Some(stderr),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Feed `pcm` through the encoder and forward its output to `transport`.
    ///
    /// Completes only after the input is exhausted, the output has hit EOF,
    /// and the process has exited. `limit` bounds the whole run.
    pub async fn relay<T: Transport + ?Sized>(
        mut self,
        pcm: PcmStream,
        transport: &mut T,
        limit: Duration,
    ) -> Result<RelayStats, PipelineError> {
        let (stdin, stderr) = match (self.stdin.take(), self.stderr.take()) {
            (Some(stdin), Some(stderr)) => (stdin, stderr),
            _ => return Err(PipelineError::encoding("encoder already relayed")),
        };
        let mut feeder = TaskGuard(tokio::spawn(feed(stdin, pcm)));
        let diagnostics = TaskGuard(tokio::spawn(collect_stderr(stderr)));

        let run = async {
            let stats = drain(&mut self.stdout, &mut feeder.0, transport).await?;
            let status = self
                .child
                .wait()
                .await
                .map_err(|e| PipelineError::encoding(format!("waiting for encoder: {e}")))?;
            Ok::<(RelayStats, ExitStatus), PipelineError>((stats, status))
        };

        let outcome = tokio::time::timeout(limit, run).await;
        match outcome {
            Ok(Ok((stats, status))) if status.success() => {
                debug!(
                    program = %self.program,
                    bytes_in = stats.bytes_in,
                    bytes_out = stats.bytes_out,
                    "Encoder finished"
                );
                Ok(stats)
            }
            Ok(Ok((_, status))) => Err(PipelineError::Encoding {
                message: format!("{} exited with {status}", self.program),
                stderr: join_stderr(diagnostics).await,
            }),
            Ok(Err(err)) => {
                self.terminate().await;
                match err {
                    PipelineError::Encoding { message, .. } => Err(PipelineError::Encoding {
                        message,
                        stderr: join_stderr(diagnostics).await,
                    }),
                    other => Err(other),
                }
            }
            Err(_) => {
                warn!(program = %self.program, "Encoder timed out after {:?}", limit);
                self.terminate().await;
                Err(PipelineError::Timeout {
                    stage: "encoder",
                    after: limit,
                })
            }
        }
    }

    /// Kill and reap.
    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("encoder already gone: {e}");
        }
        match self.child.wait().await {
            Ok(status) => debug!(program = %self.program, %status, "Encoder reaped"),
            Err(e) => warn!(program = %self.program, "Failed to reap encoder: {e}"),
        }
    }
}

/// Write PCM to the encoder, then close its stdin to signal end of input.
async fn feed(mut stdin: ChildStdin, mut pcm: PcmStream) -> Result<u64, FeedError> {
    let mut written = 0u64;
    while let Some(chunk) = pcm.next().await {
        let chunk = chunk.map_err(FeedError::Source)?;
        for piece in chunk.chunks(FEED_CHUNK) {
            stdin.write_all(piece).await.map_err(FeedError::Pipe)?;
            written += piece.len() as u64;
        }
    }
    stdin.shutdown().await.map_err(FeedError::Pipe)?;
    drop(stdin);
    Ok(written)
}

/// Forward encoder output until EOF while watching the feeder.
async fn drain<T: Transport + ?Sized>(
    stdout: &mut ChildStdout,
    feeder: &mut JoinHandle<Result<u64, FeedError>>,
    transport: &mut T,
) -> Result<RelayStats, PipelineError> {
    let mut stats = RelayStats::default();
    let mut buf = vec![0u8; DRAIN_CHUNK];
    let mut fed: Option<u64> = None;

    loop {
        tokio::select! {
            joined = &mut *feeder, if fed.is_none() => {
                fed = Some(feeder_outcome(joined)?);
            }
            read = stdout.read(&mut buf) => {
                let n = read
                    .map_err(|e| PipelineError::encoding(format!("reading encoder output: {e}")))?;
                if n == 0 {
                    break;
                }
                transport.send(buf[..n].to_vec()).await?;
                stats.bytes_out += n as u64;
                stats.chunks_out += 1;
            }
        }
    }

    stats.bytes_in = match fed {
        Some(n) => n,
        None => feeder_outcome((&mut *feeder).await)?,
    };
    Ok(stats)
}

fn feeder_outcome(joined: Result<Result<u64, FeedError>, JoinError>) -> Result<u64, PipelineError> {
    match joined {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(FeedError::Source(err))) => Err(err),
        Ok(Err(FeedError::Pipe(e))) => Err(PipelineError::encoding(format!(
            "writing encoder input: {e}"
        ))),
        Err(e) => Err(PipelineError::encoding(format!("feeder task failed: {e}"))),
    }
}

async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

async fn join_stderr(mut task: TaskGuard<String>) -> String {
    match tokio::time::timeout(STDERR_GRACE, &mut task.0).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

//! Byte-oriented client transports.
//!
//! A write failure on any transport means the client is gone and surfaces
//! as [`PipelineError::ClientDisconnected`].

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::PipelineError;

pub type ChunkResult = Result<Vec<u8>, PipelineError>;

#[async_trait]
pub trait Transport: Send {
    /// Deliver one chunk and flush it.
    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), PipelineError>;

    /// End the stream abnormally after output has started.
    async fn abort(&mut self, _err: &PipelineError) {}
}

/// Bounded channel feeding an HTTP response body. A full channel applies
/// backpressure to the pipeline; a dropped receiver is a disconnect.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ChunkResult>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChunkResult>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), PipelineError> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| PipelineError::ClientDisconnected)
    }

    async fn abort(&mut self, err: &PipelineError) {
        // The body stream yields the error, which makes the server reset the
        // connection instead of finishing the response cleanly.
        let _ = self.tx.send(Err(err.clone())).await;
    }
}

/// Any async writer, e.g. a socket half.
#[derive(Debug)]
pub struct WriterTransport<W> {
    writer: W,
}

impl<W> WriterTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for WriterTransport<W> {
    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), PipelineError> {
        let result = async {
            self.writer.write_all(&chunk).await?;
            self.writer.flush().await
        }
        .await;
        result.map_err(|e| {
            tracing::debug!("transport write failed: {e}");
            PipelineError::ClientDisconnected
        })
    }
}

/// Collects everything in memory for buffered delivery.
#[derive(Debug, Default)]
pub struct BufferTransport {
    pub bytes: Vec<u8>,
}

#[async_trait]
impl Transport for BufferTransport {
    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), PipelineError> {
        self.bytes.extend_from_slice(&chunk);
        Ok(())
    }
}

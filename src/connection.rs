//! The single active peer stream.
//!
//! [`PeerLink`] owns the split halves of one stream through two
//! spawned tasks: a reader that pipes raw bytes toward the session
//! loop, and a writer that performs staged writes with a per-stage
//! deadline and reports each completion with its stage tag. The link
//! never interprets payload content — it only timeslices I/O for
//! whichever state machine owns the in-flight transfer.
//!
//! Events carry the link's generation so the session can discard
//! completions that belong to a torn-down connection.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::LinkError;
use crate::state::SendStage;

/// Read chunk size for the reader task.
const READ_CHUNK: usize = 8 * 1024;

/// Capacity of the staged-write queue. Only one stage is ever in
/// flight per direction, so this never fills in practice.
const WRITE_QUEUE: usize = 8;

// ── Events ───────────────────────────────────────────────────────

/// Something the link's tasks observed.
#[derive(Debug)]
pub enum LinkEvent {
    /// Raw bytes arrived from the peer.
    Bytes(Bytes),
    /// A staged write completed; resume the send machine at `stage`.
    StageWritten(SendStage),
    /// The stream dropped: clean EOF (`None`) or an error.
    Closed(Option<LinkError>),
}

/// A [`LinkEvent`] tagged with the generation of the link that
/// produced it.
#[derive(Debug)]
pub struct TaggedLinkEvent {
    pub generation: u64,
    pub event: LinkEvent,
}

/// One staged write: the bytes for a single wire field plus the
/// deadline the write must meet.
#[derive(Debug)]
struct WriteJob {
    stage: SendStage,
    bytes: Bytes,
    timeout: Duration,
}

// ── PeerLink ─────────────────────────────────────────────────────

/// Handle to the one allowed peer connection.
///
/// Dropping the handle aborts both I/O tasks, which closes the
/// underlying stream.
#[derive(Debug)]
pub struct PeerLink {
    generation: u64,
    write_tx: mpsc::Sender<WriteJob>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    /// Take ownership of an established stream and start its I/O
    /// tasks. Events flow into `events` tagged with `generation`.
    pub fn new<S>(stream: S, generation: u64, events: mpsc::Sender<TaggedLinkEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (write_tx, mut write_rx) = mpsc::channel::<WriteJob>(WRITE_QUEUE);

        // Reader task: peer -> session loop. Raw bytes only; the
        // session decodes them when a receive is armed.
        let read_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => {
                        let _ = read_events
                            .send(TaggedLinkEvent {
                                generation,
                                event: LinkEvent::Closed(None),
                            })
                            .await;
                        break;
                    }
                    Ok(n) => {
                        let bytes = Bytes::copy_from_slice(&chunk[..n]);
                        if read_events
                            .send(TaggedLinkEvent {
                                generation,
                                event: LinkEvent::Bytes(bytes),
                            })
                            .await
                            .is_err()
                        {
                            // Session loop went away; stop reading.
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "peer read error");
                        let _ = read_events
                            .send(TaggedLinkEvent {
                                generation,
                                event: LinkEvent::Closed(Some(e.into())),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        // Writer task: staged writes with per-stage deadlines. A
        // missed deadline or write error tears the link down.
        let writer = tokio::spawn(async move {
            while let Some(job) = write_rx.recv().await {
                let outcome =
                    tokio::time::timeout(job.timeout, write_half.write_all(&job.bytes)).await;
                let event = match outcome {
                    Ok(Ok(())) => LinkEvent::StageWritten(job.stage),
                    Ok(Err(e)) => {
                        debug!(error = %e, "peer write error");
                        LinkEvent::Closed(Some(e.into()))
                    }
                    Err(_) => LinkEvent::Closed(Some(LinkError::Timeout(job.timeout))),
                };
                let closed = matches!(event, LinkEvent::Closed(_));
                if events
                    .send(TaggedLinkEvent { generation, event })
                    .await
                    .is_err()
                    || closed
                {
                    break;
                }
            }
        });

        Self {
            generation,
            write_tx,
            reader,
            writer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue one staged write. Non-blocking: called from inside the
    /// session loop, which must never wait on its own I/O tasks.
    pub fn queue_write(
        &self,
        stage: SendStage,
        bytes: Bytes,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        self.write_tx
            .try_send(WriteJob {
                stage,
                bytes,
                timeout,
            })
            .map_err(|_| LinkError::ChannelClosed)
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

//! Reusable framed stream with per-message acknowledgements.
//!
//! Frames are length-delimited. Inbound frames consisting of the single
//! ACK byte are consumed at this layer; every other inbound frame is
//! acknowledged before being surfaced. A stream closes on oversized
//! input, I/O failure, or an idle write timeout.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::Instant,
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, trace};

use crate::{wire::ACK_BYTE, P2pError};

/// Per-stream limits.
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    /// Largest accepted frame, inbound or outbound.
    pub max_message_size: usize,
    /// Outbound FIFO bound; senders see `QueueFull` beyond it.
    pub outbound_queue: usize,
    /// Close after this long without an outbound write.
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_message_size: 6 * 1024 * 1024,
            outbound_queue: 100,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Sending side of a spawned stream. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    out_tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    max_message_size: usize,
    label: String,
}

impl StreamHandle {
    /// Queues a frame. Fails fast when the queue is full, the frame is
    /// oversized, or the stream is gone.
    pub fn try_send(&self, bytes: Bytes) -> Result<(), P2pError> {
        if bytes.len() > self.max_message_size {
            return Err(P2pError::Oversized {
                got: bytes.len(),
                cap: self.max_message_size,
            });
        }
        self.out_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => P2pError::QueueFull(self.label.clone()),
            mpsc::error::TrySendError::Closed(_) => P2pError::StreamClosed(self.label.clone()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves when the stream task has ended.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Entry point for wrapping raw bidirectional I/O.
#[derive(Debug)]
pub struct FramedStream;

impl FramedStream {
    /// Spawns the stream task. Returns the send handle and the inbound
    /// message receiver; ACK frames never appear on the receiver.
    pub fn spawn<T>(
        io: T,
        config: StreamConfig,
        label: String,
    ) -> (StreamHandle, mpsc::Receiver<Bytes>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue);
        let (in_tx, in_rx) = mpsc::channel(config.outbound_queue);
        let closed = CancellationToken::new();

        let handle = StreamHandle {
            out_tx,
            closed: closed.clone(),
            max_message_size: config.max_message_size,
            label: label.clone(),
        };

        tokio::spawn(stream_task(io, config, label, out_rx, in_tx, closed));

        (handle, in_rx)
    }
}

async fn stream_task<T>(
    io: T,
    config: StreamConfig,
    label: String,
    mut out_rx: mpsc::Receiver<Bytes>,
    in_tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config.max_message_size)
        .new_codec();
    let mut framed = Framed::new(io, codec);
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            outbound = out_rx.recv() => {
                let Some(bytes) = outbound else { break };
                if framed.send(bytes).await.is_err() {
                    debug!(stream = %label, "outbound write failed");
                    break;
                }
                last_write = Instant::now();
            }

            inbound = framed.next() => {
                match inbound {
                    Some(Ok(frame)) => {
                        let frame = frame.freeze();
                        if frame.len() == 1 && frame[0] == ACK_BYTE {
                            // ACK signal, consumed here.
                            trace!(stream = %label, "ack");
                            continue;
                        }
                        // Acknowledge every non-ACK inbound message.
                        if framed.send(Bytes::from_static(&[ACK_BYTE])).await.is_err() {
                            break;
                        }
                        last_write = Instant::now();
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Oversized frames land here as codec errors.
                        debug!(stream = %label, %e, "closing on inbound error");
                        break;
                    }
                    None => break,
                }
            }

            _ = tokio::time::sleep_until(last_write + config.idle_timeout) => {
                debug!(stream = %label, "idle timeout");
                break;
            }
        }
    }

    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StreamConfig {
        StreamConfig {
            max_message_size: 64 * 1024,
            outbound_queue: 100,
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_message_roundtrip_with_ack() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_handle, mut a_rx) = FramedStream::spawn(a, test_config(), "a".into());
        let (_b_handle, mut b_rx) = FramedStream::spawn(b, test_config(), "b".into());

        a_handle.try_send(Bytes::from_static(b"hello")).unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(&got[..], b"hello");

        // The ACK b sent back is consumed by a's stream task, never
        // surfaced as an inbound message.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
        assert!(!a_handle.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_outbound_rejected() {
        let (a, _b) = tokio::io::duplex(1024);
        let (handle, _rx) = FramedStream::spawn(a, test_config(), "a".into());

        let big = Bytes::from(vec![0u8; 64 * 1024 + 1]);
        assert!(matches!(
            handle.try_send(big),
            Err(P2pError::Oversized { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_inbound_closes_stream() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        // Receiver caps frames at 1 KiB; sender allows much larger.
        let small = StreamConfig {
            max_message_size: 1024,
            ..test_config()
        };
        let (recv_handle, _rx) = FramedStream::spawn(a, small, "recv".into());
        let (send_handle, _rx2) = FramedStream::spawn(b, test_config(), "send".into());

        send_handle.try_send(Bytes::from(vec![0u8; 8192])).unwrap();

        recv_handle.wait_closed().await;
        assert!(recv_handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes() {
        let (a, _b) = tokio::io::duplex(1024);
        let (handle, _rx) = FramedStream::spawn(a, test_config(), "a".into());

        tokio::time::advance(Duration::from_secs(31)).await;
        handle.wait_closed().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_outbound_queue_bound() {
        // Tiny pipe nobody reads: the writer stalls and the queue fills.
        let (a, _b) = tokio::io::duplex(64);
        let (handle, _rx) = FramedStream::spawn(a, test_config(), "a".into());

        let payload = Bytes::from(vec![0u8; 1024]);
        let mut full = false;
        for _ in 0..150 {
            match handle.try_send(payload.clone()) {
                Ok(()) => {}
                Err(P2pError::QueueFull(_)) => {
                    full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(full, "queue never filled");
    }
}

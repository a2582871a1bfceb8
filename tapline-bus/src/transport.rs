//! Byte stream ⇄ typed tap channels.
//!
//! ```text
//!             ┌── read pump ──  TapCodec::decode ──► Inbound  (mpsc<Event>)
//! TcpStream ──┤
//!             └── write pump ◄─ TapCodec::encode ─── Outbound (mpsc<Arc<Event>>)
//! ```
//!
//! The two pumps never wait on each other. Closure propagates through the
//! channels: end of stream or a decode failure closes `Inbound`; dropping
//! every `Outbound` sender flushes and shuts down the write half; dropping
//! `Inbound` stops the read pump.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::protocol::{Event, ProtocolError};

/// Taps decoded from the peer.
pub type Inbound = mpsc::Receiver<Event>;
/// Taps queued for the peer.
pub type Outbound = mpsc::Sender<Arc<Event>>;

/// Default cap on a single encoded tap.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

/// Streaming JSON codec: one object per tap.
///
/// Decoding relies only on JSON's own structure, so peers may separate
/// objects with any whitespace (or none). Encoding appends `\n`.
#[derive(Debug, Clone)]
pub struct TapCodec {
    max_frame_bytes: usize,
}

impl Default for TapCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl TapCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for TapCodec {
    type Item = Event;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, TransportError> {
        let blank = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(blank);
        if src.is_empty() {
            return Ok(None);
        }

        // A partial object is parsed again from its start on every read, so
        // the cost of one frame grows with the square of its size. The frame
        // cap bounds it.
        let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Event>();
        match stream.next() {
            Some(Ok(event)) => {
                let used = stream.byte_offset();
                if used > self.max_frame_bytes {
                    return Err(TransportError::FrameTooLarge(self.max_frame_bytes));
                }
                src.advance(used);
                Ok(Some(event))
            }
            // Partial object: wait for more bytes.
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_frame_bytes {
                    Err(TransportError::FrameTooLarge(self.max_frame_bytes))
                } else {
                    Ok(None)
                }
            }
            Some(Err(e)) => Err(ProtocolError::Deserialization(e.to_string()).into()),
            None => Ok(None),
        }
    }
}

impl Encoder<Arc<Event>> for TapCodec {
    type Error = TransportError;

    fn encode(&mut self, event: Arc<Event>, dst: &mut BytesMut) -> Result<(), TransportError> {
        let encoded = event.encode()?;
        if encoded.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge(self.max_frame_bytes));
        }
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Channel sizing for one connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            inbound_capacity: 64,
            outbound_capacity: 256,
        }
    }
}

/// Spawn the read and write pumps for `stream`.
///
/// `peer` only labels log lines.
pub fn spawn<S>(stream: S, peer: impl Into<String>, config: &TransportConfig) -> (Inbound, Outbound)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer = peer.into();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, TapCodec::new(config.max_frame_bytes));
    let mut writer = FramedWrite::new(write_half, TapCodec::new(config.max_frame_bytes));

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<Event>>(config.outbound_capacity.max(1));

    let read_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(event)) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Failed to decode tap from {read_peer}: {e}");
                        break;
                    }
                    None => break,
                },
                _ = inbound_tx.closed() => break,
            }
        }
        log::debug!("Read pump for {read_peer} finished");
    });

    tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            if let Err(e) = writer.send(event).await {
                log::error!("Failed to send tap to {peer}: {e}");
                break;
            }
        }
        if let Err(e) = writer.close().await {
            log::debug!("Closing write half for {peer} failed: {e}");
        }
        log::debug!("Write pump for {peer} finished");
    });

    (inbound_rx, outbound_tx)
}

//! Message channel transport.
//!
//! Frames are a big-endian u32 length prefix followed by a UTF-8 JSON
//! payload. Each TCP connection is one sender; the listener assigns it a
//! sender id and forwards its parsed commands to the manager task.
//! Transport failures never surface to the session layer: undeliverable
//! or unparseable messages are logged and dropped.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

use crate::payload::{CommandEnvelope, OutboundMessage, RawMessage};

pub const DEFAULT_PORT: u16 = 8009;

/// Upper bound on a single frame's payload.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Length-prefixed frame codec. Decoding yields the raw payload bytes;
/// JSON parsing happens in the connection loop so a bad payload skips one
/// frame instead of killing the stream.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0_u8; 4];
        len_bytes.copy_from_slice(&src[0..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            bail!("frame length {len} exceeds maximum {MAX_FRAME_LEN}");
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<String> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_FRAME_LEN {
            bail!(
                "outbound frame length {} exceeds maximum {MAX_FRAME_LEN}",
                item.len()
            );
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

/// How the session layer emits messages without knowing the transport.
pub trait MessageOutbox: Send {
    /// Sends to every connected sender.
    fn broadcast(&mut self, message: &OutboundMessage);

    /// Sends to one sender; falls back to logging when it is gone.
    fn send_to(&mut self, sender_id: &str, message: &OutboundMessage);
}

/// Routes outbound messages to per-connection writer channels.
#[derive(Default)]
pub struct ChannelAdapter {
    senders: HashMap<String, mpsc::Sender<String>>,
}

impl ChannelAdapter {
    pub fn new() -> ChannelAdapter {
        ChannelAdapter::default()
    }

    pub fn register(&mut self, sender_id: String, outbound: mpsc::Sender<String>) {
        self.senders.insert(sender_id, outbound);
    }

    pub fn unregister(&mut self, sender_id: &str) {
        self.senders.remove(sender_id);
    }

    fn encode(message: &OutboundMessage) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(json) => Some(json),
            Err(err) => {
                warn!(%err, "failed to serialize outbound message");
                None
            }
        }
    }
}

impl MessageOutbox for ChannelAdapter {
    fn broadcast(&mut self, message: &OutboundMessage) {
        let Some(json) = ChannelAdapter::encode(message) else {
            return;
        };
        for (sender_id, tx) in &self.senders {
            if let Err(err) = tx.try_send(json.clone()) {
                warn!(sender_id, %err, "dropping broadcast to slow or closed sender");
            }
        }
    }

    fn send_to(&mut self, sender_id: &str, message: &OutboundMessage) {
        let Some(tx) = self.senders.get(sender_id) else {
            warn!(sender_id, "dropping message to unknown sender");
            return;
        };
        let Some(json) = ChannelAdapter::encode(message) else {
            return;
        };
        if let Err(err) = tx.try_send(json) {
            warn!(sender_id, %err, "dropping message to slow or closed sender");
        }
    }
}

/// Connection lifecycle and inbound traffic, as seen by the manager task.
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        sender_id: String,
        outbound: mpsc::Sender<String>,
    },
    Disconnected {
        sender_id: String,
    },
    Command(CommandEnvelope),
}

/// Accept loop. Runs until the listener fails or the manager side of
/// `events` is dropped.
pub async fn serve(listener: TcpListener, events: mpsc::Sender<TransportEvent>) -> Result<()> {
    let mut next_connection: u64 = 1;
    loop {
        let (stream, peer) = listener.accept().await?;
        let sender_id = format!("sender-{next_connection}");
        next_connection += 1;
        info!(%peer, sender_id, "sender connected");

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        if events
            .send(TransportEvent::Connected {
                sender_id: sender_id.clone(),
                outbound: outbound_tx,
            })
            .await
            .is_err()
        {
            // Manager task is gone; stop accepting.
            return Ok(());
        }

        tokio::spawn(connection(stream, sender_id, outbound_rx, events.clone()));
    }
}

async fn connection(
    stream: TcpStream,
    sender_id: String,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut framed = Framed::new(stream, MessageCodec);

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => {
                    let raw: RawMessage = match serde_json::from_slice(&bytes) {
                        Ok(raw) => raw,
                        Err(err) => {
                            warn!(sender_id, %err, "discarding unparseable message");
                            continue;
                        }
                    };
                    let envelope = CommandEnvelope::from_raw(raw, Some(&sender_id));
                    if events.send(TransportEvent::Command(envelope)).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(sender_id, %err, "closing connection on frame error");
                    break;
                }
                None => break,
            },
            msg = outbound.recv() => match msg {
                Some(json) => {
                    if let Err(err) = framed.send(json).await {
                        warn!(sender_id, %err, "closing connection on write error");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = events
        .send(TransportEvent::Disconnected {
            sender_id: sender_id.clone(),
        })
        .await;
    debug!(sender_id, "sender disconnected");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payload::RequestId;

    #[test]
    fn codec_round_trip() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();

        codec
            .encode(r#"{"type":"GET_STATUS"}"#.to_string(), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"type":"GET_STATUS"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();

        buf.put_u32(5);
        buf.put_slice(b"ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(b"cde");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"abcde");
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_handles_back_to_back_frames() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode("one".to_string(), &mut buf).unwrap();
        codec.encode("two".to_string(), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn adapter_routes_unicast_and_broadcast() {
        let mut adapter = ChannelAdapter::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        adapter.register("sender-1".to_string(), tx_a);
        adapter.register("sender-2".to_string(), tx_b);

        let msg = OutboundMessage::status(RequestId(1), vec![]);
        adapter.send_to("sender-1", &msg);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        adapter.broadcast(&msg);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        // Unknown and unregistered senders are logged, not errors.
        adapter.send_to("sender-9", &msg);
        adapter.unregister("sender-2");
        adapter.broadcast(&msg);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}

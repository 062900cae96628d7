//! Stream ids and client-signed events.

use std::time::SystemTime;

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use stream_replication::types::{
    basic::{unix_millis, Datum, MiniblockRef, NodeAddress, StreamId, StreamKind},
    crypto_primitives::Keypair,
    event::{Envelope, MediaChunk, MediaInception, Payload, StreamEvent, StreamInception},
};

pub(crate) fn channel_id(n: u8) -> StreamId {
    StreamId::new(StreamKind::Channel, [n; 31])
}

pub(crate) fn media_id(n: u8) -> StreamId {
    StreamId::new(StreamKind::Media, [n; 31])
}

/// A user of the streams, signing its own events.
pub(crate) struct Client {
    keypair: Keypair,
}

impl Client {
    pub(crate) fn new() -> Client {
        Client {
            keypair: Keypair::new(SigningKey::generate(&mut OsRng)),
        }
    }

    pub(crate) fn address(&self) -> NodeAddress {
        self.keypair.address()
    }

    pub(crate) fn event(&self, payload: Payload, prev_miniblock: Option<MiniblockRef>) -> Envelope {
        Envelope::new(
            &self.keypair,
            StreamEvent {
                creator: self.keypair.address(),
                payload,
                prev_miniblock,
                created_at_ms: unix_millis(SystemTime::now()),
                salt: rand::random(),
            },
        )
        .unwrap()
    }

    pub(crate) fn inception(&self, stream_id: StreamId) -> Envelope {
        self.event(Payload::Inception(StreamInception { stream_id }), None)
    }

    pub(crate) fn message(&self, prev_miniblock: MiniblockRef, text: &str) -> Envelope {
        self.event(Payload::Message(Datum::new(text.as_bytes().to_vec())), Some(prev_miniblock))
    }

    pub(crate) fn media_inception(&self, stream_id: StreamId, chunk_count: u32) -> Envelope {
        self.event(
            Payload::MediaInception(MediaInception {
                stream_id,
                channel_id: Some(channel_id(1)),
                chunk_count,
                per_chunk_encryption: false,
            }),
            None,
        )
    }

    pub(crate) fn chunk(&self, chunk_index: i32, data: Vec<u8>) -> Envelope {
        self.event(
            Payload::MediaChunk(MediaChunk {
                data: Datum::new(data),
                chunk_index,
                iv: Datum::new(Vec::new()),
            }),
            None,
        )
    }
}

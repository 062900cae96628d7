/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-node half of a media upload.
//!
//! Every operation here is safe to repeat: a repeated allocation or chunk with the same content is
//! recognized by comparing hashes with what is stored, a repeated seal returns the stored genesis hash,
//! and a chunk that was already uploaded to the external store is not uploaded again.
//!
//! ## Upload bookkeeping
//!
//! With a [`MediaObjectStore`] configured, every node keeps an [`EphemeralUpload`] record per stream:
//! created with the ephemeral stream, extended by every chunk, marked completed by the seal. The record
//! is dropped when the coordinator either releases it (every node sealed) or aborts the upload.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{ErrorCode, ReplicationError};
use crate::events::{AbortUploadEvent, Event, SealEphemeralStreamEvent};
use crate::pluggables::MediaObjectStore;
use crate::storage::{KVStore, StreamStore};
use crate::types::basic::{CryptoHash, NodeAddress, StreamId};
use crate::types::event::Payload;
use crate::types::miniblock::Miniblock;
use crate::types::records::{EphemeralStreamRecord, EphemeralUpload, PartReceipt};

#[derive(Clone)]
pub struct EphemeralUploads<K: KVStore> {
    local: NodeAddress,
    store: StreamStore<K>,
    media_store: Option<Arc<dyn MediaObjectStore>>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore> EphemeralUploads<K> {
    pub(crate) fn new(
        local: NodeAddress,
        store: StreamStore<K>,
        media_store: Option<Arc<dyn MediaObjectStore>>,
        event_publisher: Option<Sender<Event>>,
    ) -> EphemeralUploads<K> {
        EphemeralUploads {
            local,
            store,
            media_store,
            event_publisher,
        }
    }

    pub fn has_media_store(&self) -> bool {
        self.media_store.is_some()
    }

    /// Allocate the ephemeral stream and, with external storage, start its multipart upload.
    pub fn allocate(
        &self,
        stream_id: &StreamId,
        genesis: &Miniblock,
        record: &EphemeralStreamRecord,
    ) -> Result<(), ReplicationError> {
        match self.store.create_ephemeral(stream_id, genesis, record) {
            Ok(()) => (),
            Err(err) if err.is_code(ErrorCode::AlreadyExists) => self.recover_existing(stream_id, genesis, err)?,
            Err(err) => return Err(err),
        }

        if let Some(media_store) = &self.media_store {
            if self.store.ephemeral_record(stream_id)?.is_some() && self.store.upload(stream_id)?.is_none() {
                let upload_id = media_store.start_upload(stream_id)?;
                self.store.put_upload(stream_id, &EphemeralUpload::new(upload_id))?;
            }
        }
        Ok(())
    }

    /// Write the miniblock of one chunk and, with external storage, upload the chunk as part
    /// `miniblock.num()`.
    pub fn save_chunk(&self, stream_id: &StreamId, miniblock: &Miniblock) -> Result<(), ReplicationError> {
        match self.store.write_ephemeral_miniblock(stream_id, miniblock) {
            Ok(()) => (),
            Err(err) if err.is_code(ErrorCode::AlreadyExists) => self.recover_existing(stream_id, miniblock, err)?,
            Err(err) => return Err(err),
        }

        let media_store = match &self.media_store {
            Some(media_store) => media_store,
            None => return Ok(()),
        };
        let mut upload = match self.store.upload(stream_id)? {
            Some(upload) => upload,
            // Sealed and released.
            None if self.store.ephemeral_record(stream_id)?.is_none() => return Ok(()),
            None => {
                return Err(ReplicationError::not_found("no upload is in progress for the stream")
                    .tag("stream_id", stream_id))
            }
        };

        let position = miniblock.num().int() as u32;
        if upload.completed || upload.has_part(position) {
            return Ok(());
        }
        let data = match miniblock.events.first().map(|event| event.payload()) {
            Some(Payload::MediaChunk(chunk)) => chunk.data.bytes(),
            _ => {
                return Err(ReplicationError::invalid_argument("chunk miniblock does not carry a media chunk")
                    .tag("stream_id", stream_id)
                    .tag("num", miniblock.num()))
            }
        };
        let tag = media_store.upload_part(stream_id, &upload.upload_id, position, data)?;
        upload.parts.push(PartReceipt { position, tag });
        self.store.put_upload(stream_id, &upload)
    }

    /// Complete the external upload (if any) and move the ephemeral stream into canonical storage.
    /// Returns the genesis hash; calling it again on a sealed stream returns the same hash.
    pub fn seal(&self, stream_id: &StreamId) -> Result<CryptoHash, ReplicationError> {
        if let (Some(media_store), Some(record)) = (&self.media_store, self.store.ephemeral_record(stream_id)?) {
            let mut upload = self.store.upload(stream_id)?.ok_or_else(|| {
                ReplicationError::not_found("no upload is in progress for the stream").tag("stream_id", stream_id)
            })?;
            if !upload.completed {
                if let Some(position) = (1..=record.chunk_count).find(|position| !upload.has_part(*position)) {
                    return Err(ReplicationError::not_found("upload is missing a part")
                        .tag("stream_id", stream_id)
                        .tag("position", position));
                }
                upload.parts.sort_by_key(|part| part.position);
                media_store.complete_upload(stream_id, &upload.upload_id, &upload.parts)?;
                upload.completed = true;
                self.store.put_upload(stream_id, &upload)?;
            }
        }

        let genesis = self.store.normalize_ephemeral(stream_id)?;
        Event::publish(
            &self.event_publisher,
            Event::SealEphemeralStream(SealEphemeralStreamEvent {
                timestamp: SystemTime::now(),
                stream_id: *stream_id,
                genesis,
            }),
        );
        Ok(genesis)
    }

    /// Abort the external upload of the stream, if one is recorded, and forget it.
    pub fn abort(&self, stream_id: &StreamId) -> Result<(), ReplicationError> {
        let (media_store, upload) = match (&self.media_store, self.store.upload(stream_id)?) {
            (Some(media_store), Some(upload)) => (media_store, upload),
            _ => return Ok(()),
        };
        media_store.abort_upload(stream_id, &upload.upload_id)?;
        self.store.delete_upload(stream_id)?;
        Event::publish(
            &self.event_publisher,
            Event::AbortUpload(AbortUploadEvent {
                timestamp: SystemTime::now(),
                stream_id: *stream_id,
                node: self.local,
            }),
        );
        Ok(())
    }

    /// Forget the upload record of a stream that was sealed on every node.
    pub fn release(&self, stream_id: &StreamId) -> Result<(), ReplicationError> {
        self.store.delete_upload(stream_id)
    }

    /// Turn an `ALREADY_EXISTS` into a success if the stored miniblock with the same number is `miniblock`.
    fn recover_existing(
        &self,
        stream_id: &StreamId,
        miniblock: &Miniblock,
        err: ReplicationError,
    ) -> Result<(), ReplicationError> {
        match self.store.any_miniblock(stream_id, miniblock.num())? {
            Some(stored) if stored.hash == miniblock.hash => Ok(()),
            _ => Err(err),
        }
    }
}

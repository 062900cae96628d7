//! An in-memory multipart object store for media blobs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use stream_replication::{
    error::{ErrorCode, ReplicationError},
    pluggables::MediaObjectStore,
    types::{basic::StreamId, records::PartReceipt},
};

#[derive(Default)]
pub(crate) struct MemMediaStore {
    next_upload: AtomicU64,
    uploads: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
    blobs: Mutex<HashMap<StreamId, Vec<u8>>>,
    aborted: Mutex<Vec<StreamId>>,
    fail_complete: AtomicBool,
}

impl MemMediaStore {
    pub(crate) fn new() -> MemMediaStore {
        MemMediaStore::default()
    }

    /// Make every following `complete_upload` fail.
    pub(crate) fn fail_complete(&self) {
        self.fail_complete.store(true, Ordering::SeqCst);
    }

    /// The assembled blob of a completed upload.
    pub(crate) fn blob(&self, stream_id: &StreamId) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(stream_id).cloned()
    }

    pub(crate) fn aborted(&self) -> Vec<StreamId> {
        self.aborted.lock().unwrap().clone()
    }

    pub(crate) fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

impl MediaObjectStore for MemMediaStore {
    fn start_upload(&self, stream_id: &StreamId) -> Result<String, ReplicationError> {
        let upload_id = format!("{}-{}", stream_id, self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _stream_id: &StreamId,
        upload_id: &str,
        position: u32,
        data: &[u8],
    ) -> Result<String, ReplicationError> {
        let mut uploads = self.uploads.lock().unwrap();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| ReplicationError::new(ErrorCode::NotFound, "no such upload"))?;
        parts.insert(position, data.to_vec());
        Ok(format!("{}-part-{}", upload_id, position))
    }

    fn complete_upload(&self, stream_id: &StreamId, upload_id: &str, parts: &[PartReceipt]) -> Result<(), ReplicationError> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(ReplicationError::new(ErrorCode::Unavailable, "object store rejected the upload"));
        }
        let uploaded = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| ReplicationError::new(ErrorCode::NotFound, "no such upload"))?;
        let mut blob = Vec::new();
        for part in parts {
            let data = uploaded
                .get(&part.position)
                .ok_or_else(|| ReplicationError::new(ErrorCode::InvalidArgument, "part was never uploaded"))?;
            blob.extend_from_slice(data);
        }
        self.blobs.lock().unwrap().insert(*stream_id, blob);
        Ok(())
    }

    fn abort_upload(&self, stream_id: &StreamId, upload_id: &str) -> Result<(), ReplicationError> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.lock().unwrap().push(*stream_id);
        Ok(())
    }
}

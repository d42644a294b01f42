//! Durable sled-backed progress event store.

use sled::{Db, Tree};

use crate::error::StorageError;
use crate::progress::event::{ProgressEnvelope, ProgressEvent};
use crate::store::{decode, encode, to_storage_io};

const TREE_EVENTS: &str = "progress_events";
const TREE_SEQ: &str = "progress_seq";
const EVENT_KEY_PAD: usize = 20;

#[derive(Clone)]
pub struct ProgressStore {
    db: Db,
    events: Tree,
    seq: Tree,
}

impl ProgressStore {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            db: db.clone(),
            events: db.open_tree(TREE_EVENTS).map_err(to_storage_io)?,
            seq: db.open_tree(TREE_SEQ).map_err(to_storage_io)?,
        })
    }

    /// Next sequence number for a job, starting at 1.
    fn next_seq(&self, job: &str) -> Result<u64, StorageError> {
        let updated = self
            .seq
            .update_and_fetch(job.as_bytes(), |current| {
                let next = current.map(read_u64).unwrap_or(0) + 1;
                Some(next.to_be_bytes().to_vec())
            })
            .map_err(to_storage_io)?;
        Ok(updated.as_deref().map(read_u64).unwrap_or(1))
    }

    /// Assign the next sequence number and store the event.
    pub fn append(&self, envelope: ProgressEnvelope) -> Result<ProgressEvent, StorageError> {
        let seq = self.next_seq(&envelope.job)?;
        let event = ProgressEvent::from_envelope(envelope, seq);
        let key = encode_event_key(&event.job, seq);
        let value = encode(&key, &event)?;
        self.events
            .insert(key.as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(event)
    }

    pub fn read_events(&self, job: &str) -> Result<Vec<ProgressEvent>, StorageError> {
        self.read_events_after(job, 0)
    }

    pub fn read_events_after(
        &self,
        job: &str,
        after_seq: u64,
    ) -> Result<Vec<ProgressEvent>, StorageError> {
        let prefix = format!("{job}:");
        let mut out = Vec::new();
        for result in self.events.scan_prefix(prefix.as_bytes()) {
            let (key, value) = result.map_err(to_storage_io)?;
            let parsed: ProgressEvent = decode(&String::from_utf8_lossy(&key), &value)?;
            if parsed.seq > after_seq {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    pub fn encode_event_key(job: &str, seq: u64) -> String {
        encode_event_key(job, seq)
    }
}

fn encode_event_key(job: &str, seq: u64) -> String {
    format!("{job}:{seq:0EVENT_KEY_PAD$}")
}

fn read_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if raw.len() == 8 {
        buf.copy_from_slice(raw);
    }
    u64::from_be_bytes(buf)
}

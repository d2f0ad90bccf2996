/// Chunk storage: chunks and timeline events per conversation, backed by sled
///
/// Key layout inside the `timeline` tree:
///   room\0<conversation>              -> RoomRecord
///   chunk\0<chunk uuid>               -> Chunk
///   event\0<conversation>\0<event id> -> TimelineEvent
///   order\0<chunk uuid><display idx>  -> event id
///
/// Display indices are stored sign-flipped big endian so a prefix scan
/// returns a chunk's events in timeline order.
use crate::error::{Result, SyncError};
use crate::model::{Chunk, TimelineEvent};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

const ROOM_PREFIX: &[u8] = b"room\0";
const CHUNK_PREFIX: &[u8] = b"chunk\0";
const EVENT_PREFIX: &[u8] = b"event\0";
const ORDER_PREFIX: &[u8] = b"order\0";

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Per-conversation index of chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub conversation_id: String,
    pub chunk_ids: Vec<Uuid>,
    pub live_chunk: Option<Uuid>,
}

/// Broadcast after a merge for a conversation has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineChange {
    pub conversation_id: String,
}

/// Durable chunk store shared between the sync loop, pagination and readers.
#[derive(Clone)]
pub struct ChunkStore {
    db: sled::Db,
    tree: sled::Tree,
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
    changes: broadcast::Sender<TimelineChange>,
}

impl ChunkStore {
    /// Open (or create) the chunk store in the given data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("timeline.db");
        debug!("Opening chunk store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open timeline DB: {}", e)))?;
        let tree = db
            .open_tree("timeline")
            .map_err(|e| SyncError::Storage(format!("Failed to open timeline tree: {}", e)))?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        info!("Chunk store initialized at {:?}", db_path);
        Ok(Self {
            db,
            tree,
            locks: Arc::new(Mutex::new(HashMap::new())),
            changes,
        })
    }

    /// Subscribe to committed-merge notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineChange> {
        self.changes.subscribe()
    }

    /// All conversations that have at least one chunk.
    pub fn conversations(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(ROOM_PREFIX) {
            let (_, value) = entry.map_err(storage("list conversations"))?;
            let room: RoomRecord = serde_json::from_slice(&value)?;
            out.push(room.conversation_id);
        }
        Ok(out)
    }

    /// Chunks of a conversation, in the order they were created.
    pub async fn chunks(&self, conversation_id: &str) -> Result<Vec<Chunk>> {
        let _guard = self.read_lock(conversation_id).await;
        let txn = self.begin();
        txn.chunks(conversation_id)
    }

    /// The chunk still receiving live sync events, if any.
    pub async fn live_chunk(&self, conversation_id: &str) -> Result<Option<Chunk>> {
        let _guard = self.read_lock(conversation_id).await;
        let txn = self.begin();
        txn.live_chunk(conversation_id)
    }

    /// Events of one chunk in display order.
    pub async fn events_in_chunk(&self, conversation_id: &str, chunk_id: Uuid) -> Result<Vec<TimelineEvent>> {
        let _guard = self.read_lock(conversation_id).await;
        let txn = self.begin();
        txn.events_in_chunk(conversation_id, chunk_id, None)
    }

    /// Look up a single stored event, linked or not.
    pub async fn timeline_event(&self, conversation_id: &str, event_id: &str) -> Result<Option<TimelineEvent>> {
        let _guard = self.read_lock(conversation_id).await;
        let txn = self.begin();
        txn.event(conversation_id, event_id)
    }

    /// Live chunk id and its events with a display index above `after`.
    ///
    /// `after` only applies when `known_chunk` is still the live chunk; a
    /// replaced live chunk is returned from its first event.
    pub async fn live_events_after(
        &self,
        conversation_id: &str,
        known_chunk: Option<Uuid>,
        after: Option<i64>,
    ) -> Result<(Option<Uuid>, Vec<TimelineEvent>)> {
        let _guard = self.read_lock(conversation_id).await;
        let txn = self.begin();
        let live = match txn.room(conversation_id)?.and_then(|room| room.live_chunk) {
            Some(id) => id,
            None => return Ok((None, Vec::new())),
        };
        let after = if known_chunk == Some(live) { after } else { None };
        let events = txn.events_in_chunk(conversation_id, live, after)?;
        Ok((Some(live), events))
    }

    pub(crate) async fn read_lock(&self, conversation_id: &str) -> OwnedRwLockReadGuard<()> {
        self.conversation_lock(conversation_id).read_owned().await
    }

    pub(crate) async fn write_lock(&self, conversation_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.conversation_lock(conversation_id).write_owned().await
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<RwLock<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn begin(&self) -> ChunkTxn<'_> {
        ChunkTxn {
            tree: &self.tree,
            pending: BTreeMap::new(),
        }
    }

    /// Apply a transaction atomically and make it durable.
    pub(crate) async fn commit(&self, txn: ChunkTxn<'_>, conversation_id: &str) -> Result<usize> {
        let writes = txn.pending.len();
        if writes == 0 {
            return Ok(0);
        }

        let mut batch = sled::Batch::default();
        for (key, value) in txn.pending {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        self.tree
            .apply_batch(batch)
            .map_err(storage("apply timeline batch"))?;
        self.db
            .flush_async()
            .await
            .map_err(storage("flush timeline DB"))?;

        // Nobody listening is fine.
        let _ = self.changes.send(TimelineChange {
            conversation_id: conversation_id.to_string(),
        });
        Ok(writes)
    }
}

/// A set of pending writes layered over the tree.
///
/// Reads see pending writes; nothing reaches sled until `ChunkStore::commit`
/// applies the whole set as one batch.
pub(crate) struct ChunkTxn<'a> {
    tree: &'a sled::Tree,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl ChunkTxn<'_> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        let value = self.tree.get(key).map_err(storage("read timeline"))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.pending.insert(key, Some(raw));
        Ok(())
    }

    fn scan_prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged = BTreeMap::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, value) = entry.map_err(storage("scan timeline"))?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, value) in self.pending.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    pub fn room(&self, conversation_id: &str) -> Result<Option<RoomRecord>> {
        self.get_json(&room_key(conversation_id))
    }

    pub fn put_room(&mut self, room: &RoomRecord) -> Result<()> {
        self.put_json(room_key(&room.conversation_id), room)
    }

    pub fn chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        self.get_json(&chunk_key(chunk_id))
    }

    pub fn put_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.put_json(chunk_key(chunk.id), chunk)
    }

    pub fn delete_chunk(&mut self, chunk_id: Uuid) {
        self.pending.insert(chunk_key(chunk_id), None);
    }

    pub fn chunks(&self, conversation_id: &str) -> Result<Vec<Chunk>> {
        let Some(room) = self.room(conversation_id)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(room.chunk_ids.len());
        for id in room.chunk_ids {
            let chunk = self.chunk(id)?.ok_or_else(|| {
                SyncError::DataIntegrity(format!("room {} lists missing chunk {}", conversation_id, id))
            })?;
            out.push(chunk);
        }
        Ok(out)
    }

    pub fn live_chunk(&self, conversation_id: &str) -> Result<Option<Chunk>> {
        match self.room(conversation_id)?.and_then(|room| room.live_chunk) {
            Some(id) => self.chunk(id),
            None => Ok(None),
        }
    }

    pub fn event(&self, conversation_id: &str, event_id: &str) -> Result<Option<TimelineEvent>> {
        self.get_json(&event_key(conversation_id, event_id))
    }

    /// Store an event record and, when linked, its order entry.
    pub fn put_event(&mut self, event: &TimelineEvent) -> Result<()> {
        if let (Some(chunk_id), Some(display_index)) = (event.chunk_id, event.display_index) {
            self.pending.insert(
                order_key(chunk_id, display_index),
                Some(event.event_id.as_bytes().to_vec()),
            );
        }
        self.put_json(event_key(&event.conversation_id, &event.event_id), event)
    }

    pub fn remove_order(&mut self, chunk_id: Uuid, display_index: i64) {
        self.pending.insert(order_key(chunk_id, display_index), None);
    }

    /// Events of a chunk in ascending display order, optionally only above `after`.
    pub fn events_in_chunk(
        &self,
        conversation_id: &str,
        chunk_id: Uuid,
        after: Option<i64>,
    ) -> Result<Vec<TimelineEvent>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix_raw(&order_prefix(chunk_id))? {
            let display_index = decode_index(&key[key.len() - 8..]);
            if after.is_some_and(|after| display_index <= after) {
                continue;
            }
            let event_id = String::from_utf8(value)
                .map_err(|e| SyncError::DataIntegrity(format!("bad event id in order index: {}", e)))?;
            let event = self.event(conversation_id, &event_id)?.ok_or_else(|| {
                SyncError::DataIntegrity(format!("chunk {} orders missing event {}", chunk_id, event_id))
            })?;
            out.push(event);
        }
        Ok(out)
    }
}

fn storage(action: &'static str) -> impl Fn(sled::Error) -> SyncError {
    move |e| SyncError::Storage(format!("Failed to {}: {}", action, e))
}

fn room_key(conversation_id: &str) -> Vec<u8> {
    [ROOM_PREFIX, conversation_id.as_bytes()].concat()
}

fn chunk_key(chunk_id: Uuid) -> Vec<u8> {
    [CHUNK_PREFIX, chunk_id.as_bytes().as_slice()].concat()
}

fn event_key(conversation_id: &str, event_id: &str) -> Vec<u8> {
    [EVENT_PREFIX, conversation_id.as_bytes(), b"\0".as_slice(), event_id.as_bytes()].concat()
}

fn order_prefix(chunk_id: Uuid) -> Vec<u8> {
    [ORDER_PREFIX, chunk_id.as_bytes().as_slice()].concat()
}

fn order_key(chunk_id: Uuid, display_index: i64) -> Vec<u8> {
    let mut key = order_prefix(chunk_id);
    key.extend_from_slice(&encode_index(display_index));
    key
}

fn encode_index(index: i64) -> [u8; 8] {
    ((index as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_index(raw: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

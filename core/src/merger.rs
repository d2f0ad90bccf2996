/// Chunk merger: folds one batch of events into a conversation's chunk chain
///
/// Every merge runs under the conversation's write lock and commits as a
/// single store batch, so readers see either the old chain or the new one.
use crate::chunk_store::{ChunkStore, ChunkTxn, RoomRecord};
use crate::error::{Result, SyncError};
use crate::model::{
    Chunk, Event, PaginationDirection, SendState, TimelineBatch, TimelineEvent, Token,
    UNLINKED_STATE_INDEX,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// What a successful merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Chunk holding the batch after merging; `None` when nothing was attached
    pub chunk_id: Option<Uuid>,
    pub inserted: usize,
    pub duplicates: usize,
    /// Previously unlinked events now placed on the timeline
    pub promoted: usize,
    pub unlinked_stored: usize,
    pub created_chunk: bool,
    pub absorbed_chunks: usize,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.unlinked_stored == 0 && !self.created_chunk && self.absorbed_chunks == 0
    }
}

#[derive(Clone)]
pub struct ChunkMerger {
    store: ChunkStore,
}

impl ChunkMerger {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Merge a batch into the conversation's chunks.
    ///
    /// Re-merging a batch that was already applied changes nothing.
    pub async fn merge(&self, conversation_id: &str, batch: TimelineBatch) -> Result<MergeOutcome> {
        let _guard = self.store.write_lock(conversation_id).await;

        let mut txn = self.store.begin();
        let outcome = {
            let mut plan = MergePlan::load(&mut txn, conversation_id)?;
            plan.apply(&batch)?;
            plan.write_back()?;
            plan.outcome
        };
        let writes = self.store.commit(txn, conversation_id).await?;

        debug!(
            "Merged {:?} batch into {}: {} inserted, {} duplicates, {} writes",
            batch.direction, conversation_id, outcome.inserted, outcome.duplicates, writes
        );
        if outcome.absorbed_chunks > 0 {
            info!(
                "Joined {} chunk(s) in {} into {:?}",
                outcome.absorbed_chunks, conversation_id, outcome.chunk_id
            );
        }
        Ok(outcome)
    }
}

/// An event that survived deduplication.
struct Incoming<'b> {
    event: &'b Event,
    /// Stored unlinked record to promote, if the id was already known
    unlinked: Option<TimelineEvent>,
}

/// In-memory working set for one merge.
struct MergePlan<'t, 'a> {
    txn: &'t mut ChunkTxn<'a>,
    conversation_id: String,
    room: RoomRecord,
    original_room: Option<RoomRecord>,
    chunks: HashMap<Uuid, Chunk>,
    original_chunks: HashMap<Uuid, Chunk>,
    received_at: String,
    outcome: MergeOutcome,
}

impl<'t, 'a> MergePlan<'t, 'a> {
    fn load(txn: &'t mut ChunkTxn<'a>, conversation_id: &str) -> Result<Self> {
        let original_room = txn.room(conversation_id)?;
        let room = original_room.clone().unwrap_or_else(|| RoomRecord {
            conversation_id: conversation_id.to_string(),
            ..Default::default()
        });
        let chunks: HashMap<Uuid, Chunk> = txn
            .chunks(conversation_id)?
            .into_iter()
            .map(|chunk| (chunk.id, chunk))
            .collect();

        Ok(Self {
            txn,
            conversation_id: conversation_id.to_string(),
            room,
            original_room,
            original_chunks: chunks.clone(),
            chunks,
            received_at: chrono::Utc::now().to_rfc3339(),
            outcome: MergeOutcome::default(),
        })
    }

    fn apply(&mut self, batch: &TimelineBatch) -> Result<()> {
        let mut seen = HashSet::new();
        let incoming = self.deduplicate(&batch.events, &mut seen)?;

        let anchor = match batch.direction {
            PaginationDirection::Forward => Some(self.forward_anchor(batch)?),
            PaginationDirection::Backward => self.backward_anchor(batch, incoming.is_empty()),
        };

        if let Some(anchor) = anchor {
            self.attach(anchor, incoming, batch)?;
            let survivor = self.join_neighbours(anchor)?;
            self.outcome.chunk_id = Some(survivor);
        } else {
            debug!(
                "Backward batch for {} matched no chunk and carried nothing new",
                self.conversation_id
            );
        }

        self.store_unlinked(&batch.state_events, &mut seen)?;
        Ok(())
    }

    /// Drop events this conversation already holds on its timeline.
    fn deduplicate<'b>(&mut self, events: &'b [Event], seen: &mut HashSet<String>) -> Result<Vec<Incoming<'b>>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            if !seen.insert(event.event_id.clone()) {
                self.outcome.duplicates += 1;
                continue;
            }
            match self.txn.event(&self.conversation_id, &event.event_id)? {
                Some(stored) if !stored.is_unlinked => self.outcome.duplicates += 1,
                stored => out.push(Incoming { event, unlinked: stored }),
            }
        }
        Ok(out)
    }

    fn forward_anchor(&mut self, batch: &TimelineBatch) -> Result<Uuid> {
        let Some(live_id) = self.room.live_chunk else {
            if !self.room.chunk_ids.is_empty() {
                return Err(SyncError::DataIntegrity(format!(
                    "forward batch for {} but no live chunk among {} chunk(s)",
                    self.conversation_id,
                    self.room.chunk_ids.len()
                )));
            }
            return Ok(self.create_chunk(batch.start_token.clone(), None, true));
        };

        let live = self.chunk(live_id)?;
        let replayed = batch.end_token.is_some() && live.next_token == batch.end_token;
        if !batch.limited || replayed {
            return Ok(live_id);
        }

        // The server skipped events: the old live chunk becomes history.
        info!(
            "Limited sync for {}, opening a new live chunk after gap",
            self.conversation_id
        );
        self.chunk_mut(live_id)?.is_last_forward = false;
        Ok(self.create_chunk(batch.start_token.clone(), None, true))
    }

    fn backward_anchor(&mut self, batch: &TimelineBatch, nothing_new: bool) -> Option<Uuid> {
        let matched = batch.end_token.as_ref().and_then(|end| {
            self.chunks
                .values()
                .find(|chunk| chunk.prev_token.as_ref() == Some(end))
                .map(|chunk| chunk.id)
        });
        match matched {
            Some(id) => Some(id),
            None if nothing_new => None,
            // Non-contiguous jump: a disconnected chunk until a later batch bridges it.
            None => Some(self.create_chunk(None, batch.end_token.clone(), false)),
        }
    }

    fn attach(&mut self, anchor: Uuid, incoming: Vec<Incoming<'_>>, batch: &TimelineBatch) -> Result<()> {
        for item in incoming {
            let is_state = item.event.is_state();
            let chunk = self.chunk_mut(anchor)?;
            let (display_index, state_index) = match batch.direction {
                PaginationDirection::Forward => chunk.next_forward_slot(is_state),
                PaginationDirection::Backward => chunk.next_backward_slot(is_state),
            };

            let mut record = match item.unlinked {
                Some(record) => {
                    self.outcome.promoted += 1;
                    record
                }
                None => self.new_record(item.event),
            };
            record.event = item.event.clone();
            record.is_unlinked = false;
            record.chunk_id = Some(anchor);
            record.display_index = Some(display_index);
            record.state_index = state_index;
            self.txn.put_event(&record)?;
            self.outcome.inserted += 1;
        }

        let chunk = self.chunk_mut(anchor)?;
        match batch.direction {
            PaginationDirection::Forward => {
                if batch.end_token.is_some() {
                    chunk.next_token = batch.end_token.clone();
                }
            }
            PaginationDirection::Backward => chunk.prev_token = batch.start_token.clone(),
        }
        Ok(())
    }

    /// Join chunks whose boundary tokens now meet the anchor's, until none do.
    fn join_neighbours(&mut self, anchor: Uuid) -> Result<Uuid> {
        let mut current = anchor;
        loop {
            let chunk = self.chunk(current)?;
            if let Some(later) = self.find_chunk(current, |c| {
                chunk.next_token.is_some() && c.prev_token == chunk.next_token
            }) {
                current = self.join(current, later, current)?;
                continue;
            }
            if let Some(earlier) = self.find_chunk(current, |c| {
                chunk.prev_token.is_some() && c.next_token == chunk.prev_token
            }) {
                current = self.join(earlier, current, current)?;
                continue;
            }
            return Ok(current);
        }
    }

    /// Fold two adjacent chunks into one and return the survivor.
    ///
    /// The live chunk always survives; otherwise the anchor does. Absorbed
    /// events are renumbered to extend the survivor on the joined side.
    fn join(&mut self, earlier: Uuid, later: Uuid, anchor: Uuid) -> Result<Uuid> {
        let survivor = if self.chunk(later)?.is_last_forward {
            later
        } else if self.chunk(earlier)?.is_last_forward {
            earlier
        } else {
            anchor
        };
        let absorbed_id = if survivor == earlier { later } else { earlier };
        let absorbed = self
            .chunks
            .remove(&absorbed_id)
            .ok_or_else(|| missing_chunk(&self.conversation_id, absorbed_id))?;
        let mut events = self
            .txn
            .events_in_chunk(&self.conversation_id, absorbed_id, None)?;

        let mut target = self.chunk(survivor)?;
        let appending = survivor == earlier;
        let offset = if appending {
            target.forward_state_index - absorbed.backward_state_index
        } else {
            target.backward_state_index - absorbed.forward_state_index
        };
        if !appending {
            events.reverse();
        }

        for mut event in events {
            let old_index = event.display_index.ok_or_else(|| {
                SyncError::DataIntegrity(format!("linked event {} has no display index", event.event_id))
            })?;
            self.txn.remove_order(absorbed_id, old_index);

            let new_index = if appending {
                target.forward_index += 1;
                target.forward_index - 1
            } else {
                target.backward_index -= 1;
                target.backward_index + 1
            };
            event.chunk_id = Some(survivor);
            event.display_index = Some(new_index);
            event.state_index += offset;
            self.txn.put_event(&event)?;
        }

        if appending {
            target.next_token = absorbed.next_token;
            target.forward_state_index = absorbed.forward_state_index + offset;
        } else {
            target.prev_token = absorbed.prev_token;
            target.backward_state_index = absorbed.backward_state_index + offset;
        }
        self.chunks.insert(survivor, target);

        self.txn.delete_chunk(absorbed_id);
        self.room.chunk_ids.retain(|id| *id != absorbed_id);
        self.outcome.absorbed_chunks += 1;
        Ok(survivor)
    }

    /// Store state events that aren't part of the visible timeline.
    fn store_unlinked(&mut self, events: &[Event], seen: &mut HashSet<String>) -> Result<()> {
        for event in events {
            if !seen.insert(event.event_id.clone()) {
                continue;
            }
            if self.txn.event(&self.conversation_id, &event.event_id)?.is_some() {
                continue;
            }
            let mut record = self.new_record(event);
            record.is_unlinked = true;
            record.state_index = UNLINKED_STATE_INDEX;
            self.txn.put_event(&record)?;
            self.outcome.unlinked_stored += 1;
        }
        Ok(())
    }

    /// Stage every chunk and room change that differs from what was loaded.
    fn write_back(&mut self) -> Result<()> {
        for chunk in self.chunks.values() {
            if self.original_chunks.get(&chunk.id) != Some(chunk) {
                self.txn.put_chunk(chunk)?;
            }
        }
        if !self.room.chunk_ids.is_empty() && self.original_room.as_ref() != Some(&self.room) {
            self.txn.put_room(&self.room)?;
        }
        Ok(())
    }

    fn create_chunk(&mut self, prev_token: Option<Token>, next_token: Option<Token>, live: bool) -> Uuid {
        let mut chunk = Chunk::new(self.conversation_id.clone(), prev_token, next_token);
        chunk.is_last_forward = live;
        let id = chunk.id;
        if live {
            self.room.live_chunk = Some(id);
        }
        self.room.chunk_ids.push(id);
        self.chunks.insert(id, chunk);
        self.outcome.created_chunk = true;
        id
    }

    fn new_record(&self, event: &Event) -> TimelineEvent {
        TimelineEvent {
            event_id: event.event_id.clone(),
            conversation_id: self.conversation_id.clone(),
            chunk_id: None,
            display_index: None,
            state_index: UNLINKED_STATE_INDEX,
            is_unlinked: false,
            send_state: SendState::Sent,
            received_at: self.received_at.clone(),
            event: event.clone(),
        }
    }

    fn find_chunk(&self, exclude: Uuid, predicate: impl Fn(&Chunk) -> bool) -> Option<Uuid> {
        // Scan in creation order so ties resolve the same way on every run.
        self.room
            .chunk_ids
            .iter()
            .filter(|id| **id != exclude)
            .filter_map(|id| self.chunks.get(id))
            .find(|chunk| predicate(chunk))
            .map(|chunk| chunk.id)
    }

    fn chunk(&self, id: Uuid) -> Result<Chunk> {
        self.chunks
            .get(&id)
            .cloned()
            .ok_or_else(|| missing_chunk(&self.conversation_id, id))
    }

    fn chunk_mut(&mut self, id: Uuid) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(&id)
            .ok_or_else(|| missing_chunk(&self.conversation_id, id))
    }
}

fn missing_chunk(conversation_id: &str, id: Uuid) -> SyncError {
    SyncError::DataIntegrity(format!("chunk {} missing from {}", id, conversation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ROOM: &str = "!room:example.org";

    fn merger() -> (TempDir, ChunkMerger) {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path()).unwrap();
        (temp_dir, ChunkMerger::new(store))
    }

    fn events(ids: &[&str]) -> Vec<Event> {
        ids.iter().map(|id| Event::new(*id)).collect()
    }

    fn tok(value: &str) -> Option<Token> {
        Some(Token::new(value))
    }

    #[tokio::test]
    async fn duplicate_ids_within_one_batch_are_stored_once() {
        let (_dir, merger) = merger();
        let outcome = merger
            .merge(ROOM, TimelineBatch::forward(events(&["$1", "$2", "$1"]), None, tok("n1")))
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn noop_merge_commits_nothing() {
        let (_dir, merger) = merger();
        let batch = TimelineBatch::forward(events(&["$1"]), None, tok("n1"));
        merger.merge(ROOM, batch.clone()).await.unwrap();

        let mut rx = merger.store().subscribe();
        let outcome = merger.merge(ROOM, batch).await.unwrap();
        assert!(outcome.is_noop());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_without_live_chunk_is_an_integrity_error() {
        let (_dir, merger) = merger();
        merger
            .merge(ROOM, TimelineBatch::backward(events(&["$old"]), tok("p0"), tok("p1")))
            .await
            .unwrap();
        let before = merger.store().chunks(ROOM).await.unwrap();

        let err = merger
            .merge(ROOM, TimelineBatch::forward(events(&["$new"]), None, tok("n1")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity(_)));
        assert_eq!(merger.store().chunks(ROOM).await.unwrap(), before);
        assert!(merger.store().timeline_event(ROOM, "$new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backward_batch_with_only_known_events_and_no_anchor_is_noop() {
        let (_dir, merger) = merger();
        merger
            .merge(ROOM, TimelineBatch::forward(events(&["$1", "$2"]), tok("p1"), tok("n1")))
            .await
            .unwrap();
        let outcome = merger
            .merge(ROOM, TimelineBatch::backward(events(&["$2", "$1"]), tok("x0"), tok("x1")))
            .await
            .unwrap();
        assert!(outcome.is_noop());
        assert_eq!(merger.store().chunks(ROOM).await.unwrap().len(), 1);
    }
}

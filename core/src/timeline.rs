/// Timeline reads for the UI: the live event stream and backward pagination
use crate::chunk_store::{ChunkStore, TimelineChange};
use crate::config::bounded_pagination_limit;
use crate::error::SyncError;
use crate::merger::ChunkMerger;
use crate::model::{PaginationDirection, TimelineBatch, TimelineEvent};
use crate::transport::PaginationTransport;
use futures_util::stream::{unfold, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of one `request_older_page` call.
#[derive(Debug)]
pub enum LoadResult {
    /// A page was fetched and merged; `count` events are new on the timeline
    Loaded { count: usize },
    /// There is no older history to ask for
    ReachedStart,
    Failed(SyncError),
}

struct LiveCursor {
    store: ChunkStore,
    conversation_id: String,
    changes: broadcast::Receiver<TimelineChange>,
    chunk: Option<Uuid>,
    last_index: Option<i64>,
    buffered: VecDeque<TimelineEvent>,
    primed: bool,
}

impl LiveCursor {
    /// Pull whatever the live chunk gained since the last read.
    async fn refill(&mut self) {
        let read = self
            .store
            .live_events_after(&self.conversation_id, self.chunk, self.last_index)
            .await;
        let (chunk, events) = match read {
            Ok(read) => read,
            Err(e) => {
                warn!("Live timeline read failed for {}: {}", self.conversation_id, e);
                return;
            }
        };

        if chunk != self.chunk {
            debug!("Live chunk of {} is now {:?}", self.conversation_id, chunk);
            self.chunk = chunk;
            self.last_index = None;
        }
        if let Some(index) = events.last().and_then(|event| event.display_index) {
            self.last_index = Some(index);
        }
        self.buffered.extend(events);
    }
}

/// Append-only stream of a conversation's live chunk.
///
/// Yields what is already stored, then every event appended after that. The
/// stream never ends on its own; drop it to stop. Calling again restarts from
/// the beginning of the live chunk.
pub fn live_events(store: ChunkStore, conversation_id: &str) -> impl Stream<Item = TimelineEvent> + Send + 'static {
    // Subscribe before the first read so no commit slips in between.
    let cursor = LiveCursor {
        changes: store.subscribe(),
        store,
        conversation_id: conversation_id.to_string(),
        chunk: None,
        last_index: None,
        buffered: VecDeque::new(),
        primed: false,
    };

    unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(event) = cursor.buffered.pop_front() {
                return Some((event, cursor));
            }

            if cursor.primed {
                match cursor.changes.recv().await {
                    Ok(change) if change.conversation_id != cursor.conversation_id => continue,
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        // Missed notifications, the re-read below catches up anyway
                        debug!("Live timeline lagged {} changes", n);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
            cursor.primed = true;
            cursor.refill().await;
        }
    })
}

/// Loads older history into the chunk chain on request.
#[derive(Clone)]
pub struct Paginator {
    merger: ChunkMerger,
    transport: Arc<dyn PaginationTransport>,
    limit: u16,
}

impl Paginator {
    pub fn new(merger: ChunkMerger, transport: Arc<dyn PaginationTransport>, limit: u16) -> Self {
        Self {
            merger,
            transport,
            limit: bounded_pagination_limit(limit),
        }
    }

    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// Fetch the page before the oldest event of the live chunk and merge it.
    ///
    /// Dropping the future before the merge starts leaves the store untouched.
    pub async fn request_older_page(&self, conversation_id: &str) -> LoadResult {
        let live = match self.merger.store().live_chunk(conversation_id).await {
            Ok(live) => live,
            Err(e) => return LoadResult::Failed(e),
        };
        let Some(from) = live.and_then(|chunk| chunk.prev_token) else {
            debug!("No older history for {}", conversation_id);
            return LoadResult::ReachedStart;
        };

        let page = match self
            .transport
            .fetch_page(conversation_id, &from, PaginationDirection::Backward, self.limit)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to fetch older page of {}: {}", conversation_id, e);
                return LoadResult::Failed(e.into());
            }
        };

        let batch = TimelineBatch::backward(page.events, page.end_token, Some(from))
            .with_state_events(page.state_events);
        match self.merger.merge(conversation_id, batch).await {
            Ok(outcome) => LoadResult::Loaded {
                count: outcome.inserted,
            },
            Err(e) => {
                warn!("Failed to merge older page of {}: {}", conversation_id, e);
                LoadResult::Failed(e)
            }
        }
    }
}

/// Timeline data model: protocol events, stored timeline events, chunks
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque server-issued pagination token.
///
/// Tokens only ever compare for equality; their relative order is known
/// through the chunk chain alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Direction a batch extends a chunk in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationDirection {
    /// Newer events, appended after the live edge
    Forward,
    /// Older history, prepended before a chunk's start
    Backward,
}

/// A protocol event as received from the server.
///
/// The payload is never interpreted here; only the id, the state flag and
/// the timestamp matter to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Present on events that change conversation state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Sender timestamp in milliseconds, display tie-break only
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Event {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            state_key: None,
            origin_server_ts: 0,
            content: serde_json::Value::Null,
        }
    }

    pub fn state(event_id: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            state_key: Some(state_key.into()),
            ..Self::new(event_id)
        }
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

/// Delivery state of a locally originated event. Inbound events are `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    Syncing,
    Sent,
    SyncFailed,
}

/// A stored event plus local bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: String,
    pub conversation_id: String,
    /// Owning chunk; `None` while the event is unlinked
    pub chunk_id: Option<Uuid>,
    /// Position within the owning chunk; `None` while unlinked
    pub display_index: Option<i64>,
    pub state_index: i64,
    pub is_unlinked: bool,
    pub send_state: SendState,
    /// RFC3339 time the event was first stored locally
    pub received_at: String,
    pub event: Event,
}

/// State index given to unlinked events that have no place in the timeline yet.
pub const UNLINKED_STATE_INDEX: i64 = i64::MIN;

/// A contiguous, ordered run of events for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub conversation_id: String,
    /// Older boundary; `None` means start of known history
    pub prev_token: Option<Token>,
    /// Newer boundary; `None` on a live chunk that hasn't seen a cursor yet
    pub next_token: Option<Token>,
    pub is_last_forward: bool,
    /// Display index the next appended event receives
    pub forward_index: i64,
    /// Display index the next prepended event receives
    pub backward_index: i64,
    /// State index carried by the newest event
    pub forward_state_index: i64,
    /// State index an older, non-state event would inherit
    pub backward_state_index: i64,
}

impl Chunk {
    pub fn new(
        conversation_id: impl Into<String>,
        prev_token: Option<Token>,
        next_token: Option<Token>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            prev_token,
            next_token,
            is_last_forward: false,
            forward_index: 0,
            backward_index: -1,
            forward_state_index: 0,
            backward_state_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        (self.forward_index - self.backward_index - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the next display/state index for an event appended at the newer end.
    pub(crate) fn next_forward_slot(&mut self, is_state: bool) -> (i64, i64) {
        let display_index = self.forward_index;
        self.forward_index += 1;
        if is_state {
            self.forward_state_index += 1;
        }
        (display_index, self.forward_state_index)
    }

    /// Take the next display/state index for an event prepended at the older end.
    pub(crate) fn next_backward_slot(&mut self, is_state: bool) -> (i64, i64) {
        let display_index = self.backward_index;
        self.backward_index -= 1;
        let state_index = self.backward_state_index;
        if is_state {
            self.backward_state_index -= 1;
        }
        (display_index, state_index)
    }
}

/// One unit of input to the chunk merger.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineBatch {
    /// Forward: chronological. Backward: newest first, as the server paginates.
    pub events: Vec<Event>,
    /// Older boundary of the batch
    pub start_token: Option<Token>,
    /// Newer boundary of the batch
    pub end_token: Option<Token>,
    pub direction: PaginationDirection,
    /// Forward only: the server skipped events before this batch
    pub limited: bool,
    /// State events known outside the visible timeline
    pub state_events: Vec<Event>,
}

impl TimelineBatch {
    pub fn forward(events: Vec<Event>, start_token: Option<Token>, end_token: Option<Token>) -> Self {
        Self {
            events,
            start_token,
            end_token,
            direction: PaginationDirection::Forward,
            limited: false,
            state_events: Vec::new(),
        }
    }

    pub fn backward(events: Vec<Event>, start_token: Option<Token>, end_token: Option<Token>) -> Self {
        Self {
            direction: PaginationDirection::Backward,
            ..Self::forward(events, start_token, end_token)
        }
    }

    pub fn limited(mut self, limited: bool) -> Self {
        self.limited = limited;
        self
    }

    pub fn with_state_events(mut self, state_events: Vec<Event>) -> Self {
        self.state_events = state_events;
        self
    }
}

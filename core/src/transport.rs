/// Sync and pagination transport contracts
use crate::error::{Result, SyncError, TransportError};
use crate::model::{Event, PaginationDirection, Token};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// One incremental sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Cursor from the last durably merged response; `None` on first sync
    pub cursor: Option<Token>,
    /// How long the server may hold the request open waiting for new events
    pub timeout: Duration,
}

/// Timeline slice of one conversation inside a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSync {
    pub conversation_id: String,
    /// Chronological
    #[serde(default)]
    pub events: Vec<Event>,
    /// Token to paginate backwards from the first event
    #[serde(default)]
    pub prev_token: Option<Token>,
    /// The server dropped events between the previous sync and this slice
    #[serde(default)]
    pub limited: bool,
    /// Conversation state not shown on the timeline
    #[serde(default)]
    pub state_events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_cursor: Token,
    #[serde(default)]
    pub rooms: Vec<RoomSync>,
}

/// One page of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    /// In the order the server walked them (newest first going backwards)
    pub events: Vec<Event>,
    /// The token the page was requested from
    pub start_token: Token,
    /// Token to continue from; `None` once history is exhausted
    pub end_token: Option<Token>,
    #[serde(default)]
    pub state_events: Vec<Event>,
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn fetch(&self, request: SyncRequest) -> std::result::Result<SyncResponse, TransportError>;
}

#[async_trait]
pub trait PaginationTransport: Send + Sync {
    async fn fetch_page(
        &self,
        conversation_id: &str,
        from: &Token,
        direction: PaginationDirection,
        limit: u16,
    ) -> std::result::Result<PageResponse, TransportError>;
}

/// Serves sync responses recorded in a JSON fixture, then idles like an
/// empty long poll.
pub struct ReplayTransport {
    responses: Mutex<VecDeque<SyncResponse>>,
}

impl ReplayTransport {
    pub fn new(responses: Vec<SyncResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Load a fixture holding a JSON array of sync responses
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(SyncError::Io)?;
        let responses: Vec<SyncResponse> = serde_json::from_str(&raw).map_err(SyncError::Serialization)?;
        debug!("Loaded {} sync responses from {:?}", responses.len(), path);
        Ok(Self::new(responses))
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl SyncTransport for ReplayTransport {
    async fn fetch(&self, request: SyncRequest) -> std::result::Result<SyncResponse, TransportError> {
        if let Some(response) = self.responses.lock().await.pop_front() {
            return Ok(response);
        }

        tokio::time::sleep(request.timeout).await;
        let cursor = request
            .cursor
            .ok_or_else(|| TransportError::Other("replay fixture is empty".into()))?;
        Ok(SyncResponse {
            next_cursor: cursor,
            rooms: Vec::new(),
        })
    }
}

/// Pagination for sessions with no server history to offer.
pub struct NoHistory;

#[async_trait]
impl PaginationTransport for NoHistory {
    async fn fetch_page(
        &self,
        _conversation_id: &str,
        from: &Token,
        _direction: PaginationDirection,
        _limit: u16,
    ) -> std::result::Result<PageResponse, TransportError> {
        Ok(PageResponse {
            events: Vec::new(),
            start_token: from.clone(),
            end_token: None,
            state_events: Vec::new(),
        })
    }
}

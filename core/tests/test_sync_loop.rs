/// Sync loop tests - lifecycle controls, retry policy and cursor handling
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use timeline_sync_core::chunk_store::ChunkStore;
use timeline_sync_core::config::Config;
use timeline_sync_core::connectivity::ManualConnectivity;
use timeline_sync_core::merger::ChunkMerger;
use timeline_sync_core::model::{Event, TimelineBatch, Token};
use timeline_sync_core::sync_loop::{SyncHealth, SyncLoop, SyncState, SyncTiming};
use timeline_sync_core::token_store::{MemoryTokenStore, TokenStore};
use timeline_sync_core::transport::{RoomSync, SyncRequest, SyncResponse, SyncTransport};
use timeline_sync_core::{SyncError, TransportError};
use tokio::time::{sleep, timeout};

const ROOM: &str = "!room:example.org";

/// Plays back scripted results, then answers like an idle long poll.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<SyncResponse, TransportError>>>,
    requests: Mutex<Vec<(Instant, SyncRequest)>>,
    /// When set, an exhausted script hangs instead of idling
    hang: AtomicBool,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<SyncResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    fn hanging(script: Vec<Result<SyncResponse, TransportError>>) -> Arc<Self> {
        let transport = Self::new(script);
        transport.hang.store(true, Ordering::SeqCst);
        transport
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<(Instant, SyncRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn fetch(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        self.requests.lock().unwrap().push((Instant::now(), request.clone()));
        let next = self.script.lock().unwrap().pop_front();
        if let Some(result) = next {
            return result;
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        sleep(Duration::from_millis(10)).await;
        Ok(SyncResponse {
            next_cursor: request.cursor.unwrap_or_else(|| Token::new("idle")),
            rooms: Vec::new(),
        })
    }
}

/// Fails the first `failures` saves, like a crash right after the merge.
struct FlakyTokenStore {
    inner: MemoryTokenStore,
    failures: AtomicUsize,
}

impl TokenStore for FlakyTokenStore {
    fn get(&self) -> timeline_sync_core::Result<Option<Token>> {
        self.inner.get()
    }

    fn save(&self, token: &Token) -> timeline_sync_core::Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Storage("disk full".into()));
        }
        self.inner.save(token)
    }
}

fn room(conversation_id: &str, ids: &[&str], prev: &str) -> RoomSync {
    RoomSync {
        conversation_id: conversation_id.to_string(),
        events: ids.iter().map(|id| Event::new(*id)).collect(),
        prev_token: Some(Token::new(prev)),
        limited: false,
        state_events: Vec::new(),
    }
}

fn response(cursor: &str, rooms: Vec<RoomSync>) -> Result<SyncResponse, TransportError> {
    Ok(SyncResponse {
        next_cursor: Token::new(cursor),
        rooms,
    })
}

fn fast_timing() -> SyncTiming {
    SyncTiming::from(&Config {
        long_poll_timeout: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(200),
        offline_recheck_interval: Duration::from_secs(60),
        ..Default::default()
    })
}

struct Harness {
    _dir: TempDir,
    store: ChunkStore,
    tokens: Arc<dyn TokenStore>,
    connectivity: Arc<ManualConnectivity>,
    sync: SyncLoop,
}

fn harness_with(
    transport: Arc<ScriptedTransport>,
    tokens: Arc<dyn TokenStore>,
    connectivity: Arc<ManualConnectivity>,
    timing: SyncTiming,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path()).unwrap();
    let sync = SyncLoop::new(
        ChunkMerger::new(store.clone()),
        transport,
        tokens.clone(),
        connectivity.clone(),
        timing,
    );
    Harness {
        _dir: dir,
        store,
        tokens,
        connectivity,
        sync,
    }
}

fn harness(transport: Arc<ScriptedTransport>) -> Harness {
    harness_with(
        transport,
        Arc::new(MemoryTokenStore::default()),
        Arc::new(ManualConnectivity::default()),
        fast_timing(),
    )
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(sync: &SyncLoop, state: SyncState) {
    let mut rx = sync.subscribe_state();
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .unwrap();
}

#[tokio::test]
async fn test_sync_merges_then_saves_cursor() {
    let transport = ScriptedTransport::new(vec![
        response("s1", vec![room(ROOM, &["$a", "$b"], "p1")]),
        response("s2", vec![room(ROOM, &["$c"], "s1")]),
    ]);
    let h = harness(transport.clone());

    assert!(h.sync.start());
    assert!(!h.sync.start());
    wait_until("second cursor", || h.tokens.get().unwrap() == Some(Token::new("s2"))).await;
    wait_until("third fetch", || transport.calls() >= 3).await;

    let live = h.store.live_chunk(ROOM).await.unwrap().unwrap();
    assert_eq!(live.len(), 3);
    assert_eq!(live.prev_token, Some(Token::new("p1")));
    assert_eq!(live.next_token, Some(Token::new("s2")));

    let requests = transport.requests();
    assert_eq!(requests[0].1.cursor, None);
    assert_eq!(requests[1].1.cursor, Some(Token::new("s1")));
    assert_eq!(requests[2].1.cursor, Some(Token::new("s2")));
    // Catch up first, then long-poll.
    assert_eq!(requests[0].1.timeout, Duration::ZERO);
    assert_eq!(requests[1].1.timeout, Duration::from_millis(20));

    h.sync.kill();
    h.sync.join().await;
    assert_eq!(h.sync.state(), SyncState::Killed);
}

#[tokio::test]
async fn test_pause_blocks_until_resume_and_kill_from_paused() {
    let transport = ScriptedTransport::new(vec![response("s1", vec![room(ROOM, &["$a"], "p1")])]);
    let h = harness(transport.clone());

    h.sync.start();
    wait_until("a few fetches", || transport.calls() >= 3).await;

    h.sync.pause();
    assert_eq!(h.sync.state(), SyncState::Paused);
    // Let the in-flight fetch finish.
    sleep(Duration::from_millis(50)).await;
    let paused_at = transport.calls();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.calls(), paused_at, "fetched while paused");

    h.sync.resume();
    assert_eq!(h.sync.state(), SyncState::Running);
    wait_until("fetch after resume", || transport.calls() > paused_at).await;
    assert_eq!(transport.requests()[paused_at].1.timeout, Duration::ZERO);

    h.sync.pause();
    sleep(Duration::from_millis(50)).await;
    let before_kill = transport.calls();

    h.sync.kill();
    wait_for_state(&h.sync, SyncState::Killed).await;
    h.sync.join().await;
    assert_eq!(transport.calls(), before_kill, "fetched after kill");
    assert_eq!(h.connectivity.listener_count(), 0);

    // Terminal: nothing revives it.
    h.sync.resume();
    assert!(!h.sync.start());
    assert_eq!(h.sync.state(), SyncState::Killed);
}

#[tokio::test]
async fn test_kill_cancels_in_flight_fetch() {
    let transport = ScriptedTransport::hanging(Vec::new());
    let h = harness(transport.clone());

    h.sync.start();
    wait_until("fetch in flight", || transport.calls() == 1).await;

    h.sync.kill();
    timeout(Duration::from_secs(2), h.sync.join())
        .await
        .expect("kill did not cancel the fetch");
    assert_eq!(h.sync.state(), SyncState::Killed);
    assert_eq!(h.tokens.get().unwrap(), None);
}

#[tokio::test]
async fn test_transport_failure_waits_for_backoff() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Other("502 bad gateway".into())),
        response("s1", vec![room(ROOM, &["$a"], "p1")]),
    ]);
    let h = harness(transport.clone());
    let health = h.sync.subscribe_health();

    h.sync.start();
    wait_until("delayed status", || *health.borrow() == SyncHealth::Delayed).await;
    wait_until("cursor after retry", || h.tokens.get().unwrap().is_some()).await;

    let requests = transport.requests();
    assert!(requests[1].0 - requests[0].0 >= Duration::from_millis(200));
    assert_eq!(requests[1].1.cursor, None);
    wait_until("ok status", || *health.borrow() == SyncHealth::Ok).await;

    h.sync.kill();
    h.sync.join().await;
}

#[tokio::test]
async fn test_connectivity_failure_waits_for_restore_signal() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Connectivity("connection refused".into())),
        response("s1", vec![room(ROOM, &["$a"], "p1")]),
    ]);
    let timing = SyncTiming {
        retry_backoff: Duration::from_secs(60),
        ..fast_timing()
    };
    let h = harness_with(
        transport.clone(),
        Arc::new(MemoryTokenStore::default()),
        Arc::new(ManualConnectivity::default()),
        timing,
    );
    let health = h.sync.subscribe_health();

    h.sync.start();
    wait_until("offline status", || *health.borrow() == SyncHealth::Offline).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls(), 1);

    h.connectivity.set_connected(false);
    h.connectivity.set_connected(true);
    wait_until("cursor after restore", || h.tokens.get().unwrap().is_some()).await;
    assert!(transport.calls() >= 2);

    h.sync.kill();
    h.sync.join().await;
}

#[tokio::test]
async fn test_offline_start_does_not_fetch() {
    let transport = ScriptedTransport::new(vec![response("s1", Vec::new())]);
    let h = harness_with(
        transport.clone(),
        Arc::new(MemoryTokenStore::default()),
        Arc::new(ManualConnectivity::new(false)),
        fast_timing(),
    );
    let health = h.sync.subscribe_health();

    h.sync.start();
    wait_until("offline status", || *health.borrow() == SyncHealth::Offline).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls(), 0);

    h.connectivity.set_connected(true);
    wait_until("cursor once online", || h.tokens.get().unwrap() == Some(Token::new("s1"))).await;

    h.sync.kill();
    h.sync.join().await;
}

#[tokio::test]
async fn test_integrity_failure_drops_only_that_room() {
    let transport = ScriptedTransport::new(vec![response(
        "s1",
        vec![room("!broken:example.org", &["$x"], "q1"), room(ROOM, &["$a"], "p1")],
    )]);
    let h = harness(transport.clone());

    // History without a live chunk: a forward batch can't be placed.
    ChunkMerger::new(h.store.clone())
        .merge(
            "!broken:example.org",
            TimelineBatch::backward(vec![Event::new("$old")], Some(Token::new("b0")), Some(Token::new("b1"))),
        )
        .await
        .unwrap();

    h.sync.start();
    wait_until("cursor", || h.tokens.get().unwrap() == Some(Token::new("s1"))).await;

    assert!(h.store.live_chunk(ROOM).await.unwrap().is_some());
    assert!(h.store.live_chunk("!broken:example.org").await.unwrap().is_none());
    assert!(h
        .store
        .timeline_event("!broken:example.org", "$x")
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.sync.state(), SyncState::Running);

    h.sync.kill();
    h.sync.join().await;
}

#[tokio::test]
async fn test_refetch_after_lost_cursor_does_not_duplicate() {
    let batch = vec![room(ROOM, &["$a", "$b", "$c"], "p1")];
    // The server answers the unchanged cursor with the same batch again.
    let transport = ScriptedTransport::new(vec![response("s1", batch.clone()), response("s1", batch)]);
    let tokens = Arc::new(FlakyTokenStore {
        inner: MemoryTokenStore::default(),
        failures: AtomicUsize::new(1),
    });
    let timing = SyncTiming {
        retry_backoff: Duration::from_millis(10),
        ..fast_timing()
    };
    let h = harness_with(
        transport.clone(),
        tokens,
        Arc::new(ManualConnectivity::default()),
        timing,
    );

    h.sync.start();
    wait_until("cursor", || h.tokens.get().unwrap() == Some(Token::new("s1"))).await;

    let requests = transport.requests();
    assert_eq!(requests[0].1.cursor, None);
    assert_eq!(requests[1].1.cursor, None);
    let chunks = h.store.chunks(ROOM).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].len(), 3);

    h.sync.kill();
    h.sync.join().await;
}

#[tokio::test]
async fn test_kill_before_start() {
    let transport = ScriptedTransport::new(Vec::new());
    let h = harness(transport.clone());

    h.sync.kill();
    assert_eq!(h.sync.state(), SyncState::Killed);
    assert!(!h.sync.start());
    sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.calls(), 0);
}

/// Sync loop: the background worker that keeps the timeline up to date
///
/// States move `Idle -> Running -> {Paused, Killing} -> Killed`, with
/// `Paused -> Running` on resume. The worker blocks on a `Notify` while
/// paused or offline and never polls.
use crate::config::Config;
use crate::connectivity::{ConnectivityListener, ConnectivityMonitor};
use crate::error::Result;
use crate::merger::ChunkMerger;
use crate::model::TimelineBatch;
use crate::token_store::TokenStore;
use crate::transport::{SyncRequest, SyncResponse, SyncTransport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Running,
    Paused,
    Killing,
    Killed,
}

/// Ambient status for the UI; failures never surface any other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncHealth {
    Ok,
    /// Waiting for the network to come back
    Offline,
    /// Last attempt failed, waiting out the backoff
    Delayed,
}

/// Timing knobs for the worker.
#[derive(Debug, Clone, Copy)]
pub struct SyncTiming {
    pub long_poll_timeout: Duration,
    pub retry_backoff: Duration,
    pub offline_recheck_interval: Duration,
}

impl From<&Config> for SyncTiming {
    fn from(config: &Config) -> Self {
        Self {
            long_poll_timeout: config.long_poll_timeout,
            retry_backoff: config.retry_backoff,
            offline_recheck_interval: config.offline_recheck_interval,
        }
    }
}

struct Shared {
    state: watch::Sender<SyncState>,
    health: watch::Sender<SyncHealth>,
    wake: Notify,
    /// Cleared when a fetch fails for connectivity reasons
    server_reachable: AtomicBool,
    /// Next request should not long-poll (first sync after start/resume)
    catching_up: AtomicBool,
}

impl Shared {
    fn transition(&self, from: &[SyncState], to: SyncState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                debug!("Sync state {:?} -> {:?}", state, to);
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn set_health(&self, health: SyncHealth) {
        self.health.send_if_modified(|current| {
            if *current == health {
                return false;
            }
            *current = health;
            true
        });
    }
}

impl ConnectivityListener for Shared {
    fn on_connectivity_restored(&self) {
        self.server_reachable.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Handle to the sync worker. Controls never block and never fail; calls
/// that don't apply to the current state are ignored.
pub struct SyncLoop {
    shared: Arc<Shared>,
    pending: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncLoop {
    pub fn new(
        merger: ChunkMerger,
        transport: Arc<dyn SyncTransport>,
        tokens: Arc<dyn TokenStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        timing: SyncTiming,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        let (health, _) = watch::channel(SyncHealth::Ok);
        let shared = Arc::new(Shared {
            state,
            health,
            wake: Notify::new(),
            server_reachable: AtomicBool::new(true),
            catching_up: AtomicBool::new(true),
        });
        let worker = Worker {
            state_rx: shared.state.subscribe(),
            shared: shared.clone(),
            merger,
            transport,
            tokens,
            connectivity,
            timing,
        };

        Self {
            shared,
            pending: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SyncHealth> {
        self.shared.health.subscribe()
    }

    /// Spawn the worker. Only valid from `Idle`; must run inside a tokio runtime.
    pub fn start(&self) -> bool {
        if !self.shared.transition(&[SyncState::Idle], SyncState::Running) {
            return false;
        }
        let Some(worker) = lock(&self.pending).take() else {
            return false;
        };
        *lock(&self.handle) = Some(tokio::spawn(worker.run()));
        true
    }

    pub fn pause(&self) {
        if self.shared.transition(&[SyncState::Running], SyncState::Paused) {
            info!("Sync paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.transition(&[SyncState::Paused], SyncState::Running) {
            info!("Sync resumed");
            self.shared.catching_up.store(true, Ordering::SeqCst);
            self.shared.wake.notify_one();
        }
    }

    /// Stop for good, cancelling any in-flight fetch.
    pub fn kill(&self) {
        if self.shared.transition(&[SyncState::Idle], SyncState::Killed) {
            // Never started: there is no worker to observe Killing.
            lock(&self.pending).take();
            info!("Sync killed before start");
            return;
        }
        if self
            .shared
            .transition(&[SyncState::Running, SyncState::Paused], SyncState::Killing)
        {
            info!("Killing sync...");
            self.shared.wake.notify_one();
        }
    }

    /// Wait for the worker to exit. Returns at once if it was never started.
    pub async fn join(&self) {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sync worker panicked: {}", e);
            }
        }
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        self.kill();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn killed(state_rx: &mut watch::Receiver<SyncState>) {
    let _ = state_rx
        .wait_for(|state| matches!(state, SyncState::Killing | SyncState::Killed))
        .await;
}

struct Worker {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SyncState>,
    merger: ChunkMerger,
    transport: Arc<dyn SyncTransport>,
    tokens: Arc<dyn TokenStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    timing: SyncTiming,
}

impl Worker {
    async fn run(mut self) {
        info!("Start syncing...");
        let listener = self.connectivity.subscribe(self.shared.clone());

        loop {
            let state = *self.state_rx.borrow_and_update();
            match state {
                SyncState::Killing | SyncState::Killed => break,
                SyncState::Paused => {
                    debug!("Sync is paused, waiting...");
                    self.shared.wake.notified().await;
                    continue;
                }
                SyncState::Idle | SyncState::Running => {}
            }

            if !self.connectivity.is_connected() {
                debug!("No network, waiting...");
                self.shared.set_health(SyncHealth::Offline);
                self.shared.wake.notified().await;
                continue;
            }

            if !self.shared.server_reachable.load(Ordering::SeqCst) {
                // The monitor claims we're online but the server wasn't reachable;
                // try again on a signal or after the recheck interval.
                self.shared.set_health(SyncHealth::Offline);
                let _ = timeout(self.timing.offline_recheck_interval, self.shared.wake.notified()).await;
                self.shared.server_reachable.store(true, Ordering::SeqCst);
                continue;
            }

            match self.run_cycle().await {
                Ok(true) => self.shared.set_health(SyncHealth::Ok),
                Ok(false) => {}
                Err(e) if e.is_connectivity() => {
                    warn!("Sync could not reach the server: {}", e);
                    self.shared.server_reachable.store(false, Ordering::SeqCst);
                    self.shared.set_health(SyncHealth::Offline);
                }
                Err(e) => {
                    warn!("Sync failed: {}, retrying in {:?}", e, self.timing.retry_backoff);
                    self.shared.set_health(SyncHealth::Delayed);
                    self.backoff().await;
                }
            }
        }

        self.connectivity.unsubscribe(listener);
        self.shared.state.send_replace(SyncState::Killed);
        info!("Sync killed");
    }

    /// Fetch once, merge, then advance the cursor. `Ok(false)` means the
    /// fetch was cancelled by `kill()`.
    async fn run_cycle(&mut self) -> Result<bool> {
        let cursor = self.tokens.get()?;
        let request_timeout = if self.shared.catching_up.swap(false, Ordering::SeqCst) {
            Duration::ZERO
        } else {
            self.timing.long_poll_timeout
        };
        debug!("Execute sync request with timeout {:?} from {:?}", request_timeout, cursor);

        let transport = self.transport.clone();
        let request = SyncRequest {
            cursor,
            timeout: request_timeout,
        };
        let response = tokio::select! {
            result = transport.fetch(request) => result?,
            _ = killed(&mut self.state_rx) => {
                info!("In-flight sync cancelled");
                return Ok(false);
            }
        };

        self.apply(response).await?;
        Ok(true)
    }

    /// Merge every room, then persist the cursor. The order matters: a crash
    /// between the two replays an idempotent merge.
    async fn apply(&self, response: SyncResponse) -> Result<()> {
        let next_cursor = response.next_cursor;
        for room in response.rooms {
            let batch = TimelineBatch::forward(room.events, room.prev_token, Some(next_cursor.clone()))
                .limited(room.limited)
                .with_state_events(room.state_events);

            match self.merger.merge(&room.conversation_id, batch).await {
                Ok(outcome) => debug!(
                    "Synced {}: {} new, {} duplicate",
                    room.conversation_id, outcome.inserted, outcome.duplicates
                ),
                Err(e) if !e.is_retryable() => {
                    error!("Dropping sync batch for {}: {}", room.conversation_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.tokens.save(&next_cursor)?;
        Ok(())
    }

    async fn backoff(&mut self) {
        let retry_backoff = self.timing.retry_backoff;
        tokio::select! {
            _ = sleep(retry_backoff) => {}
            _ = killed(&mut self.state_rx) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ChunkStore;
    use crate::connectivity::ManualConnectivity;
    use crate::error::TransportError;
    use crate::token_store::MemoryTokenStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Unreachable;

    #[async_trait]
    impl SyncTransport for Unreachable {
        async fn fetch(&self, _request: SyncRequest) -> std::result::Result<SyncResponse, TransportError> {
            Err(TransportError::Other("should not be called".into()))
        }
    }

    fn sync_loop(dir: &TempDir) -> SyncLoop {
        let store = ChunkStore::new(dir.path()).unwrap();
        SyncLoop::new(
            ChunkMerger::new(store),
            Arc::new(Unreachable),
            Arc::new(MemoryTokenStore::default()),
            Arc::new(ManualConnectivity::default()),
            SyncTiming::from(&Config::default()),
        )
    }

    #[tokio::test]
    async fn controls_outside_their_state_are_ignored() {
        let dir = TempDir::new().unwrap();
        let sync = sync_loop(&dir);

        sync.pause();
        assert_eq!(sync.state(), SyncState::Idle);
        sync.resume();
        assert_eq!(sync.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn kill_from_idle_is_terminal() {
        let dir = TempDir::new().unwrap();
        let sync = sync_loop(&dir);

        sync.kill();
        assert_eq!(sync.state(), SyncState::Killed);
        assert!(!sync.start());
        sync.join().await;
        assert_eq!(sync.state(), SyncState::Killed);
    }

    #[test]
    fn timing_follows_config() {
        let config = Config {
            retry_backoff: Duration::from_millis(5),
            ..Default::default()
        };
        let timing = SyncTiming::from(&config);
        assert_eq!(timing.retry_backoff, Duration::from_millis(5));
        assert_eq!(timing.long_poll_timeout, Duration::from_secs(30));
    }
}

/// Session: wires the store, merger, sync loop and paginator for one account
use crate::chunk_store::ChunkStore;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::merger::ChunkMerger;
use crate::model::{TimelineEvent, Token};
use crate::sync_loop::{SyncHealth, SyncLoop, SyncState, SyncTiming};
use crate::timeline::{live_events, LoadResult, Paginator};
use crate::token_store::{SledTokenStore, TokenStore};
use crate::transport::{PaginationTransport, SyncTransport};
use futures_util::stream::Stream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct Session {
    store: ChunkStore,
    tokens: Arc<dyn TokenStore>,
    sync: SyncLoop,
    paginator: Paginator,
}

impl Session {
    /// Open the session stored in `config.data_dir`.
    pub fn open(
        config: &Config,
        sync_transport: Arc<dyn SyncTransport>,
        pagination: Arc<dyn PaginationTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = ChunkStore::new(&config.data_dir)?;
        let tokens = Arc::new(SledTokenStore::new(&config.data_dir)?);
        info!("Session opened at {:?}", config.data_dir);
        Ok(Self::new(config, store, tokens, sync_transport, pagination, connectivity))
    }

    pub fn new(
        config: &Config,
        store: ChunkStore,
        tokens: Arc<dyn TokenStore>,
        sync_transport: Arc<dyn SyncTransport>,
        pagination: Arc<dyn PaginationTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let merger = ChunkMerger::new(store.clone());
        let sync = SyncLoop::new(
            merger.clone(),
            sync_transport,
            tokens.clone(),
            connectivity,
            SyncTiming::from(config),
        );
        let paginator = Paginator::new(merger, pagination, config.pagination_limit);

        Self {
            store,
            tokens,
            sync,
            paginator,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn sync_cursor(&self) -> Result<Option<Token>> {
        self.tokens.get()
    }

    pub fn get_live_events(&self, conversation_id: &str) -> impl Stream<Item = TimelineEvent> + Send + 'static {
        live_events(self.store.clone(), conversation_id)
    }

    pub async fn request_older_page(&self, conversation_id: &str) -> LoadResult {
        self.paginator.request_older_page(conversation_id).await
    }

    /// Start the sync loop, or resume it if it was paused.
    pub fn start_syncing(&self) {
        if !self.sync.start() {
            self.sync.resume();
        }
    }

    pub fn pause_syncing(&self) {
        self.sync.pause();
    }

    /// Stop syncing for good. Use `shutdown` to also wait for the worker.
    pub fn stop_syncing(&self) {
        self.sync.kill();
    }

    pub async fn shutdown(&self) {
        self.sync.kill();
        self.sync.join().await;
        info!("Session shut down");
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync.subscribe_state()
    }

    pub fn subscribe_sync_health(&self) -> watch::Receiver<SyncHealth> {
        self.sync.subscribe_health()
    }
}

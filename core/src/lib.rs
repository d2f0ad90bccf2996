/// Timeline Sync - client-side sync loop and chunked timeline storage
///
/// Keeps a durable, ordered view of each conversation's history, extended by
/// continuous sync and by backward pagination, across restarts and outages.

pub mod error;
pub mod config;
pub mod model;
pub mod chunk_store;
pub mod merger;
pub mod token_store;
pub mod connectivity;
pub mod transport;
pub mod sync_loop;
pub mod timeline;
pub mod session;

pub use error::{Result, SyncError, TransportError};
pub use config::Config;
pub use session::Session;
pub use sync_loop::{SyncHealth, SyncState};
pub use timeline::LoadResult;

/// Sync cursor persistence
use crate::error::{Result, SyncError};
use crate::model::Token;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const NEXT_BATCH_KEY: &[u8] = b"next_batch";

/// Durable home of the "next sync cursor".
///
/// Both calls return only once the value is durable. The sync loop is the
/// only writer.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Result<Option<Token>>;
    fn save(&self, token: &Token) -> Result<()>;
}

/// Cursor stored in its own sled DB next to the timeline
#[derive(Clone)]
pub struct SledTokenStore {
    db: sled::Db,
}

impl SledTokenStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("sync.db"))
            .map_err(|e| SyncError::Storage(format!("sync DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl TokenStore for SledTokenStore {
    fn get(&self) -> Result<Option<Token>> {
        match self
            .db
            .get(NEXT_BATCH_KEY)
            .map_err(|e| SyncError::Storage(format!("get cursor: {}", e)))?
        {
            Some(raw) => {
                let token = String::from_utf8(raw.to_vec())
                    .map_err(|e| SyncError::Storage(format!("cursor is not UTF-8: {}", e)))?;
                Ok(Some(Token::new(token)))
            }
            None => Ok(None),
        }
    }

    fn save(&self, token: &Token) -> Result<()> {
        self.db
            .insert(NEXT_BATCH_KEY, token.as_str().as_bytes())
            .map_err(|e| SyncError::Storage(format!("save cursor: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush cursor: {}", e)))?;
        debug!("Saved sync cursor {}", token);
        Ok(())
    }
}

/// Volatile cursor, for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<Token>>,
}

impl MemoryTokenStore {
    pub fn new(initial: Option<Token>) -> Self {
        Self {
            token: Mutex::new(initial),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Result<Option<Token>> {
        let token = self
            .token
            .lock()
            .map_err(|_| SyncError::Storage("cursor lock poisoned".into()))?;
        Ok(token.clone())
    }

    fn save(&self, token: &Token) -> Result<()> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| SyncError::Storage("cursor lock poisoned".into()))?;
        *slot = Some(token.clone());
        Ok(())
    }
}

//! Credential Pool: an in-memory rotation over a small set of platform
//! session cookies, backed by the Durable Buffer's credential hash.
//! Grounded on `original_source/monitor.py`'s cookie-pool handling —
//! rotate-on-business-error, delete-and-reload-on-401/403, soft-vs-hard
//! delete keyed on the `note` field.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::buffer::DurableBuffer;
use crate::core::{Credential, IngestError, Result};

struct Pool {
    entries: Vec<(String, Credential)>,
    cursor: usize,
}

pub struct CredentialPool {
    buffer: Arc<DurableBuffer>,
    pool: Mutex<Pool>,
}

impl CredentialPool {
    /// Loads the pool from the durable buffer. Fails (non-zero exit at the
    /// call site) if the store holds no usable credentials at launch.
    pub async fn load(buffer: Arc<DurableBuffer>) -> Result<Arc<Self>> {
        let entries = fetch_and_parse(&buffer).await?;
        if entries.is_empty() {
            return Err(IngestError::Config(
                "credential pool is empty at launch".into(),
            ));
        }
        info!(count = entries.len(), "credential pool loaded");
        Ok(Arc::new(Self {
            buffer,
            pool: Mutex::new(Pool { entries, cursor: 0 }),
        }))
    }

    /// The cookie currently at the rotation cursor, or `None` if the pool
    /// has been emptied by rejections.
    pub async fn current(&self) -> Option<String> {
        let pool = self.pool.lock().await;
        pool.entries.get(pool.cursor).map(|(_, c)| c.cookie.clone())
    }

    pub async fn len(&self) -> usize {
        self.pool.lock().await.entries.len()
    }

    /// Advances the rotation cursor without touching persistent storage —
    /// used after a JSON-decode failure or a business-error response code.
    pub async fn rotate(&self) {
        let mut pool = self.pool.lock().await;
        if !pool.entries.is_empty() {
            pool.cursor = (pool.cursor + 1) % pool.entries.len();
        }
    }

    /// A 401/403 response: soft- or hard-deletes the credential at the
    /// current cursor depending on whether it carries a `note`, drops it
    /// from the in-memory pool, then reloads from persistent storage.
    pub async fn reject_current(&self) -> Result<()> {
        let rejected = {
            let pool = self.pool.lock().await;
            pool.entries.get(pool.cursor).cloned()
        };
        let Some((id, credential)) = rejected else {
            return Ok(());
        };

        if let Some(note) = credential.note.as_ref().filter(|n| !n.is_empty()) {
            let soft = Credential {
                cookie: String::new(),
                note: Some(note.clone()),
                status: Some("expired".into()),
                updated_at: Some(chrono::Utc::now()),
            };
            let bytes = serde_json::to_vec(&soft)?;
            self.buffer.save_credential(&id, &bytes).await?;
        } else {
            self.buffer.delete_credential(&id).await?;
        }

        self.reload().await
    }

    /// Re-fetches the credential set from persistent storage. Rotation
    /// cursor resets to 0 — the freshest reload always starts from the
    /// first surviving credential.
    pub async fn reload(&self) -> Result<()> {
        let entries = fetch_and_parse(&self.buffer).await?;
        let mut pool = self.pool.lock().await;
        pool.entries = entries;
        pool.cursor = 0;
        Ok(())
    }
}

async fn fetch_and_parse(buffer: &DurableBuffer) -> Result<Vec<(String, Credential)>> {
    let raw = buffer.load_credentials().await?;
    let mut entries = Vec::with_capacity(raw.len());
    for (id, bytes) in raw {
        match serde_json::from_slice::<Credential>(&bytes) {
            Ok(c) if !c.cookie.is_empty() => entries.push((id, c)),
            Ok(_) => {}
            Err(e) => warn!(id, error = %e, "malformed credential record, skipped"),
        }
    }
    Ok(entries)
}

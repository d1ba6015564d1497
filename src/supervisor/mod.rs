//! Supervisor: discovers which followed broadcasters are live and keeps
//! exactly one `Session` running per live room. Grounded on
//! `original_source/main.py`'s reap/launch/settle loop and its periodic
//! zombie-cleanup companion task.

mod credential;
mod discovery;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::GiftAggregator;
use crate::core::{Result, LIVE_STATUS_ENDED};
use crate::session::protocol::SignatureOracle;
use crate::session::{Session, SessionSeed};
use crate::store::StoreWriter;

pub use credential::CredentialPool;
use discovery::LiveEntry;

struct TrackedSession {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    room_id: String,
    nickname: Option<String>,
}

pub struct Supervisor {
    http: Client,
    oracle: Arc<dyn SignatureOracle>,
    store: Arc<StoreWriter>,
    aggregator: Arc<GiftAggregator>,
    credentials: Arc<CredentialPool>,
    sessions: AsyncMutex<HashMap<String, TrackedSession>>,
    cancel: CancellationToken,
    discovery_interval: Duration,
    zombie_interval: Duration,
    zombie_timeout_secs: i64,
    page_size: u32,
    page_delay_ms: u64,
    account_sec_uid: String,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: Client,
        oracle: Arc<dyn SignatureOracle>,
        store: Arc<StoreWriter>,
        aggregator: Arc<GiftAggregator>,
        credentials: Arc<CredentialPool>,
        discovery_interval: Duration,
        zombie_timeout_secs: i64,
        page_size: u32,
        page_delay_ms: u64,
        account_sec_uid: String,
    ) -> Arc<Self> {
        let zombie_interval = Duration::from_secs(zombie_timeout_secs.max(1) as u64);
        Arc::new(Self {
            http,
            oracle,
            store,
            aggregator,
            credentials,
            sessions: AsyncMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            discovery_interval,
            zombie_interval,
            zombie_timeout_secs,
            page_size,
            page_delay_ms,
            account_sec_uid,
        })
    }

    /// Runs the discovery/reap/launch tick and the periodic zombie sweep
    /// concurrently until cancelled. Never returns an error — every
    /// per-scan failure is logged and the loop keeps going.
    pub async fn run(self: Arc<Self>) {
        let mut discovery_ticker = tokio::time::interval(self.discovery_interval);
        let mut zombie_ticker = tokio::time::interval(self.zombie_interval);

        loop {
            tokio::select! {
                _ = discovery_ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        warn!(error = %e, "discovery scan failed");
                    }
                }
                _ = zombie_ticker.tick() => {
                    match self.store.clear_zombie_rooms(self.zombie_timeout_secs).await {
                        Ok(n) if n > 0 => info!(count = n, "zombie rooms cleared"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "zombie sweep failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("supervisor shutting down");
                    break;
                }
            }
        }
    }

    async fn scan(&self) -> Result<()> {
        let live = discovery::run(
            &self.http,
            &self.oracle,
            &self.credentials,
            &self.store,
            &self.account_sec_uid,
            self.page_size,
            self.page_delay_ms,
        )
        .await?;

        self.reap(&live).await;
        self.launch(&live).await;
        Ok(())
    }

    /// Classifies every tracked session whose task has finished:
    /// settlement (store already ended, or broadcaster no longer live),
    /// or flap (still live on the same room) which restarts immediately.
    async fn reap(&self, live: &[LiveEntry]) {
        let finished: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, t)| t.handle.is_finished())
                .map(|(web_rid, _)| web_rid.clone())
                .collect()
        };

        for web_rid in finished {
            let tracked = {
                let mut sessions = self.sessions.lock().await;
                sessions.remove(&web_rid)
            };
            let Some(tracked) = tracked else { continue };

            let still_live = live.iter().find(|e| e.web_rid == web_rid);
            let store_status = self.store.get_room_live_status(&tracked.room_id).await.unwrap_or(LIVE_STATUS_ENDED);

            let flap = match still_live {
                Some(entry) if entry.room_id == tracked.room_id && store_status != LIVE_STATUS_ENDED => true,
                _ => false,
            };

            if flap {
                debug!(web_rid = %web_rid, room_id = %tracked.room_id, "session ended, broadcaster still live, restarting");
                self.spawn_session(
                    web_rid,
                    SessionSeed {
                        room_id: tracked.room_id,
                        nickname: tracked.nickname,
                        avatar: None,
                        cover: None,
                    },
                )
                .await;
            } else {
                if let Err(e) = self.store.mark_room_ended(&tracked.room_id).await {
                    warn!(web_rid = %web_rid, room_id = %tracked.room_id, error = %e, "failed to mark room ended during settlement");
                }
                info!(web_rid = %web_rid, room_id = %tracked.room_id, "room settled");
            }
        }
    }

    /// Spawns a new Session for every live broadcaster not already tracked.
    async fn launch(&self, live: &[LiveEntry]) {
        let untracked: Vec<LiveEntry> = {
            let sessions = self.sessions.lock().await;
            live.iter()
                .filter(|e| !sessions.contains_key(&e.web_rid))
                .cloned()
                .collect()
        };

        for entry in untracked {
            info!(web_rid = %entry.web_rid, room_id = %entry.room_id, "launching session");
            self.spawn_session(
                entry.web_rid.clone(),
                SessionSeed {
                    room_id: entry.room_id,
                    nickname: entry.nickname,
                    avatar: entry.avatar,
                    cover: entry.cover,
                },
            )
            .await;
        }
    }

    async fn spawn_session(&self, web_rid: String, seed: SessionSeed) {
        let session_cancel = self.cancel.child_token();
        let session = Arc::new(Session::new(
            web_rid.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.aggregator),
            self.http.clone(),
            Arc::clone(&self.oracle),
            session_cancel.clone(),
        ));

        let room_id = seed.room_id.clone();
        let nickname = seed.nickname.clone();
        let handle = tokio::spawn(async move {
            session.run(Some(seed)).await;
        });

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            web_rid,
            TrackedSession {
                handle,
                cancel: session_cancel,
                room_id,
                nickname,
            },
        );
    }

    /// Cancels every tracked session and waits for them all to drain.
    /// Called by `main.rs` as the first step of graceful shutdown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tracked: Vec<TrackedSession> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, t)| t).collect()
        };
        for t in &tracked {
            t.cancel.cancel();
        }
        for t in tracked {
            let _ = t.handle.await;
        }
    }
}

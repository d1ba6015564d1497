//! A `Session` owns one room's push-channel connection end to end: it
//! resolves room details, opens the WebSocket, and keeps a heartbeat and a
//! receive loop running until the broadcaster ends the stream, the
//! transport errors out, or the Supervisor cancels it. Every exit path —
//! handshake failure, read error, control-channel end, external
//! cancellation — funnels through the same drain-and-close cleanup.
//!
//! Grounded on `original_source/liveMan.py`'s `LiveMan` connect/run loop for
//! the state machine and retry shape, and on the teacher's
//! `replication/replica.rs` for the task/cleanup discipline (one
//! `Arc<Self>`-owning background task per connection attempt, reconnect
//! decisions made by the caller, not the connection routine itself).

pub mod handlers;
pub mod protocol;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::GiftAggregator;
use crate::core::{generate_ms_token, IngestError, Result, Room, LIVE_STATUS_LIVE};
use crate::store::StoreWriter;

use self::handlers::{DispatchOutcome, MessageHandler};
use self::protocol::{PushFrame, Response, SignatureOracle};

const STATE_INIT: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_DRAINING: u8 = 3;
const STATE_TERMINATED: u8 = 4;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const LAZY_REFRESH_ATTEMPTS: u32 = 5;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Minimal room attributes the Supervisor already knows at discovery time,
/// letting a Session skip its own blocking detail fetch (the "fast path").
#[derive(Clone, Debug)]
pub struct SessionSeed {
    pub room_id: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub cover: Option<String>,
}

struct RoomDetail {
    room_id: String,
    sec_uid: Option<String>,
    nickname: Option<String>,
    avatar: Option<String>,
    cover: Option<String>,
    start_follower_count: i64,
    live_status: i32,
}

pub struct Session {
    web_rid: String,
    store: Arc<StoreWriter>,
    aggregator: Arc<GiftAggregator>,
    http: Client,
    oracle: Arc<dyn SignatureOracle>,
    cancel: CancellationToken,
    state: AtomicU8,
}

impl Session {
    pub fn new(
        web_rid: String,
        store: Arc<StoreWriter>,
        aggregator: Arc<GiftAggregator>,
        http: Client,
        oracle: Arc<dyn SignatureOracle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            web_rid,
            store,
            aggregator,
            http,
            oracle,
            cancel,
            state: AtomicU8::new(STATE_INIT),
        }
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Relaxed);
    }

    /// Drives the session to completion. Returns once the room is no longer
    /// worth watching (ended, or startup failed twice) or the session was
    /// cancelled externally. Never returns an `Err` — every internal failure
    /// is logged and treated as a reason to stop this session, not to crash
    /// the caller.
    pub async fn run(self: Arc<Self>, seed: Option<SessionSeed>) {
        self.set_state(STATE_INIT);

        let detail = match self.resolve_room(seed).await {
            Some(d) => d,
            None => {
                self.set_state(STATE_TERMINATED);
                return;
            }
        };

        self.set_state(STATE_CONNECTING);
        match self.connect_and_run(&detail.room_id).await {
            Ok(()) => debug!(web_rid = %self.web_rid, "session ended normally"),
            Err(e) => warn!(web_rid = %self.web_rid, error = %e, "session ended with error"),
        }
        self.set_state(STATE_TERMINATED);
    }

    /// Fast path: a seed from the Supervisor means the room is already
    /// known to be live. A provisional document is written immediately and
    /// a background task fills in the rest (`sec_uid`, follower count,
    /// nickname/avatar if the seed didn't carry them) with retrying
    /// backoff; startup is never blocked on that fetch.
    ///
    /// Slow path (no seed): block on one detail fetch, retry once after 3s
    /// on failure, and give up cleanly after two consecutive failures.
    async fn resolve_room(&self, seed: Option<SessionSeed>) -> Option<RoomDetail> {
        if let Some(seed) = seed {
            let provisional = Room {
                room_id: seed.room_id.clone(),
                web_rid: Some(self.web_rid.clone()),
                nickname: seed.nickname.clone(),
                avatar: seed.avatar.clone(),
                cover: seed.cover.clone(),
                live_status: LIVE_STATUS_LIVE,
                ..Room::default()
            };
            if let Err(e) = self.store.save_room_info(&provisional).await {
                warn!(web_rid = %self.web_rid, error = %e, "failed to write provisional room doc");
            }
            self.spawn_lazy_refresh(seed.room_id.clone());
            return Some(RoomDetail {
                room_id: seed.room_id,
                sec_uid: None,
                nickname: seed.nickname,
                avatar: seed.avatar,
                cover: seed.cover,
                start_follower_count: 0,
                live_status: LIVE_STATUS_LIVE,
            });
        }

        match self.fetch_room_detail().await {
            Ok(detail) => Some(detail),
            Err(e) => {
                warn!(web_rid = %self.web_rid, error = %e, "room detail fetch failed, retrying once in 3s");
                tokio::time::sleep(Duration::from_secs(3)).await;
                match self.fetch_room_detail().await {
                    Ok(detail) => Some(detail),
                    Err(e) => {
                        warn!(web_rid = %self.web_rid, error = %e, "room detail fetch failed twice, abandoning session");
                        None
                    }
                }
            }
        }
    }

    /// Retries the detail endpoint up to `LAZY_REFRESH_ATTEMPTS` times with
    /// `10 + 5*i` second backoff, persisting whatever it learns. Runs
    /// detached from `run()` so it never blocks the push-channel connect.
    fn spawn_lazy_refresh(&self, room_id: String) {
        let web_rid = self.web_rid.clone();
        let http = self.http.clone();
        let oracle = Arc::clone(&self.oracle);
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            for attempt in 0..LAZY_REFRESH_ATTEMPTS {
                let delay = Duration::from_secs(10 + 5 * attempt as u64);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
                match fetch_room_detail_with(&http, &oracle, &web_rid).await {
                    Ok(detail) => {
                        let update = Room {
                            room_id: room_id.clone(),
                            web_rid: Some(web_rid.clone()),
                            sec_uid: detail.sec_uid,
                            nickname: detail.nickname,
                            avatar: detail.avatar,
                            cover: detail.cover,
                            live_status: detail.live_status,
                            start_follower_count: detail.start_follower_count,
                            ..Room::default()
                        };
                        if let Err(e) = store.save_room_info(&update).await {
                            warn!(web_rid = %web_rid, error = %e, "lazy refresh save failed");
                        }
                        return;
                    }
                    Err(e) => {
                        debug!(web_rid = %web_rid, attempt, error = %e, "lazy refresh attempt failed");
                    }
                }
            }
            warn!(web_rid = %web_rid, "lazy refresh exhausted all attempts");
        });
    }

    async fn fetch_room_detail(&self) -> Result<RoomDetail> {
        fetch_room_detail_with(&self.http, &self.oracle, &self.web_rid).await
    }

    /// Opens the push-channel WebSocket and runs the heartbeat and receive
    /// loops concurrently until one of them ends the session. The
    /// connection (and the heartbeat task) is guaranteed closed on every
    /// exit from this function, success or failure.
    async fn connect_and_run(&self, room_id: &str) -> Result<()> {
        let url = self.build_push_channel_url(room_id)?;
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(IngestError::Transport)?;
        self.set_state(STATE_CONNECTED);

        let (write, mut read) = ws.split();
        let write = Arc::new(AsyncMutex::new(write));

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_write = Arc::clone(&write);
        let heartbeat_cancel_child = heartbeat_cancel.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let frame = PushFrame::heartbeat();
                        let mut guard = heartbeat_write.lock().await;
                        if guard.send(WsMessage::Binary(Bytes::from(frame.encode_to_vec()))).await.is_err() {
                            break;
                        }
                    }
                    _ = heartbeat_cancel_child.cancelled() => break,
                }
            }
        });

        let mut dispatcher = MessageHandler::new(
            self.web_rid.clone(),
            room_id.to_string(),
            Arc::clone(&self.store),
            Arc::clone(&self.aggregator),
        );

        let result = self.receive_loop(&mut read, &write, &mut dispatcher).await;

        self.set_state(STATE_DRAINING);
        heartbeat_cancel.cancel();
        let _ = heartbeat.await;
        let _ = write.lock().await.close().await;

        result
    }

    async fn receive_loop(
        &self,
        read: &mut (impl StreamExt<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
        write: &Arc<AsyncMutex<impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin>>,
        dispatcher: &mut MessageHandler,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(web_rid = %self.web_rid, "session cancelled externally");
                    return Ok(());
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        debug!(web_rid = %self.web_rid, "push channel closed by peer");
                        return Ok(());
                    };
                    let frame = frame.map_err(IngestError::Transport)?;
                    let WsMessage::Binary(bytes) = frame else {
                        continue;
                    };
                    let push_frame = match PushFrame::decode(bytes.as_ref()) {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(error = %e, "malformed push frame, dropped");
                            continue;
                        }
                    };
                    if push_frame.payload.is_empty() {
                        continue;
                    }
                    let mut decompressed = Vec::new();
                    let mut gz = GzDecoder::new(push_frame.payload.as_slice());
                    if std::io::Read::read_to_end(&mut gz, &mut decompressed).is_err() {
                        debug!("gzip decompression of push frame failed, dropped");
                        continue;
                    }
                    let response = match Response::decode(decompressed.as_slice()) {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "malformed response payload, dropped");
                            continue;
                        }
                    };

                    if response.need_ack {
                        let ack = PushFrame::ack(push_frame.log_id, &response.internal_ext);
                        let mut guard = write.lock().await;
                        let _ = guard.send(WsMessage::Binary(Bytes::from(ack.encode_to_vec()))).await;
                    }

                    for message in &response.messages_list {
                        if let DispatchOutcome::Terminated = dispatcher.handle(&message.method, &message.payload).await {
                            info!(web_rid = %self.web_rid, "broadcaster ended livestream");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn build_push_channel_url(&self, room_id: &str) -> Result<String> {
        let ms_token = generate_ms_token(107);
        let query = format!(
            "live_id=1&aid=6383&version_code=180800&webcast_sdk_version=1.0.14-beta.0&\
             room_id={room_id}&sub_room_id=&sub_channel_id=&did_rule=3&user_unique_id={uid}&\
             device_platform=web&device_type=&ac=&identity=audience&msToken={ms_token}",
            room_id = room_id,
            uid = room_id,
            ms_token = ms_token,
        );
        let digest = protocol::canonical_signature_digest(&query);
        let signature = self.oracle.sign_push_channel(&digest)?;
        Ok(format!(
            "wss://webcast5-ws-web-lf.douyin.com/webcast/im/push/v2/?{query}&signature={signature}"
        ))
    }
}

async fn fetch_room_detail_with(http: &Client, oracle: &Arc<dyn SignatureOracle>, web_rid: &str) -> Result<RoomDetail> {
    let ms_token = generate_ms_token(182);
    let query = format!("web_rid={web_rid}&aid=6383&device_platform=web&msToken={ms_token}");
    let a_bogus = oracle.compute_a_bogus(&query, USER_AGENT)?;
    let url = format!("https://live.douyin.com/webcast/room/web/enter/?{query}&a_bogus={a_bogus}");

    let resp = http
        .get(&url)
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(|e| IngestError::Http(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(IngestError::Http(format!("room detail endpoint returned {}", resp.status())));
    }

    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| IngestError::Http(e.to_string()))?;

    let room = body
        .pointer("/data/data/0")
        .or_else(|| body.pointer("/data/room"))
        .ok_or_else(|| IngestError::BusinessError("room detail response missing room object".into()))?;

    let room_id = room
        .get("id_str")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IngestError::BusinessError("room detail missing room id".into()))?
        .to_string();
    let live_status = room.get("status").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

    let owner = room.get("owner");
    let sec_uid = owner.and_then(|o| o.get("sec_uid")).and_then(|v| v.as_str()).map(str::to_string);
    let nickname = owner.and_then(|o| o.get("nickname")).and_then(|v| v.as_str()).map(str::to_string);
    let avatar = owner
        .and_then(|o| o.pointer("/avatar_thumb/url_list/0"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let cover = room
        .pointer("/cover/url_list/0")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let start_follower_count = owner
        .and_then(|o| o.pointer("/follow_info/follower_count"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    Ok(RoomDetail {
        room_id,
        sec_uid,
        nickname,
        avatar,
        cover,
        start_follower_count,
        live_status,
    })
}

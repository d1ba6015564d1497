//! Discovery: walks the operator account's follow list page by page,
//! upserting broadcaster profiles and realtime room status, and returning
//! the set of currently-live broadcasters for the reap/launch phases.
//! Grounded on `original_source/monitor.py`'s follow-list scan.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::core::{generate_ms_token, Broadcaster, IngestError, Result, LIVE_STATUS_LIVE};
use crate::session::protocol::SignatureOracle;
use crate::store::StoreWriter;

use super::credential::CredentialPool;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Clone, Debug)]
pub struct LiveEntry {
    pub web_rid: String,
    pub room_id: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub cover: Option<String>,
}

/// One full pass over the follow list. Returns the live set; broadcaster
/// profile upserts and realtime status updates are applied as a side
/// effect while walking pages.
pub async fn run(
    http: &Client,
    oracle: &Arc<dyn SignatureOracle>,
    credentials: &Arc<CredentialPool>,
    store: &Arc<StoreWriter>,
    account_sec_uid: &str,
    page_size: u32,
    page_delay_ms: u64,
) -> Result<Vec<LiveEntry>> {
    let mut live = Vec::new();
    let mut offset: u32 = 0;

    loop {
        let page = fetch_page_with_retry(http, oracle, credentials, account_sec_uid, offset, page_size).await?;

        for item in &page.broadcasters {
            if let Err(e) = store.save_broadcaster_card(&item.broadcaster).await {
                warn!(sec_uid = %item.broadcaster.sec_uid, error = %e, "failed to upsert broadcaster profile");
            }

            if item.broadcaster.live_status != LIVE_STATUS_LIVE && item.broadcaster.live_status != crate::core::LIVE_STATUS_GUEST {
                continue;
            }

            if let Some(room_id) = &item.room_id {
                if let Err(e) = store
                    .update_room_realtime(room_id, item.broadcaster.live_status, item.broadcaster.follower_count.unwrap_or(0))
                    .await
                {
                    warn!(room_id, error = %e, "failed to update room realtime status");
                }
            }

            if item.broadcaster.live_status != LIVE_STATUS_LIVE {
                continue;
            }
            let Some(room_id) = item.room_id.clone() else {
                continue;
            };

            let web_rid = match &item.web_rid {
                Some(w) => w.clone(),
                None => match store.get_broadcaster_self_web_rid(&item.broadcaster.sec_uid).await {
                    Ok(Some(w)) => w,
                    _ => {
                        debug!(sec_uid = %item.broadcaster.sec_uid, "live broadcaster with no resolvable web_rid, dropped");
                        continue;
                    }
                },
            };

            live.push(LiveEntry {
                web_rid,
                room_id,
                nickname: item.broadcaster.nickname.clone(),
                avatar: item.broadcaster.avatar.clone(),
                cover: None,
            });
        }

        if !page.has_more {
            break;
        }
        offset += page_size;
        tokio::time::sleep(Duration::from_millis(page_delay_ms)).await;
    }

    Ok(live)
}

struct DiscoveryItem {
    broadcaster: Broadcaster,
    web_rid: Option<String>,
    room_id: Option<String>,
}

struct DiscoveryPage {
    broadcasters: Vec<DiscoveryItem>,
    has_more: bool,
}

/// Bounded-retry wrapper over one page fetch: rotates on business-error or
/// decode failure, rejects (soft/hard-deletes) and reloads on 401/403.
/// Bound is `|pool| + 2`; on exhaustion sleeps 60s and reloads once more.
async fn fetch_page_with_retry(
    http: &Client,
    oracle: &Arc<dyn SignatureOracle>,
    credentials: &Arc<CredentialPool>,
    account_sec_uid: &str,
    offset: u32,
    page_size: u32,
) -> Result<DiscoveryPage> {
    let bound = credentials.len().await + 2;

    for _ in 0..bound {
        let Some(cookie) = credentials.current().await else {
            break;
        };

        match fetch_page(http, oracle, &cookie, account_sec_uid, offset, page_size).await {
            Ok(page) => return Ok(page),
            Err(IngestError::CredentialInvalid(status)) => {
                warn!(status, "credential rejected by discovery endpoint, rotating");
                credentials.reject_current().await?;
            }
            Err(IngestError::BusinessError(msg)) => {
                debug!(msg, "discovery business error, rotating credential");
                credentials.rotate().await;
            }
            Err(IngestError::Serde(_)) | Err(IngestError::Decode(_)) => {
                debug!("discovery response decode failure, rotating credential");
                credentials.rotate().await;
            }
            Err(e) => return Err(e),
        }
    }

    warn!("discovery credential pool exhausted, sleeping 60s and reloading");
    tokio::time::sleep(Duration::from_secs(60)).await;
    credentials.reload().await?;
    Err(IngestError::PoolExhausted)
}

async fn fetch_page(
    http: &Client,
    oracle: &Arc<dyn SignatureOracle>,
    cookie: &str,
    account_sec_uid: &str,
    offset: u32,
    page_size: u32,
) -> Result<DiscoveryPage> {
    let ms_token = generate_ms_token(107);
    let query = format!(
        "device_platform=web&aid=6383&channel=channel_pc_web&sec_user_id={account_sec_uid}\
         &offset={offset}&count={page_size}&min_time=0&max_time=0&source_type=4&gps_access=0\
         &address_book_access=0&is_top=1&pc_client_type=1&version_code=170400\
         &webcast_sdk_version=1.0.14-beta.0&cookie_enabled=true&platform=PC&msToken={ms_token}"
    );
    let a_bogus = oracle.compute_a_bogus(&query, USER_AGENT)?;
    let url = format!("https://webcast.amemv.com/webcast/web/following/?{query}&a_bogus={a_bogus}");

    let resp = http
        .get(&url)
        .header("User-Agent", USER_AGENT)
        .header("Cookie", cookie)
        .send()
        .await
        .map_err(|e| IngestError::Http(e.to_string()))?;

    let status = resp.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(IngestError::CredentialInvalid(status.as_u16()));
    }
    if !status.is_success() {
        return Err(IngestError::Http(format!("discovery endpoint returned {status}")));
    }

    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| IngestError::Decode(e.to_string()))?;

    if let Some(code) = body.get("status_code").and_then(|v| v.as_i64()) {
        if code != 0 {
            return Err(IngestError::BusinessError(format!("discovery status_code={code}")));
        }
    }

    let has_more = body.get("has_more").and_then(|v| v.as_bool()).unwrap_or(false);
    let list = body
        .get("followings")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut broadcasters = Vec::with_capacity(list.len());
    for item in list {
        let sec_uid = match item.get("sec_uid").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => continue,
        };
        let live_status = item.get("live_status").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let web_rid = item.get("web_rid").and_then(|v| v.as_str()).map(str::to_string);
        // self_web_rid is not a distinct response field: it's the broadcaster's own
        // web_rid, recorded only while they're self-hosting (live_status == 1).
        let self_web_rid = if live_status == LIVE_STATUS_LIVE {
            web_rid.clone()
        } else {
            None
        };
        let broadcaster = Broadcaster {
            sec_uid,
            web_rid: web_rid.clone(),
            self_web_rid,
            nickname: item.get("nickname").and_then(|v| v.as_str()).map(str::to_string),
            avatar: item.pointer("/avatar_thumb/url_list/0").and_then(|v| v.as_str()).map(str::to_string),
            signature: item.get("signature").and_then(|v| v.as_str()).map(str::to_string),
            live_status,
            follower_count: item.pointer("/follow_info/follower_count").and_then(|v| v.as_i64()),
        };
        let room_id = item.get("room_id").and_then(|v| v.as_str()).map(str::to_string);
        broadcasters.push(DiscoveryItem { broadcaster, web_rid, room_id });
    }

    Ok(DiscoveryPage { broadcasters, has_more })
}

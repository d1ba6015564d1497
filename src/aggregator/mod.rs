//! Gift Aggregator: two-tier dedup plus combo/rollup buffering for gift
//! events. Grounded line-for-line on the original `gift_deduplicator.py`
//! (see DESIGN.md). The combo buffer is an insertion-ordered map guarded by
//! a `parking_lot::Mutex` that is never held across an `.await` — I/O
//! (`StoreWriter::buffer_gift`, cache calls) always happens after the lock
//! is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::DurableBuffer;
use crate::core::{GiftEvent, Result};
use crate::store::StoreWriter;

const BADGE_GIFT_ID: &str = "685";
const SPORTS_CAR_GIFT_NAME: &str = "跑车";
const SPORTS_CAR_DIAMOND_ICON_MARKER: &str = "diamond_paoche_icon.png";
const SPORTS_CAR_FORCED_PRICE: i64 = 1500;

fn price_overrides() -> &'static HashMap<&'static str, i64> {
    use std::sync::OnceLock;
    static MAP: OnceLock<HashMap<&'static str, i64>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("钻石火箭", 12001);
        m.insert("钻石嘉年华", 36000);
        m.insert("钻石兔兔", 360);
        m.insert("钻石飞艇", 23333);
        m.insert("钻石秘境", 16000);
        m.insert("钻石游轮", 7200);
        m.insert("钻石飞机", 3600);
        m.insert("钻石跑车", 1500);
        m.insert("钻石热气球", 620);
        m.insert("钻石邮轮", 7200);
        m
    })
}

fn is_badge_gift(gift_id: &str, gift_name: &str) -> bool {
    gift_id == BADGE_GIFT_ID || gift_name.contains("灯牌")
}

/// Applies price overrides and the sports-car ad-hoc correction. Returns the
/// corrected diamond price.
fn corrected_diamond_count(gift_name: &str, reported: i64, icon_url: &str) -> i64 {
    if gift_name == SPORTS_CAR_GIFT_NAME && icon_url.contains(SPORTS_CAR_DIAMOND_ICON_MARKER) {
        return SPORTS_CAR_FORCED_PRICE;
    }
    if let Some(price) = price_overrides().get(gift_name) {
        return *price;
    }
    reported
}

#[derive(Clone)]
struct ComboEntry {
    event: GiftEvent,
    max_combo: i64,
    max_group_count: i64,
    last_update: chrono::DateTime<chrono::Utc>,
    force_flush: bool,
}

type ComboKey = (String, String, String);

/// An insertion/activity-ordered map: `order` tracks keys from oldest to
/// most-recently-touched so the combo buffer can evict the head in O(1)
/// amortized and move a hit key to the tail. `entries` never has a key
/// absent from `order` or vice versa.
struct ComboBuffer {
    entries: HashMap<ComboKey, ComboEntry>,
    order: VecDeque<ComboKey>,
}

impl ComboBuffer {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &ComboKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).unwrap();
            self.order.push_back(k);
        }
    }

    fn insert_new(&mut self, key: ComboKey, entry: ComboEntry, cap: usize) -> Option<ComboEntry> {
        let evicted = if self.entries.len() >= cap {
            self.order.pop_front().and_then(|k| self.entries.remove(&k))
        } else {
            None
        };
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
        evicted
    }

    fn remove(&mut self, key: &ComboKey) -> Option<ComboEntry> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(key)
    }

    fn drain_all(&mut self) -> Vec<ComboEntry> {
        self.order.clear();
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

pub struct GiftAggregator {
    store: Arc<StoreWriter>,
    buffer: Arc<DurableBuffer>,
    combo: Mutex<ComboBuffer>,
    l1_dedup: Mutex<(HashMap<String, ()>, VecDeque<String>)>,
    max_buffer_size: usize,
    combo_timeout_secs: i64,
    dedup_cap: usize,
    dedup_ttl_secs: u64,
    small_gift_threshold: i64,
    eviction_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl GiftAggregator {
    pub fn new(
        store: Arc<StoreWriter>,
        buffer: Arc<DurableBuffer>,
        max_buffer_size: usize,
        combo_timeout_secs: i64,
        dedup_cap: usize,
        dedup_ttl_secs: u64,
        small_gift_threshold: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            buffer,
            combo: Mutex::new(ComboBuffer::new()),
            l1_dedup: Mutex::new((HashMap::new(), VecDeque::new())),
            max_buffer_size,
            combo_timeout_secs,
            dedup_cap,
            dedup_ttl_secs,
            small_gift_threshold,
            eviction_task: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawns the 1s periodic eviction task. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.evict_stale().await;
                    }
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
        let eviction_task = self.eviction_task.clone();
        tokio::spawn(async move {
            *eviction_task.lock().await = Some(handle);
        });
    }

    /// Fingerprint dedup: `(trace_id, combo_count, repeat_end)`. Empty
    /// `trace_id` skips dedup entirely. Fail-open on cache error.
    async fn is_duplicate(&self, event: &GiftEvent) -> bool {
        let trace_id = match &event.trace_id {
            Some(t) if !t.is_empty() => t,
            _ => return false,
        };
        let fingerprint = format!("{trace_id}:{}:{}", event.combo_count, event.repeat_end);

        if self.l1_dedup.lock().0.contains_key(&fingerprint) {
            return true;
        }

        let key = DurableBuffer::dedup_key(&fingerprint);
        match self.buffer.set_if_absent(&key, self.dedup_ttl_secs).await {
            Ok(true) => false,
            Ok(false) => {
                self.remember_l1(fingerprint);
                true
            }
            Err(e) => {
                warn!(error = %e, "dedup cache unreachable, failing open (not duplicate)");
                false
            }
        }
    }

    fn remember_l1(&self, fingerprint: String) {
        let mut guard = self.l1_dedup.lock();
        let (map, order) = &mut *guard;
        if map.len() >= self.dedup_cap {
            if let Some(oldest) = order.pop_front() {
                map.remove(&oldest);
            }
        }
        order.push_back(fingerprint.clone());
        map.insert(fingerprint, ());
    }

    /// Entry point: a decoded gift frame from a Session's event handler.
    pub async fn handle_gift(&self, mut event: GiftEvent, icon_url: &str) -> Result<()> {
        if self.is_duplicate(&event).await {
            debug!(trace_id = ?event.trace_id, "duplicate gift frame discarded");
            return Ok(());
        }

        if is_badge_gift(&event.gift_id, &event.gift_name) {
            let mut inc = HashMap::new();
            inc.insert("fans_ticket_count", 1i64);
            if event.diamond_count > 0 {
                inc.insert("total_diamond_count", event.diamond_count);
            }
            self.store.increment_room_stats(&event.room_id, &inc).await?;
            return Ok(());
        }

        event.diamond_count = corrected_diamond_count(&event.gift_name, event.diamond_count, icon_url);

        if event.diamond_count < self.small_gift_threshold {
            if !event.repeat_end {
                return Ok(());
            }
            event.total_diamond_count = Some(event.compute_total());
            return self.store.buffer_gift(&event).await;
        }

        self.handle_large_gift(event).await
    }

    async fn handle_large_gift(&self, event: GiftEvent) -> Result<()> {
        let key = (
            event.sender_id.clone(),
            event.gift_id.clone(),
            event.group_id.clone(),
        );

        let to_evict = {
            let mut combo = self.combo.lock();
            if let Some(existing) = combo.entries.get_mut(&key) {
                existing.max_combo = existing.max_combo.max(event.combo_count);
                existing.max_group_count = existing.max_group_count.max(event.group_count);
                existing.last_update = Utc::now();
                existing.event.combo_count = existing.max_combo;
                existing.event.group_count = existing.max_group_count;
                if event.repeat_end {
                    existing.force_flush = true;
                }
                combo.touch(&key);
                None
            } else {
                let force_flush = event.repeat_end;
                combo.insert_new(
                    key,
                    ComboEntry {
                        max_combo: event.combo_count,
                        max_group_count: event.group_count,
                        last_update: Utc::now(),
                        force_flush,
                        event,
                    },
                    self.max_buffer_size,
                )
            }
        };

        if let Some(entry) = to_evict {
            self.flush_entry(entry).await;
        }
        Ok(())
    }

    async fn flush_entry(&self, entry: ComboEntry) {
        if entry.max_combo <= 0 {
            return;
        }
        let mut event = entry.event;
        event.combo_count = entry.max_combo;
        event.group_count = entry.max_group_count.max(1);
        event.total_diamond_count = Some(event.compute_total());
        if let Err(e) = self.store.buffer_gift(&event).await {
            warn!(error = %e, "combo-buffer flush failed, entry dropped");
        }
    }

    /// Periodic eviction: entries that are force-flushed or stale beyond the
    /// combo timeout get removed and flushed. Runs every 1s.
    async fn evict_stale(&self) {
        let now = Utc::now();
        let ready: Vec<ComboEntry> = {
            let mut combo = self.combo.lock();
            let mut keys_to_remove = Vec::new();
            for (key, entry) in combo.entries.iter() {
                let stale = (now - entry.last_update).num_seconds() > self.combo_timeout_secs;
                if entry.force_flush || stale {
                    keys_to_remove.push(key.clone());
                }
            }
            keys_to_remove
                .into_iter()
                .filter_map(|k| combo.remove(&k))
                .collect()
        };
        for entry in ready {
            self.flush_entry(entry).await;
        }
    }

    /// Cancel the periodic task, then flush all remaining entries
    /// concurrently.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.eviction_task.lock().await.take() {
            let _ = handle.await;
        }
        let remaining: Vec<ComboEntry> = {
            let mut combo = self.combo.lock();
            combo.drain_all()
        };
        let flushes = remaining.into_iter().map(|entry| self.flush_entry(entry));
        futures_util::future::join_all(flushes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badge_gift_detected_by_id() {
        assert!(is_badge_gift("685", "anything"));
    }

    #[test]
    fn badge_gift_detected_by_name_substring() {
        assert!(is_badge_gift("1", "粉丝团灯牌"));
    }

    #[test]
    fn non_badge_gift_not_flagged() {
        assert!(!is_badge_gift("1", "玫瑰"));
    }

    #[test]
    fn sports_car_with_diamond_icon_forces_price() {
        let price = corrected_diamond_count("跑车", 99, "https://cdn/diamond_paoche_icon.png");
        assert_eq!(price, 1500);
    }

    #[test]
    fn sports_car_without_diamond_icon_keeps_reported_price() {
        let price = corrected_diamond_count("跑车", 99, "https://cdn/plain_car.png");
        assert_eq!(price, 99);
    }

    #[test]
    fn known_override_wins_over_reported_price() {
        let price = corrected_diamond_count("钻石嘉年华", 1, "https://cdn/x.png");
        assert_eq!(price, 36000);
    }

    #[test]
    fn unknown_gift_keeps_reported_price() {
        let price = corrected_diamond_count("玫瑰", 1, "https://cdn/x.png");
        assert_eq!(price, 1);
    }
}

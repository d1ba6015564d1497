//! Store Writer: upserts and time-series inserts against MongoDB, fronted by
//! the Durable Buffer's three queues. Gifts/chats/stats are never inserted
//! directly from a Session — they're appended to a queue, then flushed here
//! in batches. See `SPEC_FULL.md` §4.B for the per-queue flush algorithms;
//! this file implements them close to line-for-line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::{self, Bson, doc, Document};
use mongodb::options::{IndexOptions, TimeseriesOptions, TimeseriesGranularity};
use mongodb::{Client, Collection, Database, IndexModel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{DurableBuffer, QUEUE_CHATS, QUEUE_GIFTS, QUEUE_STATS};
use crate::core::{Broadcaster, ChatEvent, GiftEvent, IngestError, Result, Room, RoomStatsUpdate};

const GIFT_FLUSH_CAP: usize = 1000;
const STAT_FLUSH_CAP: usize = 500;
const PERIODIC_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct StoreWriter {
    db: Database,
    rooms: Collection<Document>,
    broadcasters: Collection<Document>,
    battles: Collection<Document>,
    gifts: Collection<Document>,
    chats: Collection<Document>,
    stats: Collection<Document>,
    buffer: Arc<DurableBuffer>,
    chat_batch_size: usize,
    gift_batch_size: usize,
    stat_batch_size: usize,
    buffer_timeout_secs: i64,
    /// Shared across all three flush paths by design (SPEC_FULL §9 "shared
    /// LAST_WRITE_TIME" open question) — a fresh chat flush can suppress a
    /// stat-size-based trigger elsewhere. Preserved, not "fixed".
    last_write_time: AtomicI64,
}

impl StoreWriter {
    pub async fn connect(
        mongo_url: &str,
        db_name: &str,
        buffer: Arc<DurableBuffer>,
        chat_batch_size: usize,
        gift_batch_size: usize,
        stat_batch_size: usize,
        buffer_timeout_secs: i64,
    ) -> Result<Self> {
        let client = Client::with_uri_str(mongo_url).await?;
        let db = client.database(db_name);
        let writer = Self {
            rooms: db.collection("rooms"),
            broadcasters: db.collection("broadcasters"),
            battles: db.collection("battles"),
            gifts: db.collection("gifts"),
            chats: db.collection("chats"),
            stats: db.collection("stats"),
            db,
            buffer,
            chat_batch_size,
            gift_batch_size,
            stat_batch_size,
            buffer_timeout_secs,
            last_write_time: AtomicI64::new(Utc::now().timestamp()),
        };
        writer.init_indexes().await?;
        Ok(writer)
    }

    /// Idempotent: safe to call on every startup. Time-series collections
    /// and indexes both tolerate "already exists".
    async fn init_indexes(&self) -> Result<()> {
        for (name, time_field) in [
            ("gifts", "event_time"),
            ("chats", "insert_time"),
            ("stats", "event_time"),
        ] {
            let opts = TimeseriesOptions::builder()
                .time_field(time_field.to_string())
                .meta_field(Some("web_rid".to_string()))
                .granularity(Some(TimeseriesGranularity::Seconds))
                .build();
            let result = self
                .db
                .create_collection(name)
                .timeseries(opts)
                .await;
            if let Err(e) = result {
                debug!(collection = name, error = %e, "time-series collection create skipped (likely exists)");
            }
        }

        let unique = IndexOptions::builder().unique(true).build();

        let _ = self
            .broadcasters
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "sec_uid": 1 })
                    .options(unique.clone())
                    .build(),
            )
            .await;
        let _ = self
            .battles
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "battle_id": 1, "room_id": 1 })
                    .options(unique)
                    .build(),
            )
            .await;
        let _ = self
            .gifts
            .create_index(IndexModel::builder().keys(doc! { "room_id": 1, "event_time": 1 }).build())
            .await;
        let _ = self
            .gifts
            .create_index(IndexModel::builder().keys(doc! { "room_id": 1, "sender_id": 1 }).build())
            .await;
        let _ = self
            .gifts
            .create_index(IndexModel::builder().keys(doc! { "room_id": 1, "gift_name": 1 }).build())
            .await;
        let _ = self
            .gifts
            .create_index(IndexModel::builder().keys(doc! { "sender_id": 1 }).build())
            .await;
        let _ = self
            .chats
            .create_index(IndexModel::builder().keys(doc! { "room_id": 1, "insert_time": 1 }).build())
            .await;

        Ok(())
    }

    // ---- Room operations --------------------------------------------

    /// `$set` mutable fields, `$setOnInsert created_at`/`start_follower_count`.
    /// `created_at` must never appear in the `$set` map — enforced here by
    /// construction, not by a runtime check.
    pub async fn save_room_info(&self, room: &Room) -> Result<()> {
        let now = Bson::from(Utc::now());
        let mut set = doc! {
            "updated_at": now.clone(),
        };
        if let Some(v) = &room.web_rid {
            set.insert("web_rid", v);
        }
        if let Some(v) = &room.sec_uid {
            set.insert("sec_uid", v);
        }
        if let Some(v) = &room.nickname {
            set.insert("nickname", v);
        }
        if let Some(v) = &room.avatar {
            set.insert("avatar", v);
        }
        if let Some(v) = &room.cover {
            set.insert("cover", v);
        }
        if room.live_status != 0 {
            set.insert("live_status", room.live_status);
        }

        let update = doc! {
            "$set": set,
            "$setOnInsert": {
                "created_at": now,
                "start_follower_count": room.start_follower_count,
            },
        };
        self.rooms
            .update_one(doc! { "room_id": &room.room_id }, update)
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn mark_room_ended(&self, room_id: &str) -> Result<()> {
        let now = Bson::from(Utc::now());
        self.rooms
            .update_one(
                doc! { "room_id": room_id },
                doc! { "$set": { "live_status": 4, "end_time": now.clone(), "updated_at": now } },
            )
            .await?;
        Ok(())
    }

    pub async fn update_room_realtime(
        &self,
        room_id: &str,
        live_status: i32,
        current_follower_count: i64,
    ) -> Result<()> {
        let mut set = doc! { "live_status": live_status, "updated_at": Bson::from(Utc::now()) };
        if current_follower_count > 0 {
            let start = self
                .rooms
                .find_one(doc! { "room_id": room_id })
                .await?
                .and_then(|d| d.get_i64("start_follower_count").ok())
                .unwrap_or(0);
            set.insert("current_follower_count", current_follower_count);
            set.insert("follower_diff", current_follower_count - start);
        }
        self.rooms
            .update_one(doc! { "room_id": room_id }, doc! { "$set": set })
            .await?;
        Ok(())
    }

    pub async fn update_room_stats(&self, room_id: &str, stats: &RoomStatsUpdate) -> Result<()> {
        let mut set = doc! {};
        if let Some(v) = stats.user_count {
            set.insert("user_count", v);
        }
        if let Some(v) = stats.total_user_count {
            set.insert("total_user_count", v);
        }
        if let Some(v) = &stats.ranks {
            set.insert("ranks", bson::to_bson(v)?);
        }
        if let Some(v) = stats.like_count {
            set.insert("like_count", v);
        }
        if set.is_empty() {
            return Ok(());
        }
        let mut update = doc! { "$set": set };
        if let Some(user_count) = stats.user_count {
            update.insert("$max", doc! { "max_viewers": user_count });
        }
        self.rooms
            .update_one(doc! { "room_id": room_id }, update)
            .await?;
        Ok(())
    }

    pub async fn increment_room_stats(&self, room_id: &str, inc: &HashMap<&str, i64>) -> Result<()> {
        let mut inc_doc = doc! {};
        for (k, v) in inc {
            inc_doc.insert(*k, *v);
        }
        self.rooms
            .update_one(
                doc! { "room_id": room_id },
                doc! { "$inc": inc_doc, "$set": { "updated_at": Bson::from(Utc::now()) } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn save_broadcaster_card(&self, card: &Broadcaster) -> Result<()> {
        let mut set = doc! { "updated_at": Bson::from(Utc::now()), "live_status": card.live_status };
        if let Some(v) = &card.web_rid {
            set.insert("web_rid", v);
        }
        if let Some(v) = &card.self_web_rid {
            set.insert("self_web_rid", v);
        }
        if let Some(v) = &card.nickname {
            set.insert("nickname", v);
        }
        if let Some(v) = &card.avatar {
            set.insert("avatar", v);
        }
        if let Some(v) = &card.signature {
            set.insert("signature", v);
        }
        if let Some(v) = card.follower_count {
            set.insert("follower_count", v);
        }
        self.broadcasters
            .update_one(doc! { "sec_uid": &card.sec_uid }, doc! { "$set": set })
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn save_battle_result(&self, battle: &crate::core::BattleResult) -> Result<()> {
        let doc = bson::to_document(battle)?;
        self.battles
            .update_one(
                doc! { "battle_id": &battle.battle_id, "room_id": &battle.room_id },
                doc! { "$set": doc },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn get_room_live_status(&self, room_id: &str) -> Result<i32> {
        let doc = self.rooms.find_one(doc! { "room_id": room_id }).await?;
        Ok(doc.and_then(|d| d.get_i32("live_status").ok()).unwrap_or(0))
    }

    /// A discovery response for a live broadcaster sometimes omits
    /// `web_rid`; the Supervisor falls back to whatever `self_web_rid` was
    /// recorded for that `sec_uid` on an earlier pass.
    pub async fn get_broadcaster_self_web_rid(&self, sec_uid: &str) -> Result<Option<String>> {
        let doc = self
            .broadcasters
            .find_one(doc! { "sec_uid": sec_uid })
            .await?;
        Ok(doc.and_then(|d| d.get_str("self_web_rid").ok().map(str::to_string)))
    }

    /// `updateMany` via aggregation pipeline so `end_time` can reference the
    /// document's own `updated_at` field.
    pub async fn clear_zombie_rooms(&self, timeout_secs: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout_secs);
        let pipeline = vec![doc! {
            "$set": {
                "live_status": 4,
                "end_time": "$updated_at",
                "end_reason": "zombie_cleanup",
            }
        }];
        let result = self
            .rooms
            .update_many(
                doc! { "live_status": 1, "updated_at": { "$lt": Bson::from(cutoff) } },
                pipeline,
            )
            .await?;
        Ok(result.modified_count)
    }

    // ---- Buffered writes ----------------------------------------------

    pub async fn buffer_chat(&self, event: &ChatEvent) -> Result<()> {
        let bytes = serde_json::to_vec(event)?;
        self.buffer.append(QUEUE_CHATS, &bytes).await?;
        if self.should_flush(QUEUE_CHATS, self.chat_batch_size).await? {
            self.flush_chats().await?;
        }
        Ok(())
    }

    pub async fn buffer_gift(&self, event: &GiftEvent) -> Result<()> {
        let bytes = serde_json::to_vec(event)?;
        self.buffer.append(QUEUE_GIFTS, &bytes).await?;
        if self.should_flush(QUEUE_GIFTS, self.gift_batch_size).await? {
            self.flush_gifts().await?;
        }
        Ok(())
    }

    pub async fn buffer_stat(&self, record: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.buffer.append(QUEUE_STATS, &bytes).await?;
        if self.should_flush(QUEUE_STATS, self.stat_batch_size).await? {
            self.flush_stats().await?;
        }
        Ok(())
    }

    async fn should_flush(&self, queue: &str, batch_size: usize) -> Result<bool> {
        let len = self.buffer.len(queue).await?;
        if len >= batch_size {
            return Ok(true);
        }
        let now = Utc::now().timestamp();
        let last = self.last_write_time.load(Ordering::Relaxed);
        Ok(now - last > self.buffer_timeout_secs)
    }

    fn mark_flushed(&self) {
        self.last_write_time.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Normative critical path: pop up to 1000, insert unordered, roll the
    /// raw batch back to the queue tail on insert failure, best-effort
    /// `$inc total_diamond_count` per room.
    pub async fn flush_gifts(&self) -> Result<()> {
        let raw = self.buffer.pop_front(QUEUE_GIFTS, GIFT_FLUSH_CAP).await?;
        if raw.is_empty() {
            return Ok(());
        }

        let mut docs = Vec::with_capacity(raw.len());
        for bytes in &raw {
            match serde_json::from_slice::<GiftEvent>(bytes) {
                Ok(event) => docs.push(event),
                Err(e) => warn!(error = %e, "dropping malformed gift record"),
            }
        }

        let bson_docs: Vec<Document> = docs
            .iter()
            .filter_map(|event| bson::to_document(event).ok())
            .collect();

        if !bson_docs.is_empty() {
            if let Err(e) = self.gifts.insert_many(bson_docs).await {
                warn!(error = %e, "gift batch insert failed, rolling back to queue");
                self.buffer.push_back_many(QUEUE_GIFTS, &raw).await?;
                return Ok(());
            }
        }

        self.mark_flushed();

        let mut per_room: HashMap<String, i64> = HashMap::new();
        for event in &docs {
            let total = event.total_diamond_count.unwrap_or_else(|| event.compute_total());
            *per_room.entry(event.room_id.clone()).or_insert(0) += total;
        }
        for (room_id, sum) in per_room {
            let mut inc = HashMap::new();
            inc.insert("total_diamond_count", sum);
            if let Err(e) = self.increment_room_stats(&room_id, &inc).await {
                warn!(room_id, error = %e, "gift room-aggregate increment failed (best-effort, detail already durable)");
            }
        }
        Ok(())
    }

    /// Range-then-delete, not a bulk pop, because chat batches may exceed a
    /// single pop cap. No rollback on insert failure by design (SPEC_FULL
    /// §9): chat loss is tolerable, re-queuing risks unbounded growth.
    pub async fn flush_chats(&self) -> Result<()> {
        let raw = self.buffer.range_and_delete(QUEUE_CHATS).await?;
        if raw.is_empty() {
            return Ok(());
        }

        let mut docs = Vec::with_capacity(raw.len());
        for bytes in &raw {
            match serde_json::from_slice::<ChatEvent>(bytes) {
                Ok(event) => docs.push(event),
                Err(e) => warn!(error = %e, "dropping malformed chat record"),
            }
        }

        let bson_docs: Vec<Document> = docs
            .iter()
            .filter_map(|event| bson::to_document(event).ok())
            .collect();

        if !bson_docs.is_empty() {
            if let Err(e) = self.chats.insert_many(bson_docs).await {
                warn!(error = %e, "chat batch insert failed, dropping (no rollback by design)");
                return Ok(());
            }
        }

        self.mark_flushed();

        let mut per_room: HashMap<String, i64> = HashMap::new();
        for event in &docs {
            *per_room.entry(event.room_id.clone()).or_insert(0) += 1;
        }
        for (room_id, count) in per_room {
            let mut inc = HashMap::new();
            inc.insert("total_chat_count", count);
            if let Err(e) = self.increment_room_stats(&room_id, &inc).await {
                warn!(room_id, error = %e, "chat count increment failed");
            }
        }
        Ok(())
    }

    /// On failure, restore at the head so the next flush retries the same
    /// records first.
    pub async fn flush_stats(&self) -> Result<()> {
        let raw = self.buffer.pop_front(QUEUE_STATS, STAT_FLUSH_CAP).await?;
        if raw.is_empty() {
            return Ok(());
        }

        let mut docs = Vec::with_capacity(raw.len());
        for bytes in &raw {
            match serde_json::from_slice::<serde_json::Value>(bytes) {
                Ok(value) => docs.push(value),
                Err(e) => warn!(error = %e, "dropping malformed stat record"),
            }
        }

        let bson_docs: Vec<Document> = docs
            .iter()
            .filter_map(|value| bson::to_document(value).ok())
            .collect();

        if !bson_docs.is_empty() {
            if let Err(e) = self.stats.insert_many(bson_docs).await {
                warn!(error = %e, "stat batch insert failed, rolling back to queue head");
                self.buffer.push_front_many(QUEUE_STATS, &raw).await?;
                return Ok(());
            }
        }
        self.mark_flushed();
        Ok(())
    }

    /// Ambient reliability supplement (SPEC_FULL §4.B): producers already
    /// trigger a flush on every enqueue once a queue crosses its batch size
    /// or timeout, but a room that rarely buffers anything could otherwise
    /// sit unflushed indefinitely. This ticks all three flush paths on a
    /// fixed 5s period regardless of queue size, bounding worst-case
    /// latency for low-traffic rooms. Cancellable via the token handed in;
    /// `main.rs` stops it before the final on-shutdown flush.
    pub fn start_periodic_flush(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERIODIC_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.flush_gifts().await {
                            warn!(error = %e, "periodic gift flush failed");
                        }
                        if let Err(e) = this.flush_chats().await {
                            warn!(error = %e, "periodic chat flush failed");
                        }
                        if let Err(e) = this.flush_stats().await {
                            warn!(error = %e, "periodic stat flush failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub async fn close(&self) {
        // mongodb::Client has no explicit async close in the driver we
        // target; dropping the handle is sufficient. Kept as a symmetric
        // call site with DurableBuffer::close() for the shutdown sequence.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gift_room_aggregate_sums_multiple_senders() {
        let mut per_room: HashMap<String, i64> = HashMap::new();
        let events = vec![
            ("room1".to_string(), 10i64),
            ("room1".to_string(), 20i64),
            ("room2".to_string(), 5i64),
        ];
        for (room, total) in events {
            *per_room.entry(room).or_insert(0) += total;
        }
        assert_eq!(per_room["room1"], 30);
        assert_eq!(per_room["room2"], 5);
    }
}

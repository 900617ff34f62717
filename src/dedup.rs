//! Dedup gate for channel message refs.
//!
//! Channels retry webhook deliveries, so the same ref arrives more than once
//! under normal operation. Two layers suppress reprocessing: a bounded
//! in-memory LRU of recently seen refs, and a durable existence check
//! against stored messages for refs that predate the current process. A seen
//! ref is dropped silently; this is at-most-once per known ref, not
//! exactly-once across crashes.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::store::{Store, StoreError};

pub struct DedupGate {
    seen: Mutex<LruCache<String, ()>>,
}

impl DedupGate {
    /// `capacity` bounds the in-memory layer; the oldest ref is evicted once
    /// the cap is exceeded.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Mark-and-test across both layers. Returns `false` when the ref was
    /// already seen and the message must be dropped.
    pub fn should_process(&self, store: &Store, channel_ref: &str) -> Result<bool, StoreError> {
        {
            let mut seen = self.seen.lock();
            if seen.get(channel_ref).is_some() {
                return Ok(false);
            }
        }

        // The cache may have been reset by a restart; the stored messages
        // are the durable record.
        if store.message_ref_exists(channel_ref)? {
            self.seen.lock().put(channel_ref.to_string(), ());
            return Ok(false);
        }

        self.seen.lock().put(channel_ref.to_string(), ());
        Ok(true)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewMessage, SenderType};
    use chrono::Utc;

    fn empty_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn first_sighting_processes() {
        let store = empty_store();
        let gate = DedupGate::new(10);
        assert!(gate.should_process(&store, "wamid.1").unwrap());
    }

    #[test]
    fn second_sighting_drops() {
        let store = empty_store();
        let gate = DedupGate::new(10);
        assert!(gate.should_process(&store, "wamid.1").unwrap());
        assert!(!gate.should_process(&store, "wamid.1").unwrap());
    }

    #[test]
    fn durable_layer_survives_cache_reset() {
        let store = empty_store();
        let bot = crate::store::BotConfig {
            id: "bot-1".into(),
            tenant_id: "tenant-1".into(),
            name: "Support".into(),
            system_prompt: "Be concise".into(),
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 1024,
            api_key: None,
            phone_number_id: None,
            api_token: None,
            verify_token: None,
            app_secret: None,
        };
        store.create_bot_config(&bot).unwrap();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let conversation = store.create_conversation(&client.id, "bot-1").unwrap();
        store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                sender_type: SenderType::Client,
                content: "hola".into(),
                channel_ref: Some("wamid.persisted".into()),
                metadata: None,
                timestamp: Utc::now(),
            })
            .unwrap();

        // Fresh gate models a restarted process.
        let gate = DedupGate::new(10);
        assert!(!gate.should_process(&store, "wamid.persisted").unwrap());
        // And the ref is now cached, so the durable check is skipped next time.
        assert!(!gate.should_process(&store, "wamid.persisted").unwrap());
    }

    #[test]
    fn eviction_is_recency_based() {
        let store = empty_store();
        let gate = DedupGate::new(2);
        assert!(gate.should_process(&store, "a").unwrap());
        assert!(gate.should_process(&store, "b").unwrap());
        assert!(gate.should_process(&store, "c").unwrap());
        assert_eq!(gate.len(), 2);
        // "a" was evicted; with nothing durable it processes again.
        assert!(gate.should_process(&store, "a").unwrap());
        // "c" is still cached.
        assert!(!gate.should_process(&store, "c").unwrap());
    }
}

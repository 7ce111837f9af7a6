use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_PROMPT_CACHE_CAPACITY: usize = 256;

/// Expanded prompt text handed to the image synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive: String,
    pub negative: String,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

/// Content hash binding a prompt text to its history record and image
/// directory. Twelve lowercase hex characters; equal texts always share an id.
pub fn prompt_id(prompt_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt_text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

pub fn is_prompt_id(value: &str) -> bool {
    value.len() == 12
        && value
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
}

#[derive(Debug, Clone)]
struct CachedPrompt {
    pair: PromptPair,
    stored_at: Instant,
}

/// Bounded, content-addressed cache of expanded prompts.
///
/// Keys are prompt ids (see [`prompt_id`]). Least recently used entries are
/// evicted once `capacity` is reached, and entries older than `ttl` are
/// dropped when read.
#[derive(Debug)]
pub struct PromptCache {
    entries: Mutex<LruCache<String, CachedPrompt>>,
    ttl: Option<Duration>,
}

impl PromptCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, id: &str) -> Option<PromptPair> {
        let mut entries = self.entries.lock().ok()?;
        let expired = entries
            .peek(id)
            .zip(self.ttl)
            .map(|(entry, ttl)| entry.stored_at.elapsed() >= ttl)
            .unwrap_or(false);
        if expired {
            entries.pop(id);
            return None;
        }
        entries.get(id).map(|entry| entry.pair.clone())
    }

    pub fn insert(&self, id: impl Into<String>, pair: PromptPair) {
        let Ok(mut entries) = self.entries.lock() else {
            tracing::warn!("prompt cache lock poisoned; dropping insert");
            return;
        };
        entries.put(
            id.into(),
            CachedPrompt {
                pair,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, id: &str) -> Option<PromptPair> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.pop(id))
            .map(|entry| entry.pair)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_CACHE_CAPACITY, None)
    }
}

//! TTL + size-aware response cache with per-agent isolation.
//!
//! Entries are addressed by a public handle `"{agentId}:{id}"` where `id` is
//! 12 URL-safe base64 characters. Eviction picks the entry maximizing
//! `idleMs × sizeBytes`, so large idle entries go first while small hot ones
//! survive.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;

use crate::error::ProxyError;
use crate::mcp::serialized_size;
use crate::stats::ProxyStats;

const CACHE_ID_BYTES: usize = 9; // 9 raw bytes -> 12 base64 chars, no padding

/// Public cache handle: `"{agentId}:{id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    pub agent_id: String,
    pub id: String,
}

impl CacheHandle {
    pub fn parse(handle: &str) -> Option<Self> {
        let (agent_id, id) = handle.split_once(':')?;
        if agent_id.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            agent_id: agent_id.to_string(),
            id: id.to_string(),
        })
    }
}

impl fmt::Display for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.agent_id, self.id)
    }
}

/// One cached response. Content is immutable after insertion.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: String,
    pub agent_id: String,
    pub content: Arc<Vec<Value>>,
    pub source_tool: String,
    pub source_args: Value,
    pub size_bytes: usize,
    pub access_count: u64,
    created_at: Instant,
    last_accessed: Instant,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }

    fn idle(&self, now: Instant) -> Duration {
        now.duration_since(self.last_accessed)
    }

    fn eviction_score(&self, now: Instant) -> u128 {
        let idle_ms = self.idle(now).as_millis();
        idle_ms.saturating_mul(self.size_bytes.max(1) as u128)
    }
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
    Expired,
}

impl CacheLookup {
    pub fn into_result(self, handle: &str) -> Result<CacheEntry, ProxyError> {
        match self {
            Self::Hit(entry) => Ok(entry),
            Self::Miss => Err(ProxyError::CacheMiss(handle.to_string())),
            Self::Expired => Err(ProxyError::CacheExpired(handle.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub agents: usize,
    pub entries: usize,
    pub total_bytes: usize,
}

#[derive(Debug, Default)]
struct AgentCache {
    entries: HashMap<String, CacheEntry>,
}

impl AgentCache {
    fn total_bytes(&self) -> usize {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}

pub struct ResponseCache {
    max_entries_per_agent: usize,
    max_bytes_per_agent: usize,
    ttl: Duration,
    max_agents: usize,
    stats: ProxyStats,
    agents: Mutex<HashMap<String, AgentCache>>,
}

impl ResponseCache {
    pub fn new(
        max_entries_per_agent: usize,
        max_bytes_per_agent: usize,
        ttl: Duration,
        max_agents: usize,
        stats: ProxyStats,
    ) -> Self {
        Self {
            max_entries_per_agent: max_entries_per_agent.max(1),
            max_bytes_per_agent: max_bytes_per_agent.max(1),
            ttl,
            max_agents: max_agents.max(1),
            stats,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `content` for `agent_id`, returning the public handle.
    ///
    /// Sweeps expired entries for the agent, then evicts size-aware-LRU
    /// victims until both per-agent caps hold.
    pub fn put(
        &self,
        agent_id: &str,
        content: Vec<Value>,
        source_tool: &str,
        source_args: Value,
    ) -> Result<CacheHandle, ProxyError> {
        let size_bytes = serialized_size(&content);
        if size_bytes > self.max_bytes_per_agent {
            return Err(ProxyError::CacheFull(format!(
                "entry of {size_bytes} bytes exceeds per-agent limit of {} bytes",
                self.max_bytes_per_agent
            )));
        }

        let now = Instant::now();
        let mut agents = self.lock_agents();

        if !agents.contains_key(agent_id) {
            if agents.len() >= self.max_agents {
                return Err(ProxyError::TooManyAgents(self.max_agents));
            }
            agents.insert(agent_id.to_string(), AgentCache::default());
            tracing::debug!(agent = agent_id, "created agent cache");
        }
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| ProxyError::CacheFull("agent cache vanished".to_string()))?;

        self.sweep_expired(agent, now);

        while agent.entries.len() >= self.max_entries_per_agent
            || agent.total_bytes() + size_bytes > self.max_bytes_per_agent
        {
            if !self.evict_one(agent, now) {
                break;
            }
        }
        if agent.entries.len() >= self.max_entries_per_agent
            || agent.total_bytes() + size_bytes > self.max_bytes_per_agent
        {
            return Err(ProxyError::CacheFull(format!(
                "per-agent limits prevent insertion for agent {agent_id}"
            )));
        }

        let id = generate_cache_id();
        let entry = CacheEntry {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            content: Arc::new(content),
            source_tool: source_tool.to_string(),
            source_args,
            size_bytes,
            access_count: 0,
            created_at: now,
            last_accessed: now,
        };
        agent.entries.insert(id.clone(), entry);
        tracing::debug!(
            agent = agent_id,
            cache_id = %id,
            size_bytes,
            tool = source_tool,
            "cached tool response"
        );

        Ok(CacheHandle {
            agent_id: agent_id.to_string(),
            id,
        })
    }

    /// Look up a handle, updating access metadata on hit.
    ///
    /// Expired entries are removed and reported as `Expired`; unknown agents,
    /// unknown ids, and malformed handles are `Miss`.
    pub fn get(&self, handle: &str) -> CacheLookup {
        let Some(parsed) = CacheHandle::parse(handle) else {
            self.stats.record_cache_miss();
            return CacheLookup::Miss;
        };

        let now = Instant::now();
        let mut agents = self.lock_agents();
        let Some(agent) = agents.get_mut(&parsed.agent_id) else {
            self.stats.record_cache_miss();
            return CacheLookup::Miss;
        };

        let Some(entry) = agent.entries.get_mut(&parsed.id) else {
            self.stats.record_cache_miss();
            return CacheLookup::Miss;
        };

        if entry.age(now) > self.ttl {
            let age = entry.age(now);
            agent.entries.remove(&parsed.id);
            self.stats.record_cache_miss();
            tracing::debug!(cache_id = %handle, ?age, "cache entry expired");
            return CacheLookup::Expired;
        }

        entry.access_count += 1;
        entry.last_accessed = now;
        self.stats.record_cache_hit();
        CacheLookup::Hit(entry.clone())
    }

    /// Remove a specific entry. Returns true if it existed (expired or not).
    pub fn remove(&self, handle: &str) -> bool {
        let Some(parsed) = CacheHandle::parse(handle) else {
            return false;
        };
        let mut agents = self.lock_agents();
        agents
            .get_mut(&parsed.agent_id)
            .map(|agent| agent.entries.remove(&parsed.id).is_some())
            .unwrap_or(false)
    }

    pub fn clear_agent(&self, agent_id: &str) {
        let mut agents = self.lock_agents();
        agents.remove(agent_id);
    }

    pub fn clear_all(&self) {
        let mut agents = self.lock_agents();
        agents.clear();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let agents = self.lock_agents();
        let mut snapshot = CacheStatsSnapshot {
            agents: agents.len(),
            ..Default::default()
        };
        for agent in agents.values() {
            snapshot.entries += agent.entries.len();
            snapshot.total_bytes += agent.total_bytes();
        }
        snapshot
    }

    /// Live entry count for one agent (expired entries excluded lazily).
    pub fn agent_entry_count(&self, agent_id: &str) -> usize {
        let agents = self.lock_agents();
        agents
            .get(agent_id)
            .map(|agent| agent.entries.len())
            .unwrap_or(0)
    }

    fn lock_agents(&self) -> MutexGuard<'_, HashMap<String, AgentCache>> {
        self.agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep_expired(&self, agent: &mut AgentCache, now: Instant) {
        let expired: Vec<String> = agent
            .entries
            .iter()
            .filter(|(_, entry)| entry.age(now) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            agent.entries.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept expired cache entries");
        }
    }

    /// Evict the entry maximizing `idleMs × sizeBytes`; ties go to the least
    /// recently accessed. Returns false when the agent has no entries.
    fn evict_one(&self, agent: &mut AgentCache, now: Instant) -> bool {
        let victim = agent
            .entries
            .values()
            .max_by(|a, b| {
                a.eviction_score(now)
                    .cmp(&b.eviction_score(now))
                    .then_with(|| b.last_accessed.cmp(&a.last_accessed))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|entry| entry.id.clone());

        match victim {
            Some(id) => {
                if let Some(entry) = agent.entries.remove(&id) {
                    self.stats.record_cache_eviction();
                    tracing::debug!(
                        cache_id = %id,
                        idle = ?entry.idle(now),
                        size_bytes = entry.size_bytes,
                        "evicted cache entry"
                    );
                }
                true
            }
            None => false,
        }
    }
}

fn generate_cache_id() -> String {
    let mut bytes = [0u8; CACHE_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

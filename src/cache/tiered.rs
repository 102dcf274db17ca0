// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered cache coordinator.
//!
//! Reads walk the tiers fastest → slowest and copy a hit back into every
//! faster tier. Writes fan out according to the [`WritePolicy`].
//!
//! ```text
//!   get ──► memory ──miss──► local ──miss──► durable ──miss──► None
//!              ▲               │ hit
//!              └── promote ────┘
//! ```
//!
//! Every key is stored under the `cache:` namespace so a backend can be
//! shared with the operation queue without `invalidate(None)` touching
//! queued operations.
//!
//! A tier that runs out of quota gives up its oldest `cache:` entries to
//! make room before the write is retried once. Quota failures that survive
//! eviction are reported to the attached [`ErrorRecoveryManager`].

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::tier::{CacheTier, TierUsage};
use super::{CacheError, CacheMetrics, FlushReport, WritePolicy};
use crate::clock::SharedClock;
use crate::recovery::{ErrorContext, ErrorRecoveryManager, ErrorType};
use crate::storage::traits::entry_size;
use crate::storage::StorageError;

/// Namespace for cache keys inside a tier backend
pub const CACHE_PREFIX: &str = "cache:";

fn storage_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

fn matches(key: &str, pattern: Option<&str>) -> bool {
    pattern.map_or(true, |p| key.contains(p))
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
}

const FENCE_STRIPES: usize = 64;

/// Orders background promotions against writes.
///
/// Writers hold `gate` for their whole mutation and bump the key's stripe
/// before releasing it. A promotion writes under the same gate, and only if
/// the stripe generation still matches the one read before its lookup.
struct PromotionFence {
    gate: tokio::sync::Mutex<()>,
    stripes: Vec<AtomicU64>,
}

impl PromotionFence {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            stripes: (0..FENCE_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn stripe(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % FENCE_STRIPES as u64) as usize
    }

    fn generation(&self, key: &str) -> u64 {
        self.stripes[Self::stripe(key)].load(Ordering::Acquire)
    }

    /// Void in-flight promotions of `key`, or of every key for `None`.
    fn bump(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.stripes[Self::stripe(key)].fetch_add(1, Ordering::AcqRel);
            }
            None => {
                for stripe in &self.stripes {
                    stripe.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }
}

/// Write `raw` to `tier`. On a quota failure the tier's oldest entries are
/// evicted to make room and the write is retried once.
///
/// Returns the number of entries evicted.
async fn write_evicting(tier: &CacheTier, skey: &str, raw: &Value) -> Result<usize, StorageError> {
    let err = match tier.store().write(skey, raw).await {
        Ok(()) => return Ok(0),
        Err(e) => e,
    };
    let shortfall = match err {
        StorageError::CapacityExceeded { needed, available, .. } => needed.saturating_sub(available),
        _ => return Err(err),
    };

    let evicted = evict_oldest(tier, skey, shortfall).await;
    if evicted == 0 {
        return Err(err);
    }
    tier.store().write(skey, raw).await?;
    Ok(evicted)
}

/// Delete the oldest cache entries of `tier` (by write time, `keep` excluded)
/// until `shortfall` bytes are free. Deletes nothing if that's impossible.
async fn evict_oldest(tier: &CacheTier, keep: &str, shortfall: u64) -> usize {
    let keys = match tier.store().keys_with_prefix(CACHE_PREFIX).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(tier = tier.name(), error = %e, "Cannot list keys for eviction");
            return 0;
        }
    };

    let mut candidates: Vec<(i64, u64, String)> = Vec::with_capacity(keys.len());
    for skey in keys {
        if skey == keep {
            continue;
        }
        if let Ok(Some(raw)) = tier.store().read(&skey).await {
            let size = entry_size(&skey, &raw).unwrap_or(0);
            // Unreadable entries go first
            let written = CacheEntry::from_value(raw).map_or(i64::MIN, |e| e.timestamp);
            candidates.push((written, size, skey));
        }
    }
    candidates.sort();

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for (_, size, skey) in candidates {
        if freed >= shortfall {
            break;
        }
        freed += size;
        victims.push(skey);
    }
    if freed < shortfall {
        return 0;
    }

    let mut evicted = 0;
    for skey in victims {
        match tier.store().delete(&skey).await {
            Ok(()) => evicted += 1,
            Err(e) => warn!(key = %skey, tier = tier.name(), error = %e, "Eviction delete failed"),
        }
    }
    if evicted > 0 {
        debug!(tier = tier.name(), evicted, freed, "Evicted oldest cache entries");
        crate::metrics::record_evictions(tier.name(), evicted);
    }
    evicted
}

/// Pending write-back: the sequence number guards against removing an entry
/// that was overwritten while a flush was in progress.
struct PendingWrite {
    seq: u64,
    entry: CacheEntry,
}

pub struct TieredCache {
    tiers: Vec<Arc<CacheTier>>,
    policy: WritePolicy,
    default_ttl: Duration,
    clock: SharedClock,
    counters: Arc<Counters>,
    write_back: Mutex<HashMap<String, PendingWrite>>,
    write_back_seq: AtomicU64,
    fence: Arc<PromotionFence>,
    recovery: RwLock<Option<ErrorRecoveryManager>>,
}

impl TieredCache {
    /// Build a cache over `tiers` (sorted here by ascending priority).
    pub fn new(
        mut tiers: Vec<CacheTier>,
        policy: WritePolicy,
        default_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        tiers.sort_by_key(|t| t.priority());
        for tier in &tiers {
            crate::metrics::set_tier_available(tier.name(), tier.is_available());
        }
        info!(
            tiers = ?tiers.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            ?policy,
            "Tiered cache initialized"
        );

        Self {
            tiers: tiers.into_iter().map(Arc::new).collect(),
            policy,
            default_ttl,
            clock,
            counters: Arc::new(Counters::default()),
            write_back: Mutex::new(HashMap::new()),
            write_back_seq: AtomicU64::new(0),
            fence: Arc::new(PromotionFence::new()),
            recovery: RwLock::new(None),
        }
    }

    /// Report quota failures that eviction couldn't resolve to `recovery`.
    pub fn set_recovery(&self, recovery: ErrorRecoveryManager) {
        *self.recovery.write() = Some(recovery);
    }

    #[must_use]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    #[must_use]
    pub fn tiers(&self) -> &[Arc<CacheTier>] {
        &self.tiers
    }

    #[must_use]
    pub fn tier(&self, name: &str) -> Option<&Arc<CacheTier>> {
        self.tiers.iter().find(|t| t.name() == name)
    }

    /// Switch a tier on or off. Returns false if no tier has that name.
    pub fn set_tier_available(&self, name: &str, available: bool) -> bool {
        match self.tier(name) {
            Some(tier) => {
                if tier.is_available() != available {
                    info!(tier = name, available, "Cache tier availability changed");
                }
                tier.set_available(available);
                true
            }
            None => false,
        }
    }

    fn available(&self) -> Vec<(usize, &Arc<CacheTier>)> {
        self.tiers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_available())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Look `key` up fastest tier first.
    ///
    /// Tier errors and expired or unreadable entries are skipped. A hit is
    /// promoted into every faster available tier in the background.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let generation = self.fence.generation(key);
        match self.lookup(key).await {
            Some((idx, entry)) => {
                self.promote(idx, &entry, generation);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_result(true);
                Some(entry.data)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_result(false);
                None
            }
        }
    }

    /// Typed [`get`](Self::get).
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Whether a live entry exists. Doesn't touch hit/miss counters or promote.
    pub async fn exists(&self, key: &str) -> bool {
        self.lookup(key).await.is_some()
    }

    /// Current value of `key` without counting a request or promoting it.
    pub async fn peek(&self, key: &str) -> Option<Value> {
        self.lookup(key).await.map(|(_, entry)| entry.data)
    }

    async fn lookup(&self, key: &str) -> Option<(usize, CacheEntry)> {
        let skey = storage_key(key);
        let now = self.clock.now_ms();

        for (idx, tier) in self.available() {
            let _timer = crate::metrics::LatencyTimer::new(tier.name(), "get");
            match tier.store().read(&skey).await {
                Ok(Some(raw)) => match CacheEntry::from_value(raw) {
                    Ok(entry) if entry.is_expired(now) => {
                        debug!(key, tier = tier.name(), "Expired cache entry removed on read");
                        crate::metrics::record_cache_lookup(tier.name(), "expired");
                        if let Err(e) = tier.store().delete(&skey).await {
                            warn!(key, tier = tier.name(), error = %e, "Failed to delete expired entry");
                        }
                    }
                    Ok(entry) => {
                        crate::metrics::record_cache_lookup(tier.name(), "hit");
                        return Some((idx, entry));
                    }
                    Err(e) => {
                        warn!(key, tier = tier.name(), error = %e, "Unreadable cache entry removed");
                        crate::metrics::record_cache_lookup(tier.name(), "error");
                        let _ = tier.store().delete(&skey).await;
                    }
                },
                Ok(None) => crate::metrics::record_cache_lookup(tier.name(), "miss"),
                Err(e) => {
                    warn!(key, tier = tier.name(), error = %e, "Cache tier read failed, skipping tier");
                    crate::metrics::record_cache_lookup(tier.name(), "error");
                }
            }
        }
        None
    }

    /// Copy `entry` into every available tier faster than `found_idx`.
    ///
    /// Runs in the background and is dropped if the key was written or
    /// removed after `generation` was read.
    fn promote(&self, found_idx: usize, entry: &CacheEntry, generation: u64) {
        if found_idx == 0 {
            return;
        }
        let targets: Vec<Arc<CacheTier>> = self.tiers[..found_idx]
            .iter()
            .filter(|t| t.is_available())
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let raw = match entry.to_value() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Cannot serialize entry for promotion");
                return;
            }
        };

        let key = entry.key.clone();
        let fence = Arc::clone(&self.fence);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            let _gate = fence.gate.lock().await;
            if fence.generation(&key) != generation {
                debug!(key = %key, "Promotion dropped, key changed since lookup");
                return;
            }
            let skey = storage_key(&key);
            for tier in targets {
                match write_evicting(&tier, &skey, &raw).await {
                    Ok(evicted) => {
                        counters.promotions.fetch_add(1, Ordering::Relaxed);
                        counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        crate::metrics::record_tier_write(tier.name(), "promote", true);
                    }
                    Err(e) => {
                        warn!(key = %skey, tier = tier.name(), error = %e, "Cache promotion failed");
                        crate::metrics::record_tier_write(tier.name(), "promote", false);
                    }
                }
            }
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Store `value` under the configured write policy.
    /// `ttl = None` uses the default TTL.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.set_with_policy(key, value, ttl, self.policy).await
    }

    /// Store `value` under an explicit write policy.
    pub async fn set_with_policy(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        policy: WritePolicy,
    ) -> Result<(), CacheError> {
        let _gate = self.fence.gate.lock().await;
        let result = self.write_entry(key, value, ttl, policy).await;
        self.fence.bump(Some(key));
        result
    }

    async fn write_entry(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        policy: WritePolicy,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(key, value, self.clock.now_ms(), ttl.unwrap_or(self.default_ttl));
        let raw = entry.to_value()?;
        let skey = storage_key(key);

        let available = self.available();
        if available.is_empty() {
            return Err(CacheError::NoTierAvailable);
        }
        let tiers: Vec<&Arc<CacheTier>> = available.iter().map(|(_, t)| *t).collect();

        match policy {
            WritePolicy::WriteThrough => {
                self.cancel_write_back(key);
                self.write_all(&tiers, &skey, &raw).await?;
            }
            WritePolicy::WriteBack => {
                match self.write_one(tiers[0], &skey, &raw).await {
                    Ok(()) => {
                        if tiers.len() > 1 {
                            let seq = self.write_back_seq.fetch_add(1, Ordering::Relaxed);
                            let mut pending = self.write_back.lock();
                            pending.insert(key.to_string(), PendingWrite { seq, entry });
                            crate::metrics::set_write_back_pending(pending.len());
                        }
                    }
                    Err(e) => {
                        warn!(key, tier = tiers[0].name(), error = %e, "Write-back fast tier failed, writing through");
                        self.cancel_write_back(key);
                        self.write_all(&tiers[1..], &skey, &raw).await?;
                    }
                }
            }
            WritePolicy::WriteAround => {
                self.cancel_write_back(key);
                if tiers.len() == 1 {
                    self.write_all(&tiers, &skey, &raw).await?;
                } else {
                    self.write_all(&tiers[1..], &skey, &raw).await?;
                    // A stale copy in the fast tier would shadow the new value
                    if let Err(e) = tiers[0].store().delete(&skey).await {
                        warn!(key, tier = tiers[0].name(), error = %e, "Failed to drop stale fast-tier copy");
                    }
                }
            }
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn write_one(&self, tier: &CacheTier, skey: &str, raw: &Value) -> Result<(), StorageError> {
        let _timer = crate::metrics::LatencyTimer::new(tier.name(), "set");
        let result = write_evicting(tier, skey, raw).await;
        crate::metrics::record_tier_write(tier.name(), "set", result.is_ok());
        match result {
            Ok(evicted) => {
                self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.report_capacity(tier, skey, "set", &e);
                Err(e)
            }
        }
    }

    fn report_capacity(&self, tier: &CacheTier, skey: &str, action: &str, err: &StorageError) {
        if !err.is_capacity() {
            return;
        }
        let recovery = self.recovery.read().clone();
        if let Some(recovery) = recovery {
            recovery.report(
                ErrorType::Storage,
                format!("Cache tier '{}': {}", tier.name(), err),
                ErrorContext::new("cache")
                    .with_action(action)
                    .with_detail("key", skey.trim_start_matches(CACHE_PREFIX))
                    .with_detail("tier", tier.name()),
            );
        }
    }

    /// Write to every tier in `tiers`; fails only if none succeeded.
    async fn write_all(&self, tiers: &[&Arc<CacheTier>], skey: &str, raw: &Value) -> Result<(), CacheError> {
        if tiers.is_empty() {
            return Err(CacheError::NoTierAvailable);
        }

        let mut succeeded = 0;
        let mut last_error = None;
        for tier in tiers {
            match self.write_one(tier, skey, raw).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(key = skey, tier = tier.name(), error = %e, "Cache tier write failed");
                    last_error = Some(e);
                }
            }
        }

        match (succeeded, last_error) {
            (0, Some(source)) => Err(CacheError::AllTiersFailed {
                key: skey.trim_start_matches(CACHE_PREFIX).to_string(),
                source,
            }),
            _ => Ok(()),
        }
    }

    fn cancel_write_back(&self, key: &str) {
        let mut pending = self.write_back.lock();
        if pending.remove(key).is_some() {
            crate::metrics::set_write_back_pending(pending.len());
        }
    }

    /// Number of entries waiting for the write-back flusher.
    #[must_use]
    pub fn write_back_pending(&self) -> usize {
        self.write_back.lock().len()
    }

    /// Push pending write-back entries into the slower tiers.
    ///
    /// An entry leaves the queue only once every slower available tier
    /// accepted it; anything else waits for the next cycle, including every
    /// entry while no slower tier is available. Entries that expired while
    /// waiting are dropped.
    pub async fn flush_write_back(&self) -> FlushReport {
        let snapshot: Vec<(String, u64, CacheEntry)> = self
            .write_back
            .lock()
            .iter()
            .map(|(k, p)| (k.clone(), p.seq, p.entry.clone()))
            .collect();

        let mut report = FlushReport::default();
        if snapshot.is_empty() {
            return report;
        }

        let now = self.clock.now_ms();
        let available = self.available();
        let slower: Vec<&Arc<CacheTier>> = available.iter().filter(|(idx, _)| *idx > 0).map(|(_, t)| *t).collect();
        if slower.is_empty() {
            debug!(pending = snapshot.len(), "No slower tier available, write-back deferred");
        }

        for (key, seq, entry) in snapshot {
            let done = if entry.is_expired(now) {
                report.expired += 1;
                true
            } else {
                let raw = match entry.to_value() {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Dropping unserializable write-back entry");
                        report.failed += 1;
                        self.remove_pending_if(&key, seq);
                        continue;
                    }
                };
                let skey = storage_key(&key);
                let mut all_ok = !slower.is_empty();
                for tier in &slower {
                    let result = write_evicting(tier, &skey, &raw).await;
                    crate::metrics::record_tier_write(tier.name(), "flush", result.is_ok());
                    match result {
                        Ok(evicted) => {
                            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(key = %key, tier = tier.name(), error = %e, "Write-back flush failed, will retry");
                            self.report_capacity(tier, &skey, "flush", &e);
                            all_ok = false;
                        }
                    }
                }
                if all_ok {
                    report.flushed += 1;
                } else {
                    report.failed += 1;
                }
                all_ok
            };

            if done {
                self.remove_pending_if(&key, seq);
            }
        }

        report.remaining = self.write_back_pending();
        crate::metrics::set_write_back_pending(report.remaining);
        if report.flushed > 0 || report.failed > 0 {
            debug!(
                flushed = report.flushed,
                failed = report.failed,
                remaining = report.remaining,
                "Write-back flush complete"
            );
        }
        report
    }

    fn remove_pending_if(&self, key: &str, seq: u64) {
        let mut pending = self.write_back.lock();
        if pending.get(key).is_some_and(|p| p.seq == seq) {
            pending.remove(key);
        }
    }

    /// Periodic write-back flusher; flushes once more on shutdown.
    pub async fn run_write_back(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_write_back().await;
                    self.purge_expired().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let report = self.flush_write_back().await;
        if report.remaining > 0 {
            warn!(remaining = report.remaining, "Write-back entries left unflushed at shutdown");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Removal
    // ═══════════════════════════════════════════════════════════════════════

    /// Remove one key from every available tier.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _gate = self.fence.gate.lock().await;
        let result = self.delete_entry(key).await;
        self.fence.bump(Some(key));
        result
    }

    async fn delete_entry(&self, key: &str) -> Result<(), CacheError> {
        self.cancel_write_back(key);
        let skey = storage_key(key);
        let mut last_error = None;
        let mut any_ok = false;
        for (_, tier) in self.available() {
            match tier.store().delete(&skey).await {
                Ok(()) => any_ok = true,
                Err(e) => {
                    warn!(key, tier = tier.name(), error = %e, "Cache tier delete failed");
                    last_error = Some(e);
                }
            }
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        match (any_ok, last_error) {
            (false, Some(source)) => Err(CacheError::AllTiersFailed { key: key.to_string(), source }),
            _ => Ok(()),
        }
    }

    /// Remove every key containing `pattern` (every key when `None`) from
    /// all available tiers. Returns the number of distinct keys removed.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        let _gate = self.fence.gate.lock().await;
        let mut removed: HashSet<String> = HashSet::new();

        {
            let mut pending = self.write_back.lock();
            pending.retain(|k, _| {
                let hit = matches(k, pattern);
                if hit {
                    removed.insert(k.clone());
                }
                !hit
            });
            crate::metrics::set_write_back_pending(pending.len());
        }

        for (_, tier) in self.available() {
            let keys = match tier.store().keys_with_prefix(CACHE_PREFIX).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "Cannot list keys for invalidation");
                    continue;
                }
            };
            for skey in keys {
                let key = &skey[CACHE_PREFIX.len()..];
                if !matches(key, pattern) {
                    continue;
                }
                match tier.store().delete(&skey).await {
                    Ok(()) => {
                        removed.insert(key.to_string());
                    }
                    Err(e) => warn!(key, tier = tier.name(), error = %e, "Invalidation delete failed"),
                }
            }
        }

        self.fence.bump(None);
        info!(pattern = ?pattern, removed = removed.len(), "Cache invalidated");
        crate::metrics::record_invalidation(removed.len());
        self.counters.deletes.fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }

    /// Drop everything the cache owns.
    pub async fn clear(&self) -> usize {
        self.invalidate(None).await
    }

    /// Sweep expired entries out of every available tier.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut purged = 0;

        for (_, tier) in self.available() {
            let keys = match tier.store().keys_with_prefix(CACHE_PREFIX).await {
                Ok(keys) => keys,
                Err(e) => {
                    debug!(tier = tier.name(), error = %e, "Skipping tier in expiry sweep");
                    continue;
                }
            };
            for skey in keys {
                let expired = match tier.store().read(&skey).await {
                    Ok(Some(raw)) => CacheEntry::from_value(raw).map_or(true, |e| e.is_expired(now)),
                    _ => false,
                };
                if expired && tier.store().delete(&skey).await.is_ok() {
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            debug!(purged, "Expired cache entries swept");
        }
        purged
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let requests = hits + misses;
        CacheMetrics {
            hits,
            misses,
            requests,
            hit_rate: if requests == 0 { 0.0 } else { hits as f64 / requests as f64 },
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            write_back_pending: self.write_back_pending(),
        }
    }

    /// Usage per tier; unreadable usage reports as 0 used.
    pub async fn tier_usage(&self) -> Vec<TierUsage> {
        let mut out = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            let usage = tier.usage().await.ok();
            let used = usage.map_or(0, |u| u.used);
            let capacity = usage.and_then(|u| u.capacity);
            crate::metrics::set_tier_usage(tier.name(), used, capacity);
            out.push(TierUsage {
                name: tier.name().to_string(),
                priority: tier.priority(),
                available: tier.is_available(),
                used,
                capacity,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::storage::memory::InMemoryStore;
    use crate::storage::KvStore;
    use serde_json::json;

    struct Fixture {
        cache: TieredCache,
        clock: Arc<ManualClock>,
        fast: Arc<InMemoryStore>,
        slow: Arc<InMemoryStore>,
    }

    fn fixture(policy: WritePolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let fast = Arc::new(InMemoryStore::named("memory", None));
        let slow = Arc::new(InMemoryStore::named("durable", None));
        let cache = TieredCache::new(
            vec![
                // Deliberately out of order: new() sorts by priority
                CacheTier::new("durable", 2, slow.clone()),
                CacheTier::new("memory", 0, fast.clone()),
            ],
            policy,
            Duration::from_secs(60),
            clock.clone(),
        );
        Fixture { cache, clock, fast, slow }
    }

    async fn settle() {
        // Let spawned promotions run
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_tiers_sorted_by_priority() {
        let f = fixture(WritePolicy::WriteThrough);
        let names: Vec<&str> = f.cache.tiers().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["memory", "durable"]);
    }

    #[tokio::test]
    async fn test_write_through_writes_every_tier() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("user:1", json!({"name": "A"}), None).await.unwrap();

        assert!(f.fast.read("cache:user:1").await.unwrap().is_some());
        assert!(f.slow.read("cache:user:1").await.unwrap().is_some());
        assert_eq!(f.cache.get("user:1").await, Some(json!({"name": "A"})));
    }

    #[tokio::test]
    async fn test_ttl_expiry_with_manual_clock() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("k", json!("v"), Some(Duration::from_millis(100))).await.unwrap();

        f.clock.advance_ms(50);
        assert_eq!(f.cache.get("k").await, Some(json!("v")));

        f.clock.advance_ms(100);
        assert_eq!(f.cache.get("k").await, None);

        // Lazily deleted from both tiers on that read
        assert!(f.fast.read("cache:k").await.unwrap().is_none());
        assert!(f.slow.read("cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hit_in_slow_tier_promotes() {
        let f = fixture(WritePolicy::WriteThrough);
        let entry = CacheEntry::new("deck:7", json!([1, 2, 3]), f.clock.now_ms(), Duration::from_secs(60));
        f.slow.write("cache:deck:7", &entry.to_value().unwrap()).await.unwrap();

        assert_eq!(f.cache.get("deck:7").await, Some(json!([1, 2, 3])));
        settle().await;

        let promoted = f.fast.read("cache:deck:7").await.unwrap().unwrap();
        // Promotion keeps the original write time
        assert_eq!(CacheEntry::from_value(promoted).unwrap().timestamp, entry.timestamp);
        assert_eq!(f.cache.metrics().promotions, 1);
    }

    #[tokio::test]
    async fn test_hit_rate_counts() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("a", json!(1), None).await.unwrap();

        f.cache.get("a").await;
        f.cache.get("a").await;
        f.cache.get("a").await;
        f.cache.get("missing").await;

        let m = f.cache.metrics();
        assert_eq!(m.hits, 3);
        assert_eq!(m.misses, 1);
        assert_eq!(m.requests, 4);
        assert!((m.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unavailable_tier_is_skipped() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("user:1", json!({"name": "A"}), None).await.unwrap();

        assert!(f.cache.set_tier_available("durable", false));
        assert_eq!(f.cache.get("user:1").await, Some(json!({"name": "A"})));

        f.cache.set("user:2", json!({"name": "B"}), None).await.unwrap();
        assert!(f.slow.read("cache:user:2").await.unwrap().is_none());

        assert!(!f.cache.set_tier_available("nope", false));
    }

    #[tokio::test]
    async fn test_no_available_tier_is_an_error() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set_tier_available("memory", false);
        f.cache.set_tier_available("durable", false);

        let err = f.cache.set("k", json!(1), None).await.unwrap_err();
        assert!(matches!(err, CacheError::NoTierAvailable));
        assert_eq!(f.cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_write_through_tolerates_partial_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let tiny = Arc::new(InMemoryStore::with_capacity(8));
        let roomy = Arc::new(InMemoryStore::new());
        let cache = TieredCache::new(
            vec![CacheTier::new("memory", 0, tiny), CacheTier::new("durable", 1, roomy.clone())],
            WritePolicy::WriteThrough,
            Duration::from_secs(60),
            clock,
        );

        cache.set("big", json!("does not fit in eight bytes"), None).await.unwrap();
        assert!(roomy.read("cache:big").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_through_all_fail() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = TieredCache::new(
            vec![CacheTier::new("memory", 0, Arc::new(InMemoryStore::with_capacity(8)))],
            WritePolicy::WriteThrough,
            Duration::from_secs(60),
            clock,
        );

        let err = cache.set("big", json!("does not fit"), None).await.unwrap_err();
        match err {
            CacheError::AllTiersFailed { key, source } => {
                assert_eq!(key, "big");
                assert!(source.is_capacity());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_write_back_defers_slow_tiers() {
        let f = fixture(WritePolicy::WriteBack);
        f.cache.set("progress", json!({"streak": 3}), None).await.unwrap();

        assert!(f.fast.read("cache:progress").await.unwrap().is_some());
        assert!(f.slow.read("cache:progress").await.unwrap().is_none());
        assert_eq!(f.cache.write_back_pending(), 1);

        let report = f.cache.flush_write_back().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(report.remaining, 0);
        assert!(f.slow.read("cache:progress").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_back_keeps_failed_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let fast = Arc::new(InMemoryStore::new());
        let slow = Arc::new(InMemoryStore::with_capacity(10));
        let cache = TieredCache::new(
            vec![CacheTier::new("memory", 0, fast), CacheTier::new("durable", 1, slow)],
            WritePolicy::WriteBack,
            Duration::from_secs(60),
            clock,
        );

        cache.set("big", json!("larger than ten bytes"), None).await.unwrap();
        let report = cache.flush_write_back().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(cache.write_back_pending(), 1);
    }

    #[tokio::test]
    async fn test_write_back_waits_while_slow_tier_is_down() {
        let f = fixture(WritePolicy::WriteBack);
        f.cache.set("k", json!("v"), None).await.unwrap();
        f.cache.set_tier_available("durable", false);

        let report = f.cache.flush_write_back().await;
        assert_eq!(report.flushed, 0);
        assert_eq!(report.remaining, 1);

        f.cache.set_tier_available("durable", true);
        let report = f.cache.flush_write_back().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(report.remaining, 0);
        assert!(f.slow.read("cache:k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_back_drops_expired_entries() {
        let f = fixture(WritePolicy::WriteBack);
        f.cache.set("k", json!(1), Some(Duration::from_millis(10))).await.unwrap();
        f.clock.advance_ms(100);

        let report = f.cache.flush_write_back().await;
        assert_eq!(report.expired, 1);
        assert_eq!(f.cache.write_back_pending(), 0);
        assert!(f.slow.read("cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_through_supersedes_pending_write_back() {
        let f = fixture(WritePolicy::WriteBack);
        f.cache.set("k", json!("old"), None).await.unwrap();
        f.cache.set_with_policy("k", json!("new"), None, WritePolicy::WriteThrough).await.unwrap();

        assert_eq!(f.cache.write_back_pending(), 0);
        f.cache.flush_write_back().await;
        let raw = f.slow.read("cache:k").await.unwrap().unwrap();
        assert_eq!(CacheEntry::from_value(raw).unwrap().data, json!("new"));
    }

    #[tokio::test]
    async fn test_write_around_skips_fast_tier() {
        let f = fixture(WritePolicy::WriteAround);
        f.fast
            .write(
                "cache:k",
                &CacheEntry::new("k", json!("stale"), f.clock.now_ms(), Duration::from_secs(60))
                    .to_value()
                    .unwrap(),
            )
            .await
            .unwrap();

        f.cache.set("k", json!("fresh"), None).await.unwrap();

        assert!(f.fast.read("cache:k").await.unwrap().is_none());
        assert!(f.slow.read("cache:k").await.unwrap().is_some());
        assert_eq!(f.cache.get("k").await, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn test_invalidate_pattern_and_all() {
        let f = fixture(WritePolicy::WriteThrough);
        for i in 0..3 {
            f.cache.set(&format!("user:{}", i), json!(i), None).await.unwrap();
        }
        f.cache.set("deck:1", json!("d"), None).await.unwrap();
        // Not owned by the cache: must survive invalidate(None)
        f.slow.write("queue:op:1", &json!({"op": 1})).await.unwrap();

        assert_eq!(f.cache.invalidate(Some("user:")).await, 3);
        assert_eq!(f.cache.get("user:1").await, None);
        assert_eq!(f.cache.get("deck:1").await, Some(json!("d")));

        assert_eq!(f.cache.invalidate(None).await, 1);
        assert_eq!(f.cache.get("deck:1").await, None);
        assert!(f.slow.read("queue:op:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_voids_pending_promotion() {
        let f = fixture(WritePolicy::WriteAround);
        f.cache.set("user:1", json!("v"), None).await.unwrap();

        // Hit in the slow tier schedules a promotion
        assert_eq!(f.cache.get("user:1").await, Some(json!("v")));
        assert_eq!(f.cache.invalidate(Some("user:")).await, 1);
        settle().await;

        assert!(f.fast.read("cache:user:1").await.unwrap().is_none());
        assert_eq!(f.cache.get("user:1").await, None);
        assert_eq!(f.cache.metrics().promotions, 0);
    }

    #[tokio::test]
    async fn test_newer_write_beats_pending_promotion() {
        let f = fixture(WritePolicy::WriteBack);
        let old = CacheEntry::new("k", json!("old"), f.clock.now_ms(), Duration::from_secs(60));
        f.slow.write("cache:k", &old.to_value().unwrap()).await.unwrap();

        assert_eq!(f.cache.get("k").await, Some(json!("old")));
        f.cache.set("k", json!("new"), None).await.unwrap();
        settle().await;

        assert_eq!(f.cache.get("k").await, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_peek_skips_counters_and_promotion() {
        let f = fixture(WritePolicy::WriteAround);
        f.cache.set("k", json!(1), None).await.unwrap();

        assert_eq!(f.cache.peek("k").await, Some(json!(1)));
        assert_eq!(f.cache.peek("missing").await, None);
        settle().await;

        let m = f.cache.metrics();
        assert_eq!(m.requests, 0);
        assert_eq!(m.promotions, 0);
        assert!(f.fast.read("cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_tier_evicts_oldest_entries() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let sample = CacheEntry::new("a", json!("x"), 1_000_000, Duration::from_secs(60));
        let size = entry_size("cache:a", &sample.to_value().unwrap()).unwrap();
        let store = Arc::new(InMemoryStore::with_capacity(size * 2 + size / 2));
        let cache = TieredCache::new(
            vec![CacheTier::new("memory", 0, store.clone())],
            WritePolicy::WriteThrough,
            Duration::from_secs(60),
            clock.clone(),
        );

        for key in ["a", "b", "c"] {
            cache.set(key, json!("x"), None).await.unwrap();
            clock.advance_ms(1);
        }

        assert!(store.read("cache:a").await.unwrap().is_none());
        assert!(store.read("cache:b").await.unwrap().is_some());
        assert!(store.read("cache:c").await.unwrap().is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_quota_failure_is_reported() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = TieredCache::new(
            vec![CacheTier::new("memory", 0, Arc::new(InMemoryStore::with_capacity(16)))],
            WritePolicy::WriteThrough,
            Duration::from_secs(60),
            clock.clone(),
        );
        let recovery = ErrorRecoveryManager::new(
            crate::recovery::RecoverySettings {
                max_errors: 10,
                auto_recovery: false,
            },
            clock,
        );
        cache.set_recovery(recovery.clone());

        assert!(cache.set("big", json!("will never fit in sixteen bytes"), None).await.is_err());

        let errors = recovery.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::Storage);
        assert_eq!(errors[0].severity, crate::recovery::Severity::Critical);
        assert_eq!(errors[0].context.component.as_deref(), Some("cache"));
        assert_eq!(errors[0].context.details.get("tier").map(String::as_str), Some("memory"));
        assert_eq!(errors[0].context.details.get("key").map(String::as_str), Some("big"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("short", json!(1), Some(Duration::from_millis(10))).await.unwrap();
        f.cache.set("long", json!(2), Some(Duration::from_secs(600))).await.unwrap();
        f.clock.advance_ms(1_000);

        // One key in each of the two tiers
        assert_eq!(f.cache.purge_expired().await, 2);
        assert!(f.cache.exists("long").await);
        assert!(!f.cache.exists("short").await);
    }

    #[tokio::test]
    async fn test_get_as_typed() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct User {
            name: String,
        }

        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("user:1", json!({"name": "A"}), None).await.unwrap();

        let user: Option<User> = f.cache.get_as("user:1").await.unwrap();
        assert_eq!(user, Some(User { name: "A".into() }));

        f.cache.set("bad", json!(5), None).await.unwrap();
        assert!(f.cache.get_as::<User>("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_tier_usage_report() {
        let f = fixture(WritePolicy::WriteThrough);
        f.cache.set("k", json!("v"), None).await.unwrap();
        f.cache.set_tier_available("durable", false);

        let usage = f.cache.tier_usage().await;
        assert_eq!(usage.len(), 2);
        assert!(usage[0].available);
        assert!(usage[0].used > 0);
        assert!(!usage[1].available);
    }
}

//! EnginePool — atomic allocation over a fixed set of engine slots.
//!
//! Engines live in an arena (`Vec<Engine>`) addressed by slot index, with
//! a name → slot map for lookups. One `RwLock` guards the arena: every
//! mutation holds the write lock for its whole duration, so an engine can
//! never be claimed by two callers, and every read returns a snapshot with
//! no half-applied transition.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use scanfleet_core::{FleetConfig, PoolEntry, SizeClassifier, SizeTier, epoch_millis};

use crate::engine::{Engine, EngineState};
use crate::error::{PoolError, PoolResult};
use crate::snapshot::{PoolSnapshot, TierCounts};

struct Arena {
    engines: Vec<Engine>,
    slots: HashMap<String, usize>,
}

impl Arena {
    fn get_mut(&mut self, name: &str) -> PoolResult<&mut Engine> {
        let slot = *self
            .slots
            .get(name)
            .ok_or_else(|| PoolError::UnknownEngine(name.to_string()))?;
        Ok(&mut self.engines[slot])
    }

    fn counts(&self, tier: &str) -> TierCounts {
        let mut counts = TierCounts::default();
        for engine in self.engines.iter().filter(|e| e.tier() == tier) {
            counts.record(engine.state());
        }
        counts
    }
}

/// Number of engines to claim for provisioning so `tier` reaches its
/// min-idle target.
///
/// Engines already pending or starting count toward the target, and the
/// result never exceeds the free (unprovisioned) slots.
pub fn min_idle_shortfall(entry: &PoolEntry, counts: &TierCounts) -> u32 {
    entry
        .min_idle
        .saturating_sub(counts.warm())
        .min(counts.unprovisioned)
}

/// The shared registry of all engine slots.
pub struct EnginePool {
    entries: Vec<PoolEntry>,
    classifier: SizeClassifier,
    arena: RwLock<Arena>,
    /// Signalled whenever a slot is claimed for provisioning.
    provisioning: Notify,
}

impl EnginePool {
    /// Build the pool, creating `total` unprovisioned slots per tier named
    /// `{prefix}-{tier}-{NN}`.
    pub fn new(name_prefix: &str, entries: Vec<PoolEntry>) -> PoolResult<Self> {
        let classifier = SizeClassifier::new(entries.iter().map(PoolEntry::size_tier).collect())?;

        let mut engines = Vec::new();
        for entry in &entries {
            entry.validate()?;
            let tier_slug = entry.tier.to_lowercase();
            for i in 1..=entry.total {
                engines.push(Engine::new(
                    format!("{name_prefix}-{tier_slug}-{i:02}"),
                    entry.tier.clone(),
                ));
            }
        }

        let slots = engines
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_string(), i))
            .collect();

        info!(
            tiers = entries.len(),
            engines = engines.len(),
            "engine pool created"
        );

        Ok(Self {
            entries,
            classifier,
            arena: RwLock::new(Arena { engines, slots }),
            provisioning: Notify::new(),
        })
    }

    /// Build the pool from a validated fleet config.
    pub fn from_config(config: &FleetConfig) -> PoolResult<Self> {
        Self::new(&config.fleet.name_prefix, config.pool.clone())
    }

    /// The pool specification, in tier order.
    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn entry(&self, tier: &str) -> Option<&PoolEntry> {
        self.entries.iter().find(|e| e.tier == tier)
    }

    /// Classify a scan size into a tier; `None` if no tier covers it.
    pub fn calc_engine_size(&self, metric: u64) -> Option<&SizeTier> {
        self.classifier.classify(metric)
    }

    /// Claim the first engine of `tier` in state `from` and move it to `to`.
    ///
    /// Returns `Ok(None)` when no such engine exists (including unknown
    /// tiers). The claim edges are `Unprovisioned → Pending`,
    /// `Idle → Scanning` and `Idle → Expiring`; any other pair fails with
    /// [`PoolError::InvalidTransition`] when a candidate exists.
    pub async fn allocate_engine(
        &self,
        tier: &str,
        from: EngineState,
        to: EngineState,
    ) -> PoolResult<Option<Engine>> {
        let now = epoch_millis();
        let allocated = {
            let mut arena = self.arena.write().await;
            let Some(engine) = arena
                .engines
                .iter_mut()
                .find(|e| e.tier() == tier && e.state() == from)
            else {
                return Ok(None);
            };

            match (from, to) {
                (EngineState::Unprovisioned, EngineState::Pending) => engine.on_claim()?,
                (EngineState::Idle, EngineState::Scanning) => engine.on_scan(now)?,
                (EngineState::Idle, EngineState::Expiring) => engine.on_expire(now)?,
                _ => {
                    return Err(PoolError::InvalidTransition {
                        tier: tier.to_string(),
                        from,
                        to,
                    });
                }
            }
            engine.clone()
        };

        if to == EngineState::Pending {
            self.provisioning.notify_one();
        }
        debug!(engine = %allocated.name(), %tier, %from, %to, "engine allocated");
        Ok(Some(allocated))
    }

    /// Claim unprovisioned engines wherever a tier is below its min-idle
    /// target. Returns the engines moved to `Pending`.
    ///
    /// A tier with no free slots left is skipped; the caller sees fewer
    /// engines than the gap.
    pub async fn allocate_min_idle_engines(&self) -> Vec<Engine> {
        let mut arena = self.arena.write().await;
        let mut allocated = Vec::new();

        for entry in &self.entries {
            let counts = arena.counts(&entry.tier);
            let gap = entry.min_idle.saturating_sub(counts.warm());
            let wanted = min_idle_shortfall(entry, &counts);

            if gap > wanted {
                debug!(
                    tier = %entry.tier,
                    gap,
                    free = counts.unprovisioned,
                    "tier at capacity, min idle not reachable"
                );
            }
            if wanted == 0 {
                continue;
            }

            let claimed = arena
                .engines
                .iter_mut()
                .filter(|e| e.tier() == entry.tier && e.state() == EngineState::Unprovisioned)
                .take(wanted as usize);
            for engine in claimed {
                // Filtered to unprovisioned above, so the claim always applies.
                if engine.on_claim().is_ok() {
                    allocated.push(engine.clone());
                }
            }

            info!(
                tier = %entry.tier,
                idle = counts.idle,
                min_idle = entry.min_idle,
                claimed = wanted,
                "claimed engines to restore min idle"
            );
        }

        allocated
    }

    /// Replace the record for `engine.name()` and return the old record.
    ///
    /// Used when provider state supersedes the in-memory view, e.g. when
    /// rebuilding the pool at startup.
    pub async fn add_existing_engine(&self, engine: Engine) -> PoolResult<Engine> {
        let mut arena = self.arena.write().await;
        let current = arena.get_mut(engine.name())?;
        if current.tier() != engine.tier() {
            return Err(PoolError::TierMismatch {
                engine: engine.name().to_string(),
                expected: current.tier().to_string(),
                found: engine.tier().to_string(),
            });
        }

        let previous = std::mem::replace(current, engine);
        info!(
            engine = %previous.name(),
            from = %previous.state(),
            to = %current.state(),
            host = ?current.host(),
            "engine record replaced"
        );
        Ok(previous)
    }

    /// Apply `op` to the named engine under the write lock.
    ///
    /// `op` works on a copy; the record is only replaced if it succeeds.
    pub async fn update<F>(&self, name: &str, op: F) -> PoolResult<Engine>
    where
        F: FnOnce(&mut Engine) -> PoolResult<()>,
    {
        let mut arena = self.arena.write().await;
        let engine = arena.get_mut(name)?;
        let mut next = engine.clone();
        op(&mut next)?;
        *engine = next.clone();
        Ok(next)
    }

    /// Like [`update`](Self::update), but only if the engine is still in
    /// `expected`. Returns `Ok(None)` if another caller moved it first.
    pub async fn update_if<F>(
        &self,
        name: &str,
        expected: EngineState,
        op: F,
    ) -> PoolResult<Option<Engine>>
    where
        F: FnOnce(&mut Engine) -> PoolResult<()>,
    {
        let mut arena = self.arena.write().await;
        let engine = arena.get_mut(name)?;
        if engine.state() != expected {
            return Ok(None);
        }
        let mut next = engine.clone();
        op(&mut next)?;
        *engine = next.clone();
        Ok(Some(next))
    }

    /// Wait until some caller claims a slot for provisioning.
    ///
    /// A claim made while nobody is waiting is remembered, so the next
    /// call returns immediately.
    pub async fn provisioning_requested(&self) {
        self.provisioning.notified().await;
    }

    // ── Read-only views ────────────────────────────────────────────

    /// A consistent copy of every engine.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let arena = self.arena.read().await;
        PoolSnapshot::new(self.entries.clone(), arena.engines.clone())
    }

    pub async fn engine_by_name(&self, name: &str) -> Option<Engine> {
        let arena = self.arena.read().await;
        arena.slots.get(name).map(|&slot| arena.engines[slot].clone())
    }

    pub async fn all_engines_by_name(&self) -> BTreeMap<String, Engine> {
        self.snapshot().await.by_name()
    }

    pub async fn all_engines_by_tier(&self) -> BTreeMap<String, Vec<Engine>> {
        self.snapshot().await.group_by_tier(&EngineState::ALL)
    }

    pub async fn unprovisioned_engines(&self) -> BTreeMap<String, Vec<Engine>> {
        self.snapshot()
            .await
            .group_by_tier(&[EngineState::Unprovisioned])
    }

    pub async fn pending_engines(&self) -> BTreeMap<String, Vec<Engine>> {
        self.snapshot().await.group_by_tier(&[EngineState::Pending])
    }

    /// Starting and scanning engines.
    pub async fn active_engines(&self) -> BTreeMap<String, Vec<Engine>> {
        self.snapshot()
            .await
            .group_by_tier(&[EngineState::Starting, EngineState::Scanning])
    }

    pub async fn idle_engines(&self) -> BTreeMap<String, Vec<Engine>> {
        self.snapshot().await.group_by_tier(&[EngineState::Idle])
    }

    pub async fn expiring_engines(&self) -> BTreeMap<String, Vec<Engine>> {
        self.snapshot().await.group_by_tier(&[EngineState::Expiring])
    }

    pub async fn state_counts(&self) -> BTreeMap<String, TierCounts> {
        self.snapshot().await.all_counts()
    }

    /// State counts for one tier, without copying the pool.
    pub async fn tier_counts(&self, tier: &str) -> TierCounts {
        self.arena.read().await.counts(tier)
    }
}

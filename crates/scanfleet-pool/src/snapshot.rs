//! Consistent, owned views of the pool taken under a single read lock.

use std::collections::BTreeMap;

use serde::Serialize;

use scanfleet_core::PoolEntry;

use crate::engine::{Engine, EngineState};

/// Engine counts per state for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub unprovisioned: u32,
    pub pending: u32,
    pub starting: u32,
    pub idle: u32,
    pub scanning: u32,
    pub expiring: u32,
}

impl TierCounts {
    pub fn record(&mut self, state: EngineState) {
        *self.slot(state) += 1;
    }

    pub fn get(&self, state: EngineState) -> u32 {
        match state {
            EngineState::Unprovisioned => self.unprovisioned,
            EngineState::Pending => self.pending,
            EngineState::Starting => self.starting,
            EngineState::Idle => self.idle,
            EngineState::Scanning => self.scanning,
            EngineState::Expiring => self.expiring,
        }
    }

    fn slot(&mut self, state: EngineState) -> &mut u32 {
        match state {
            EngineState::Unprovisioned => &mut self.unprovisioned,
            EngineState::Pending => &mut self.pending,
            EngineState::Starting => &mut self.starting,
            EngineState::Idle => &mut self.idle,
            EngineState::Scanning => &mut self.scanning,
            EngineState::Expiring => &mut self.expiring,
        }
    }

    /// Sum over all states; equals the tier's `total`.
    pub fn total(&self) -> u32 {
        EngineState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Engines that are idle or on their way to idle.
    pub fn warm(&self) -> u32 {
        self.idle + self.pending + self.starting
    }

    /// Provisioning already in flight.
    pub fn in_flight(&self) -> u32 {
        self.pending + self.starting
    }
}

/// An owned copy of every engine record, in slot order.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    entries: Vec<PoolEntry>,
    engines: Vec<Engine>,
}

impl PoolSnapshot {
    pub(crate) fn new(entries: Vec<PoolEntry>, engines: Vec<Engine>) -> Self {
        Self { entries, engines }
    }

    /// The pool specification the snapshot was taken from.
    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    pub fn in_state(&self, state: EngineState) -> impl Iterator<Item = &Engine> {
        self.engines.iter().filter(move |e| e.state() == state)
    }

    pub fn in_tier_state<'a>(
        &'a self,
        tier: &'a str,
        state: EngineState,
    ) -> impl Iterator<Item = &'a Engine> {
        self.engines
            .iter()
            .filter(move |e| e.tier() == tier && e.state() == state)
    }

    pub fn counts(&self, tier: &str) -> TierCounts {
        let mut counts = TierCounts::default();
        for engine in self.engines.iter().filter(|e| e.tier() == tier) {
            counts.record(engine.state());
        }
        counts
    }

    /// Counts for every tier in the specification.
    pub fn all_counts(&self) -> BTreeMap<String, TierCounts> {
        let mut counts: BTreeMap<String, TierCounts> = self
            .entries
            .iter()
            .map(|e| (e.tier.clone(), TierCounts::default()))
            .collect();
        for engine in &self.engines {
            counts
                .entry(engine.tier().to_string())
                .or_default()
                .record(engine.state());
        }
        counts
    }

    /// Engines in any of `states`, grouped by tier. Every tier has a key.
    pub fn group_by_tier(&self, states: &[EngineState]) -> BTreeMap<String, Vec<Engine>> {
        let mut groups: BTreeMap<String, Vec<Engine>> = self
            .entries
            .iter()
            .map(|e| (e.tier.clone(), Vec::new()))
            .collect();
        for engine in self.engines.iter().filter(|e| states.contains(&e.state())) {
            groups
                .entry(engine.tier().to_string())
                .or_default()
                .push(engine.clone());
        }
        groups
    }

    pub fn by_name(&self) -> BTreeMap<String, Engine> {
        self.engines
            .iter()
            .map(|e| (e.name().to_string(), e.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_counts_total_and_warm() {
        let mut counts = TierCounts::default();
        for state in EngineState::ALL {
            counts.record(state);
        }
        counts.record(EngineState::Idle);

        assert_eq!(counts.total(), 7);
        assert_eq!(counts.idle, 2);
        assert_eq!(counts.warm(), 4);
        assert_eq!(counts.in_flight(), 2);
    }

    #[test]
    fn grouping_includes_empty_tiers() {
        let entries = vec![PoolEntry::new("S", 0, 9, 1, 0), PoolEntry::new("M", 10, 19, 1, 0)];
        let engines = vec![Engine::new("e-s-01", "S"), Engine::new("e-m-01", "M")];
        let snapshot = PoolSnapshot::new(entries, engines);

        let idle = snapshot.group_by_tier(&[EngineState::Idle]);
        assert_eq!(idle.len(), 2);
        assert!(idle.values().all(Vec::is_empty));

        let free = snapshot.group_by_tier(&[EngineState::Unprovisioned]);
        assert_eq!(free["S"].len(), 1);
        assert_eq!(free["M"].len(), 1);
        assert_eq!(snapshot.all_counts()["M"].unprovisioned, 1);
    }
}

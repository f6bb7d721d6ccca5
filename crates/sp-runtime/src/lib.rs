#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use sp_random::RandomState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Seed,
    Initialize,
    Forward,
    Backward,
    Update,
    Compare,
}

impl EvidenceKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Initialize => "initialize",
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::Update => "update",
            Self::Compare => "compare",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn count(&self, kind: EvidenceKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }

    /// Entry counts keyed by kind label.
    #[must_use]
    pub fn kind_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.kind.label()).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Random state plus the evidence trail of everything that consumed it.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    rng: RandomState,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Seed, format!("seed initialized to {seed}"));
        Self {
            rng: RandomState::seeded(seed),
            ledger,
        }
    }

    pub fn set_seed(&mut self, seed: u64) {
        let previous_draws = self.rng.draws();
        self.rng.set_seed(seed);
        self.ledger.record(
            EvidenceKind::Seed,
            format!("seed reset to {seed} after {previous_draws} draws"),
        );
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    #[must_use]
    pub fn rng(&self) -> &RandomState {
        &self.rng
    }

    pub fn rng_mut(&mut self) -> &mut RandomState {
        &mut self.rng
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::view::{Replicant, ReplicantView};

/// Picks the replicant a clustered proxy calls next.
///
/// `exclude` lists targets that already failed during the current call;
/// policies never return one of them.
pub trait LoadBalancePolicy: Send + Sync + fmt::Debug {
    fn choose(&self, view: &ReplicantView, exclude: &[Replicant]) -> Option<Replicant>;

    fn name(&self) -> &'static str;
}

/// Policy selector used in configuration.
///
/// Defaults to `FirstAvailable`: a session's state lives on the replicant
/// that last served it, so calls stay there until it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicyKind {
    RoundRobin,
    #[default]
    FirstAvailable,
    RandomRobin,
}

impl LoadBalancePolicyKind {
    pub fn build(self) -> Arc<dyn LoadBalancePolicy> {
        match self {
            LoadBalancePolicyKind::RoundRobin => Arc::new(RoundRobin::new()),
            LoadBalancePolicyKind::FirstAvailable => Arc::new(FirstAvailable::new()),
            LoadBalancePolicyKind::RandomRobin => Arc::new(RandomRobin::new()),
        }
    }
}

/// Round-robin over the current view.
///
/// The cursor survives view changes, so a growing view starts handing out the
/// new members on the following calls.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancePolicy for RoundRobin {
    fn choose(&self, view: &ReplicantView, exclude: &[Replicant]) -> Option<Replicant> {
        let candidates: Vec<&Replicant> = view.candidates(exclude).collect();
        if candidates.is_empty() {
            return None;
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[idx].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Sticks to one replicant until it fails or leaves the view.
#[derive(Debug, Default)]
pub struct FirstAvailable {
    sticky: Mutex<Option<Replicant>>,
}

impl FirstAvailable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancePolicy for FirstAvailable {
    fn choose(&self, view: &ReplicantView, exclude: &[Replicant]) -> Option<Replicant> {
        let mut sticky = self.sticky.lock();
        if let Some(current) = sticky.as_ref() {
            if view.contains(current) && !exclude.contains(current) {
                return Some(current.clone());
            }
        }

        let next = view.candidates(exclude).next().cloned();
        *sticky = next.clone();
        next
    }

    fn name(&self) -> &'static str {
        "first_available"
    }
}

/// Starts each call at a pseudo-random position in the view.
///
/// Positions come from a splitmix64 sequence seeded from the clock at
/// construction.
#[derive(Debug)]
pub struct RandomRobin {
    state: AtomicU64,
}

impl RandomRobin {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next_u64(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Default for RandomRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancePolicy for RandomRobin {
    fn choose(&self, view: &ReplicantView, exclude: &[Replicant]) -> Option<Replicant> {
        let candidates: Vec<&Replicant> = view.candidates(exclude).collect();
        if candidates.is_empty() {
            return None;
        }

        let idx = (self.next_u64() % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }

    fn name(&self) -> &'static str {
        "random_robin"
    }
}

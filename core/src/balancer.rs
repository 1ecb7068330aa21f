//! Health-weighted candidate selection
//!
//! Selection is deterministic: among the candidates with the highest weight,
//! the best `(priority, usage)` wins and exact ties rotate through a shared
//! cursor so equivalent credentials share traffic.

use crate::HealthStatus;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A credential offered to the balancer for one allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub credential_id: String,
    pub priority: i32,
    pub load: usize,
    pub capacity: usize,
    pub base_weight: f64,
    pub health: HealthStatus,
}

impl Candidate {
    pub fn usage_ratio(&self) -> f64 {
        self.load as f64 / self.capacity.max(1) as f64
    }
}

/// Multiplier applied to a credential's base weight for its health
pub fn health_factor(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy | HealthStatus::Unknown => 1.0,
        HealthStatus::Degraded => 0.5,
        HealthStatus::Recovering => 0.3,
        HealthStatus::Unhealthy => 0.0,
    }
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective selection weight of a candidate
    pub fn weight(candidate: &Candidate) -> f64 {
        candidate.base_weight * health_factor(candidate.health)
    }

    /// Pick a candidate, or `None` if nothing is selectable
    pub fn select<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        self.select_preferred(candidates, None)
    }

    /// Pick a candidate, honoring `preferred` when it is among the candidates
    /// and has positive weight
    pub fn select_preferred<'a>(
        &self,
        candidates: &'a [Candidate],
        preferred: Option<&str>,
    ) -> Option<&'a Candidate> {
        let weighted: Vec<(&Candidate, f64)> = candidates
            .iter()
            .map(|c| (c, Self::weight(c)))
            .filter(|(_, w)| *w > 0.0)
            .collect();

        if weighted.is_empty() {
            return candidates
                .iter()
                .find(|c| c.health == HealthStatus::Recovering);
        }

        if let Some((candidate, _)) = preferred
            .and_then(|id| weighted.iter().find(|(c, _)| c.credential_id == id))
        {
            return Some(candidate);
        }

        let top = weighted
            .iter()
            .map(|(_, w)| *w)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut tier: Vec<&Candidate> = weighted
            .into_iter()
            .filter(|(_, w)| *w >= top)
            .map(|(c, _)| c)
            .collect();

        tier.sort_by(|a, b| rank(a, b));
        let best = tier.first()?;
        let tied: Vec<&Candidate> = tier
            .iter()
            .copied()
            .filter(|c| rank(c, best) == CmpOrdering::Equal)
            .collect();

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % tied.len();
        Some(tied[index])
    }
}

/// Higher priority first, then the least used
fn rank(a: &Candidate, b: &Candidate) -> CmpOrdering {
    b.priority.cmp(&a.priority).then_with(|| {
        a.usage_ratio()
            .partial_cmp(&b.usage_ratio())
            .unwrap_or(CmpOrdering::Equal)
    })
}

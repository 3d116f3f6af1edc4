// ============================================================================
// Cycle Phase
// ============================================================================

use core::fmt;

/// Where an interacting multiple model is within one measurement cycle.
///
/// A cycle runs `Idle -> Mixed -> Predicted -> Updated -> Combined`; the
/// terminal phase of one cycle is the starting point of the next. A cycle
/// that fails leaves the model in the phase it had before the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CyclePhase {
    /// Freshly constructed, no cycle run yet
    #[default]
    Idle,
    /// Mixed states assigned to every filter
    Mixed,
    /// Every filter predicted
    Predicted,
    /// Every filter updated, mode probabilities recomputed
    Updated,
    /// Combined posterior estimate available
    Combined,
}

impl CyclePhase {
    /// The phase that follows this one.
    pub fn next(self) -> Self {
        match self {
            CyclePhase::Idle | CyclePhase::Combined => CyclePhase::Mixed,
            CyclePhase::Mixed => CyclePhase::Predicted,
            CyclePhase::Predicted => CyclePhase::Updated,
            CyclePhase::Updated => CyclePhase::Combined,
        }
    }

    /// Returns `true` if a cycle may start from this phase.
    #[inline]
    pub fn is_cycle_boundary(self) -> bool {
        matches!(self, CyclePhase::Idle | CyclePhase::Combined)
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Mixed => "mixed",
            CyclePhase::Predicted => "predicted",
            CyclePhase::Updated => "updated",
            CyclePhase::Combined => "combined",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_order() {
        let mut phase = CyclePhase::default();
        let mut seen = vec![phase];
        for _ in 0..4 {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                CyclePhase::Idle,
                CyclePhase::Mixed,
                CyclePhase::Predicted,
                CyclePhase::Updated,
                CyclePhase::Combined,
            ]
        );
        assert_eq!(phase.next(), CyclePhase::Mixed);
        assert!(phase.is_cycle_boundary());
        assert!(!CyclePhase::Predicted.is_cycle_boundary());
    }
}

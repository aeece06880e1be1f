//! Simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// VS-001: Moving population, clean reads
    Steady,

    /// VS-002: Source origin jumps mid-run; published positions must not
    OriginRebase,

    /// VS-003: Random slot and round failures
    FlakyReads,

    /// VS-004: Same-key duplicates and co-located ghosts
    DuplicateSpawns,

    /// VS-005: Entities spawn and despawn continuously
    RosterChurn,

    /// VS-006: Real worker threads against a live source
    Threaded,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Steady,
            ScenarioId::OriginRebase,
            ScenarioId::FlakyReads,
            ScenarioId::DuplicateSpawns,
            ScenarioId::RosterChurn,
            ScenarioId::Threaded,
        ]
    }

    /// Scenarios that run on the virtual clock (fully reproducible).
    pub fn deterministic() -> Vec<ScenarioId> {
        Self::all()
            .into_iter()
            .filter(|s| !s.uses_threads())
            .collect()
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "steady",
            ScenarioId::OriginRebase => "origin_rebase",
            ScenarioId::FlakyReads => "flaky_reads",
            ScenarioId::DuplicateSpawns => "duplicate_spawns",
            ScenarioId::RosterChurn => "roster_churn",
            ScenarioId::Threaded => "threaded",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "20 moving entities, no faults; frames must match ground truth",
            ScenarioId::OriginRebase => "three 100k-unit origin jumps; positions stay continuous",
            ScenarioId::FlakyReads => "15% slot and 2% round failures; no ghosts, bounded error",
            ScenarioId::DuplicateSpawns => "shared hit zones and co-located ghosts are coalesced",
            ScenarioId::RosterChurn => "spawn/despawn every second; roster converges each time",
            ScenarioId::Threaded => "one OS thread per worker against a concurrently moving source",
        }
    }

    /// Returns true if the scenario runs real threads on the wall clock.
    pub fn uses_threads(&self) -> bool {
        matches!(self, ScenarioId::Threaded)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady" | "vs-001" => Ok(ScenarioId::Steady),
            "origin_rebase" | "originrebase" | "rebase" | "vs-002" => Ok(ScenarioId::OriginRebase),
            "flaky_reads" | "flakyreads" | "flaky" | "vs-003" => Ok(ScenarioId::FlakyReads),
            "duplicate_spawns" | "duplicatespawns" | "duplicates" | "vs-004" => {
                Ok(ScenarioId::DuplicateSpawns)
            }
            "roster_churn" | "rosterchurn" | "churn" | "vs-005" => Ok(ScenarioId::RosterChurn),
            "threaded" | "vs-006" => Ok(ScenarioId::Threaded),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for s in ScenarioId::all() {
            assert_eq!(s.name().parse::<ScenarioId>(), Ok(s));
        }
        assert_eq!("VS-003".parse::<ScenarioId>(), Ok(ScenarioId::FlakyReads));
        assert!("nope".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_deterministic_excludes_threads() {
        let d = ScenarioId::deterministic();
        assert_eq!(d.len(), ScenarioId::all().len() - 1);
        assert!(!d.contains(&ScenarioId::Threaded));
    }
}

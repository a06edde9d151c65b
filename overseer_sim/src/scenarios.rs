//! Chaos scenarios for the observation layer.

use overseer_env::PartitionId;

use crate::world::SimConfig;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// OBS-001: All partitions step together and always report
    Lockstep,

    /// OBS-002: Partitions step at different rates
    Staggered,

    /// OBS-003: Stats are reported on few steps
    SparseStats,

    /// OBS-004: Partitions keep stepping during unlocked reads
    RacingReads,

    /// OBS-005: Lossy, jittery links to worker partitions
    FlakyLink,

    /// OBS-006: One partition disappears for a while
    Blackout,

    /// OBS-007: A partition re-sends a step the observer already consumed
    ProtocolViolation,
}

/// A fault applied at a given tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultAction {
    Unreachable(PartitionId, bool),
    Latency(PartitionId, f64, f64),
    Loss(PartitionId, f64),
    StaleStat(PartitionId),
    HealAll,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultEvent {
    pub at_tick: u64,
    pub action: FaultAction,
}

/// Everything needed to run one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub config: SimConfig,

    /// Minimum virtual time between remote step queries
    pub refresh_interval_ms: u64,

    pub ticks: u64,

    /// Faults, sorted by tick
    pub faults: Vec<FaultEvent>,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Lockstep,
            ScenarioId::Staggered,
            ScenarioId::SparseStats,
            ScenarioId::RacingReads,
            ScenarioId::FlakyLink,
            ScenarioId::Blackout,
            ScenarioId::ProtocolViolation,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Lockstep => "lockstep",
            ScenarioId::Staggered => "staggered",
            ScenarioId::SparseStats => "sparse_stats",
            ScenarioId::RacingReads => "racing_reads",
            ScenarioId::FlakyLink => "flaky_link",
            ScenarioId::Blackout => "blackout",
            ScenarioId::ProtocolViolation => "protocol_violation",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Lockstep => "All partitions step every tick and report every step",
            ScenarioId::Staggered => "Step periods 2/1/3/4 ticks, table clamps to the slowest",
            ScenarioId::SparseStats => "30% reporting probability, gaps filled by carry-forward",
            ScenarioId::RacingReads => "Partitions step on unlocked reads, snapshots stay atomic",
            ScenarioId::FlakyLink => "20% call loss and 40±15ms latency on worker partitions",
            ScenarioId::Blackout => "Last partition unreachable for 60 ticks, then re-resolved",
            ScenarioId::ProtocolViolation => "Partition 1 replays a consumed step, batch is skipped",
        }
    }

    /// Builds the run plan for this scenario.
    pub fn plan(&self, seed: u64, partitions: usize, ticks: u64) -> ScenarioPlan {
        let partitions = partitions.max(2);
        let last = PartitionId::from_index(partitions - 1);
        let base = SimConfig {
            seed,
            partitions,
            width: 8 * partitions as i32,
            ..SimConfig::default()
        };
        let mut plan = ScenarioPlan {
            config: base,
            refresh_interval_ms: 250,
            ticks,
            faults: Vec::new(),
        };

        match self {
            ScenarioId::Lockstep => {
                plan.refresh_interval_ms = 100;
            }
            ScenarioId::Staggered => {
                plan.refresh_interval_ms = 100;
                plan.config.step_periods = (0..partitions as u64)
                    .map(|p| match p {
                        0 => 2,
                        1 => 1,
                        n => n + 1,
                    })
                    .collect();
            }
            ScenarioId::SparseStats => {
                plan.config.stat_probability = 0.3;
            }
            ScenarioId::RacingReads => {
                plan.refresh_interval_ms = 100;
                plan.config.racing = true;
            }
            ScenarioId::FlakyLink => {
                // The coordinator link stays lossless: a lost unlock would
                // leave the cluster held with nothing to release it.
                plan.faults.push(FaultEvent {
                    at_tick: 0,
                    action: FaultAction::Latency(PartitionId::COORDINATOR, 40.0, 15.0),
                });
                for p in 1..partitions {
                    let pid = PartitionId::from_index(p);
                    plan.faults.push(FaultEvent {
                        at_tick: 0,
                        action: FaultAction::Latency(pid, 40.0, 15.0),
                    });
                    plan.faults.push(FaultEvent {
                        at_tick: 0,
                        action: FaultAction::Loss(pid, 0.2),
                    });
                }
            }
            ScenarioId::Blackout => {
                let start = ticks / 4;
                plan.faults.push(FaultEvent {
                    at_tick: start,
                    action: FaultAction::Unreachable(last, true),
                });
                plan.faults.push(FaultEvent {
                    at_tick: start + 60,
                    action: FaultAction::HealAll,
                });
            }
            ScenarioId::ProtocolViolation => {
                plan.faults.push(FaultEvent {
                    at_tick: ticks / 3,
                    action: FaultAction::StaleStat(PartitionId(1)),
                });
            }
        }

        plan
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
            "lockstep" | "obs-001" => Ok(ScenarioId::Lockstep),
            "staggered" | "obs-002" => Ok(ScenarioId::Staggered),
            "sparse_stats" | "sparsestats" | "obs-003" => Ok(ScenarioId::SparseStats),
            "racing_reads" | "racingreads" | "obs-004" => Ok(ScenarioId::RacingReads),
            "flaky_link" | "flakylink" | "obs-005" => Ok(ScenarioId::FlakyLink),
            "blackout" | "obs-006" => Ok(ScenarioId::Blackout),
            "protocol_violation" | "protocolviolation" | "obs-007" => {
                Ok(ScenarioId::ProtocolViolation)
            }
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fault_target(action: &FaultAction) -> Option<PartitionId> {
        match action {
            FaultAction::Unreachable(pid, _)
            | FaultAction::Latency(pid, _, _)
            | FaultAction::Loss(pid, _)
            | FaultAction::StaleStat(pid) => Some(*pid),
            FaultAction::HealAll => None,
        }
    }

    proptest! {
        #[test]
        fn test_plans_stay_inside_the_cluster(
            seed in any::<u64>(),
            partitions in 0usize..12,
            ticks in 1u64..1000,
            scenario in proptest::sample::select(ScenarioId::all()),
        ) {
            let plan = scenario.plan(seed, partitions, ticks);
            let n = plan.config.partitions;

            prop_assert!(n >= 2);
            prop_assert_eq!(plan.config.seed, seed);
            prop_assert_eq!(plan.config.width, 8 * n as i32);
            prop_assert!(plan.faults.windows(2).all(|w| w[0].at_tick <= w[1].at_tick));
            for fault in &plan.faults {
                if let Some(pid) = fault_target(&fault.action) {
                    prop_assert!(pid.index() < n);
                }
                // A lossy coordinator could drop the unlock
                prop_assert!(!matches!(
                    fault.action,
                    FaultAction::Loss(pid, _) if pid.is_coordinator()
                ));
            }
        }
    }

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert!(!scenario.description().is_empty());
        }
        assert_eq!("OBS-006".parse::<ScenarioId>(), Ok(ScenarioId::Blackout));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_plans() {
        let plan = ScenarioId::Staggered.plan(1, 4, 100);
        assert_eq!(plan.config.step_periods, vec![2, 1, 3, 4]);

        let plan = ScenarioId::Blackout.plan(1, 3, 200);
        assert_eq!(plan.faults[0].at_tick, 50);
        assert_eq!(
            plan.faults[0].action,
            FaultAction::Unreachable(PartitionId(2), true)
        );

        let plan = ScenarioId::FlakyLink.plan(1, 3, 100);
        assert!(!plan
            .faults
            .iter()
            .any(|f| f.action == FaultAction::Loss(PartitionId::COORDINATOR, 0.2)));
        assert_eq!(plan.config.partitions, 3);
    }
}

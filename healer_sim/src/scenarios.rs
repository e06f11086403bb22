//! Delivery scenarios for deterministic simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// clean links, one change observed and acknowledged
    DeliveryBaseline,

    /// every link drops everything, sender gives up
    TotalLoss,

    /// the same envelope arrives twice
    DuplicateDelivery,

    /// 50% loss in both directions, peers still converge
    LossyLink,

    /// sender partitioned away, then healed before giving up
    PartitionHeal,

    /// a peer joins late and catches up from a snapshot
    LateJoinerSync,

    /// ledgers drain once traffic stops
    MemoryBound,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::DeliveryBaseline,
            ScenarioId::TotalLoss,
            ScenarioId::DuplicateDelivery,
            ScenarioId::LossyLink,
            ScenarioId::PartitionHeal,
            ScenarioId::LateJoinerSync,
            ScenarioId::MemoryBound,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::DeliveryBaseline => "delivery_baseline",
            ScenarioId::TotalLoss => "total_loss",
            ScenarioId::DuplicateDelivery => "duplicate_delivery",
            ScenarioId::LossyLink => "lossy_link",
            ScenarioId::PartitionHeal => "partition_heal",
            ScenarioId::LateJoinerSync => "late_joiner_sync",
            ScenarioId::MemoryBound => "memory_bound",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::DeliveryBaseline => "No chaos: change applied everywhere, ACK within 2x timeout, entry reclaimed",
            ScenarioId::TotalLoss => "100% link loss: limit-1 retries, then give up; receivers unchanged",
            ScenarioId::DuplicateDelivery => "Relay-style redelivery: applied once, ACK re-sent",
            ScenarioId::LossyLink => "50% link loss: all changes converge within the attempt budget",
            ScenarioId::PartitionHeal => "Sender isolated for two retry periods, then healed",
            ScenarioId::LateJoinerSync => "Late peer adopts the full snapshot via STATE_SYNC",
            ScenarioId::MemoryBound => "Pending and applied ledgers empty after the retention window",
        }
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
            "delivery_baseline" | "baseline" | "a" => Ok(ScenarioId::DeliveryBaseline),
            "total_loss" | "b" => Ok(ScenarioId::TotalLoss),
            "duplicate_delivery" | "duplicate" | "c" => Ok(ScenarioId::DuplicateDelivery),
            "lossy_link" | "lossy" => Ok(ScenarioId::LossyLink),
            "partition_heal" | "partition" => Ok(ScenarioId::PartitionHeal),
            "late_joiner_sync" | "late_joiner" => Ok(ScenarioId::LateJoinerSync),
            "memory_bound" | "memory" => Ok(ScenarioId::MemoryBound),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Syncing,
    Validating,
    Committing,
    HotReloading,
    HealthChecking,
    RollingBack,
    EmergencyStopped,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Validating => "validating",
            Self::Committing => "committing",
            Self::HotReloading => "hot_reloading",
            Self::HealthChecking => "health_checking",
            Self::RollingBack => "rolling_back",
            Self::EmergencyStopped => "emergency_stopped",
        }
    }

    /// Legal edges of the lifecycle. Any state may enter `EmergencyStopped`;
    /// leaving it is only possible through a manual clear (to `Idle`).
    pub fn can_transition(self, to: OrchestratorState) -> bool {
        use OrchestratorState::*;
        if to == EmergencyStopped {
            return true;
        }
        matches!(
            (self, to),
            (Idle, Syncing)
                | (Idle, RollingBack)
                | (Syncing, Validating)
                | (Syncing, Idle)
                | (Validating, Committing)
                | (Validating, Idle)
                | (Committing, HotReloading)
                | (Committing, Validating)
                | (Committing, Idle)
                | (HotReloading, HealthChecking)
                | (HotReloading, Idle)
                | (HealthChecking, Idle)
                | (HealthChecking, RollingBack)
                | (RollingBack, Idle)
                | (EmergencyStopped, Idle)
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side wins when automation and a human want the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Development: fast self-correction outranks manual edits.
    DevPriority,
    /// Production: the human always wins.
    ProdPriority,
    /// Missing or unparseable mode source; handled like `ProdPriority`.
    Unknown,
}

impl OperatingMode {
    /// Parse the mode token of the rules corpus (`devP` / `proD`), plus a few
    /// spelled-out aliases.  Anything else is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "devp" | "dev" | "dev_priority" | "development" => Self::DevPriority,
            "prod" | "prodp" | "prod_priority" | "production" => Self::ProdPriority,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DevPriority => "DEV_PRIORITY",
            Self::ProdPriority => "PROD_PRIORITY",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_dev_priority(&self) -> bool {
        matches!(self, Self::DevPriority)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Production mode and the human is active.
    HumanActive,
    /// Unknown mode and the human is active.
    HumanActiveUnknownMode,
    /// A live lock held by someone else.
    LockHeld(String),
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HumanActive => f.write_str("human active; production mode yields to manual edits"),
            Self::HumanActiveUnknownMode => {
                f.write_str("human active; unknown mode treated as production")
            }
            Self::LockHeld(owner) => write!(f, "file locked ({owner})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeDecision {
    Proceed,
    Conflict(ConflictReason),
}

impl ModeDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// The mode policy.  Pure: same inputs, same answer.
pub fn decide(mode: OperatingMode, user_active: bool) -> ModeDecision {
    match (mode, user_active) {
        (OperatingMode::DevPriority, _) => ModeDecision::Proceed,
        (_, false) => ModeDecision::Proceed,
        (OperatingMode::ProdPriority, true) => ModeDecision::Conflict(ConflictReason::HumanActive),
        (OperatingMode::Unknown, true) => {
            ModeDecision::Conflict(ConflictReason::HumanActiveUnknownMode)
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classes shared by the offline and real-time paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    TimingViolation,
    /// Two same-direction events for one channel+pitch at one tick.
    OrderingInvariantBroken,
    /// Port missing, write error or send timeout. Real-time only.
    BackendFailure,
    /// The scheduler fell behind far enough to send non-ornaments late.
    OverloadCondition,
    /// A checkpoint after the expressive stage rejected the events.
    ContractViolation,
}

impl ErrorClass {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorClass::TimingViolation => "E_TIMING",
            ErrorClass::OrderingInvariantBroken => "E_ORDERING",
            ErrorClass::BackendFailure => "E_BACKEND",
            ErrorClass::OverloadCondition => "E_OVERLOAD",
            ErrorClass::ContractViolation => "E_CONTRACT",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Severity;

/// Strictness label derived purely from the iteration number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Strict,
    Moderate,
    Lenient,
}

impl Strictness {
    pub const fn for_iteration(iteration: u32) -> Self {
        match iteration {
            0 | 1 => Self::Strict,
            2 => Self::Moderate,
            _ => Self::Lenient,
        }
    }

    /// Approval threshold in tenths of a point (7.5 is 75).
    pub const fn threshold_tenths(self) -> u32 {
        match self {
            Self::Strict => 90,
            Self::Moderate => 75,
            Self::Lenient => 60,
        }
    }

    pub fn threshold_label(self) -> String {
        let t = self.threshold_tenths();
        if t % 10 == 0 {
            format!("{}", t / 10)
        } else {
            format!("{}.{}", t / 10, t % 10)
        }
    }

    pub fn meets(self, quality_score: u8) -> bool {
        u32::from(quality_score) * 10 >= self.threshold_tenths()
    }

    /// Whether an unresolved issue of `severity` still blocks approval.
    ///
    /// Catastrophic and critical issues block at every level. Major issues
    /// stop blocking once the schedule turns lenient.
    pub const fn blocks(self, severity: Severity) -> bool {
        match severity {
            Severity::Catastrophic | Severity::Critical => true,
            Severity::Major => !matches!(self, Self::Lenient),
            Severity::Minor => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Moderate => "moderate",
            Self::Lenient => "lenient",
        }
    }
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

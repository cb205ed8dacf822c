//! Run severity and process exit codes.

use std::fmt;

/// Outcome severity of a phase, a host job or the whole run.
///
/// Severities only ever escalate: once a run is [`Severity::Critical`] no
/// later soft failure brings it back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    /// Everything ran to completion.
    #[default]
    Clean,
    /// Some data could not be gathered but the run continued.
    Warning,
    /// A critical failure occurred.
    Critical,
}

impl Severity {
    /// Raise `self` to `other` if `other` is more severe.
    pub fn escalate(&mut self, other: Severity) {
        if other > *self {
            *self = other;
        }
    }

    /// Process exit code for this severity.
    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Clean => 0,
            Severity::Critical => 1,
            Severity::Warning => 2,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Clean => write!(f, "clean"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromIterator<Severity> for Severity {
    fn from_iter<I: IntoIterator<Item = Severity>>(iter: I) -> Self {
        iter.into_iter().max().unwrap_or_default()
    }
}

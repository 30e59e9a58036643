//! Phases: ordered stages grouping issues by target category.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::issue::Category;

/// Static description of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// Position in the total order; phases run in ascending ordinal.
    pub ordinal: u32,
    /// Categories whose issues belong to this phase.
    pub categories: BTreeSet<Category>,
}

impl PhaseSpec {
    pub fn new<I, S>(name: impl Into<String>, ordinal: u32, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            ordinal,
            categories: categories
                .into_iter()
                .map(Category::new)
                .collect(),
        }
    }

    pub fn targets(&self, category: &Category) -> bool {
        self.categories.contains(category)
    }
}

/// Phase state machine.
///
/// `NotStarted → Running → Validating → Completed`, with a `RolledBack` exit
/// from `Running` or `Validating`. A rolled-back phase re-enters `Running`
/// only through an explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Validating,
    Completed,
    RolledBack,
}

impl PhaseStatus {
    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Validating)
                | (Validating, Completed)
                | (Running, RolledBack)
                | (Validating, RolledBack)
                | (RolledBack, Running)
        )
    }

    /// Whether work of this phase may be in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Validating)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_happy_path_is_allowed() {
        use PhaseStatus::*;
        assert!(NotStarted.can_transition_to(Running));
        assert!(Running.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Completed));
    }

    #[test]
    fn test_phase_rejects_skipping_validation() {
        use PhaseStatus::*;
        assert!(!Running.can_transition_to(Completed));
        assert!(!NotStarted.can_transition_to(Validating));
        assert!(!Completed.can_transition_to(RolledBack));
    }

    #[test]
    fn test_phase_targets_categories() {
        let phase = PhaseSpec::new("critical", 0, ["security", "build"]);
        assert!(phase.targets(&Category::from("security")));
        assert!(!phase.targets(&Category::from("a11y")));
    }
}

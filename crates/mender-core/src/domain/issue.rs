//! Issues: the unit of work the engine schedules.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

/// Stable identifier of an issue within a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub String);

impl IssueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IssueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Issue category, matched against phase targets and agent capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Issue severity. Ordering is ascending: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one fix attempt on an issue.
///
/// Allowed transitions:
/// - `Pending → InProgress` (an agent starts working under locks)
/// - `Pending → Failed` (refused without dispatch)
/// - `InProgress → Fixed | Failed`
/// - `Failed → RolledBack`
/// - `Fixed → RolledBack` (only through an agent, phase or complete rollback)
///
/// A retry opens a new attempt, which starts again at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    InProgress,
    Fixed,
    Failed,
    RolledBack,
}

impl IssueStatus {
    /// Whether the attempt has reached a state the scheduler waits for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fixed | Self::Failed | Self::RolledBack)
    }

    pub fn can_transition_to(self, next: IssueStatus) -> bool {
        use IssueStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Fixed)
                | (InProgress, Failed)
                | (Failed, RolledBack)
                | (Fixed, RolledBack)
        )
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Fixed => "fixed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Lexical form of a work-tree path: `.` segments dropped, anything that
/// could leave the tree refused. Two spellings of one file normalize equal.
pub fn normalize_path(path: &Path) -> Result<PathBuf, &'static str> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("`..` segments are not allowed"),
            Component::RootDir | Component::Prefix(_) => return Err("absolute paths are not allowed"),
        }
    }
    if out.as_os_str().is_empty() {
        return Err("path names no file");
    }
    Ok(out)
}

fn normalized_files<'de, D>(deserializer: D) -> Result<BTreeSet<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<PathBuf>::deserialize(deserializer)?;
    raw.iter()
        .map(|p| {
            normalize_path(p).map_err(|reason| serde::de::Error::custom(format!("{}: {reason}", p.display())))
        })
        .collect()
}

/// A single issue discovered by the analysis step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub category: Category,
    pub severity: Severity,
    /// Files the fix is allowed to touch; each one is locked and backed up.
    /// Kept in [`normalize_path`] form.
    #[serde(default, deserialize_with = "normalized_files")]
    pub files: BTreeSet<PathBuf>,
    /// Issues that must be Fixed before this one may start.
    #[serde(default)]
    pub depends_on: BTreeSet<IssueId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Issue {
    pub fn new(id: impl Into<String>, category: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: IssueId::new(id),
            category: Category::new(category),
            severity,
            files: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            description: None,
        }
    }

    /// Paths that fail to normalize are kept verbatim and refused at submit.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.files.insert(normalize_path(&path).unwrap_or(path));
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(IssueId::new(id));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Ordered collection of issues handed over by the discovery step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCatalog {
    pub issues: Vec<Issue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogRepr {
    Wrapped { issues: Vec<Issue> },
    Bare(Vec<Issue>),
}

impl IssueCatalog {
    pub fn new(issues: Vec<Issue>) -> Self {
        Self { issues }
    }

    /// Parse either `{"issues": [...]}` or a bare JSON array of issues.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let issues = match serde_json::from_str::<CatalogRepr>(raw)? {
            CatalogRepr::Wrapped { issues } | CatalogRepr::Bare(issues) => issues,
        };
        Ok(Self { issues })
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter()
    }
}

impl FromIterator<Issue> for IssueCatalog {
    fn from_iter<T: IntoIterator<Item = Issue>>(iter: T) -> Self {
        Self {
            issues: iter.into_iter().collect(),
        }
    }
}

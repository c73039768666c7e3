//! The SQL text issued to begin and close each transaction level.

/// Prefix of the savepoint name used at each nesting level.
pub const SAVEPOINT_PREFIX: &str = "sp_";

/// How a transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseAction {
    Commit,
    Rollback,
}

impl CloseAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for CloseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Begin, commit and rollback statements for one nesting level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statements {
    pub begin: String,
    pub commit: String,
    pub rollback: String,
}

impl Statements {
    /// Statements for a top-level transaction, optionally with a custom begin
    /// statement such as `BEGIN IMMEDIATE`.
    pub fn root(begin: Option<String>) -> Self {
        Self {
            begin: begin.unwrap_or_else(|| "BEGIN".to_string()),
            commit: "COMMIT".to_string(),
            rollback: "ROLLBACK".to_string(),
        }
    }

    /// Statements for a child transaction at `level` (1 for the first child).
    pub fn savepoint(level: u32) -> Self {
        let name = savepoint_name(level);
        Self {
            begin: format!("SAVEPOINT {}", name),
            commit: format!("RELEASE SAVEPOINT {}", name),
            rollback: format!("ROLLBACK TO {}", name),
        }
    }

    pub fn close(&self, action: CloseAction) -> &str {
        match action {
            CloseAction::Commit => &self.commit,
            CloseAction::Rollback => &self.rollback,
        }
    }
}

/// Savepoint name for a nesting level: depends only on the depth, so siblings
/// reuse the same name.
pub fn savepoint_name(level: u32) -> String {
    format!("{}{}", SAVEPOINT_PREFIX, level)
}

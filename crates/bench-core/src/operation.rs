use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of request the benchmark issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Search,
    Update,
    Create,
}

/// How a response status is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Two writers raced on one resource and the server rejected the loser.
    /// Counted as a success but kept out of the latency histogram.
    Conflict,
    Failure,
}

impl Operation {
    /// Every operation, in series column order.
    pub const ALL: [Operation; 4] = [
        Operation::Read,
        Operation::Search,
        Operation::Update,
        Operation::Create,
    ];

    /// Position of this operation in [`Operation::ALL`].
    pub fn index(self) -> usize {
        match self {
            Operation::Read => 0,
            Operation::Search => 1,
            Operation::Update => 2,
            Operation::Create => 3,
        }
    }

    /// Capitalized name used in series column names.
    pub fn label(self) -> &'static str {
        match self {
            Operation::Read => "Read",
            Operation::Search => "Search",
            Operation::Update => "Update",
            Operation::Create => "Create",
        }
    }

    /// Whether responses of this operation report cache hits.
    pub fn is_read_side(self) -> bool {
        matches!(self, Operation::Read | Operation::Search)
    }

    /// Statuses that count as a plain success.
    pub fn success_codes(self) -> &'static [u16] {
        match self {
            Operation::Read => &[200, 404],
            Operation::Search => &[200],
            Operation::Update | Operation::Create => &[200, 201],
        }
    }

    pub fn classify(self, status: u16) -> Classification {
        if self.success_codes().contains(&status) {
            Classification::Success
        } else if self == Operation::Update && status == 409 {
            Classification::Conflict
        } else {
            Classification::Failure
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label().to_ascii_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_all_order() {
        for (idx, op) in Operation::ALL.iter().enumerate() {
            assert_eq!(op.index(), idx);
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(Operation::Read.classify(200), Classification::Success);
        assert_eq!(Operation::Read.classify(404), Classification::Success);
        assert_eq!(Operation::Search.classify(404), Classification::Failure);
        assert_eq!(Operation::Create.classify(201), Classification::Success);
        assert_eq!(Operation::Create.classify(409), Classification::Failure);
        assert_eq!(Operation::Update.classify(201), Classification::Success);
        assert_eq!(Operation::Update.classify(409), Classification::Conflict);
        assert_eq!(Operation::Update.classify(500), Classification::Failure);
    }

    #[test]
    fn test_display() {
        assert_eq!(Operation::Search.to_string(), "SEARCH");
    }
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::types::{InputType, Termination};

/// Identity of one branching site.
///
/// `id` is the basic-block number burned in at instrumentation time;
/// `context_hash` folds in the dynamic call stack, so the same textual
/// branching reached through different call chains is a distinct
/// coverage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationId {
    pub id: u32,
    pub context_hash: u64,
}

impl LocationId {
    pub fn new(id: u32, context_hash: u64) -> Self {
        Self { id, context_hash }
    }

    /// Context-free location, for programs without call-stack hashing.
    pub fn flat(id: u32) -> Self {
        Self {
            id,
            context_hash: 0,
        }
    }
}

/// The relational operator the instrumented condition distilled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    Equal,
    Unequal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Predicate {
    /// The negation; involutive (`p.opposite().opposite() == p`).
    pub fn opposite(self) -> Predicate {
        match self {
            Predicate::Equal => Predicate::Unequal,
            Predicate::Unequal => Predicate::Equal,
            Predicate::Less => Predicate::GreaterEqual,
            Predicate::LessEqual => Predicate::Greater,
            Predicate::Greater => Predicate::LessEqual,
            Predicate::GreaterEqual => Predicate::Less,
        }
    }

    pub fn holds_f64(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Predicate::Equal => lhs == rhs,
            Predicate::Unequal => lhs != rhs,
            Predicate::Less => lhs < rhs,
            Predicate::LessEqual => lhs <= rhs,
            Predicate::Greater => lhs > rhs,
            Predicate::GreaterEqual => lhs >= rhs,
        }
    }
}

/// One branching hit in an execution trace.
///
/// `value` is the branching function evaluated at the flip: its sign
/// matches `direction`, its magnitude is the distance to the other
/// branch. `xor_like` marks branchings whose value is discontinuous
/// in the inputs, which disables real-valued descent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub loc: LocationId,
    pub direction: bool,
    pub value: f64,
    pub num_stdin_bytes: u32,
    pub xor_like: bool,
    pub predicate: Predicate,
}

// One record per branching hit on the hot merge path; keep it within
// four cache lines of slack.
const_assert!(std::mem::size_of::<TraceRecord>() <= 48);

/// An ordered sequence of branching hits from one client run.
pub type ExecutionTrace = Vec<TraceRecord>;

/// Raw stdin as the runner reported it: the byte payload plus the
/// type tags of every performed read.
#[derive(Debug, Clone)]
pub struct RawStdin {
    pub bytes: Bytes,
    pub types: Vec<InputType>,
}

/// Everything the engine consumes per execution, already
/// deserialized by the transport layer.
#[derive(Debug, Clone)]
pub struct RawExecution {
    pub termination: Termination,
    pub trace: ExecutionTrace,
    pub stdin: RawStdin,
}

impl RawExecution {
    pub fn new(termination: Termination, trace: ExecutionTrace, bytes: Vec<u8>, types: Vec<InputType>) -> Self {
        Self {
            termination,
            trace,
            stdin: RawStdin {
                bytes: Bytes::from(bytes),
                types,
            },
        }
    }
}

/// Longest prefix shared by a sample trace and the reference path.
///
/// Returns the index of the first record whose `(loc, direction)`
/// differs, i.e. the length of the agreeing prefix.
pub fn diverging_index(reference: &[TraceRecord], sample: &[TraceRecord]) -> usize {
    reference
        .iter()
        .zip(sample.iter())
        .take_while(|(r, s)| r.loc == s.loc && r.direction == s.direction)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_is_involutive() {
        for p in [
            Predicate::Equal,
            Predicate::Unequal,
            Predicate::Less,
            Predicate::LessEqual,
            Predicate::Greater,
            Predicate::GreaterEqual,
        ] {
            assert_eq!(p.opposite().opposite(), p);
            assert_ne!(p.opposite(), p);
        }
    }

    #[test]
    fn diverging_index_finds_first_mismatch() {
        let rec = |id: u32, dir: bool| TraceRecord {
            loc: LocationId::flat(id),
            direction: dir,
            value: 1.0,
            num_stdin_bytes: 1,
            xor_like: false,
            predicate: Predicate::Equal,
        };
        let reference = vec![rec(1, false), rec(2, true), rec(3, false)];
        let sample = vec![rec(1, false), rec(2, false)];
        assert_eq!(diverging_index(&reference, &sample), 1);
        assert_eq!(diverging_index(&reference, &reference), 3);
    }
}

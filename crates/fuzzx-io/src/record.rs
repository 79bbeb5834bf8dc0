use serde::Serialize;

use crate::trace::LocationId;
use crate::types::InputType;

/// Flag bits carried by an [`ExecutionRecord`].
pub mod flags {
    pub const BRANCH_DISCOVERED: u8 = 1 << 0;
    pub const BRANCH_COVERED: u8 = 1 << 1;
    pub const EXECUTION_CRASHES: u8 = 1 << 2;
    pub const BOUNDARY_CONDITION_VIOLATION: u8 = 1 << 3;
    pub const MEDIUM_OVERFLOW: u8 = 1 << 4;
    pub const EMPTY_STARTUP_TRACE: u8 = 1 << 5;
}

/// One test-suite entry: an input worth keeping, with the reason
/// encoded in `flags` and the branching path it drove the client
/// through.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub flags: u8,
    pub stdin_bytes: Vec<u8>,
    pub stdin_types: Vec<InputType>,
    pub path: Vec<(LocationId, bool)>,
}

impl ExecutionRecord {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

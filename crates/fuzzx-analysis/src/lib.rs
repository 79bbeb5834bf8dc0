pub mod bitflip;
pub mod bitshare;
pub mod math;
pub mod overlay;
pub mod sensitivity;
pub mod typed;

use std::sync::Arc;

use fuzzx_dsa::BranchTree;
use fuzzx_io::{ExecutionTrace, StdinRecord};

pub use bitflip::BitflipMinimization;
pub use bitshare::BitshareAnalysis;
pub use overlay::TypedValue;
pub use sensitivity::SensitivityAnalysis;
pub use typed::TypedMinimization;

/// The engine-facing face of every analysis.
///
/// An analysis is a resumable state machine: `generate_next_input`
/// yields the next stdin bit vector to execute, or `None` once it ran
/// out of work, after which the engine must call `stop` to latch the
/// target node's flags; `process_results` consumes the trace the host
/// produced for the previously generated input. Analyses address
/// their target node by arena id only and never outlive it.
pub trait Analysis {
    fn is_ready(&self) -> bool;

    fn is_busy(&self) -> bool {
        !self.is_ready()
    }

    fn generate_next_input(&mut self, tree: &BranchTree) -> Option<Vec<bool>>;

    fn process_results(
        &mut self,
        trace: &Arc<ExecutionTrace>,
        stdin: &Arc<StdinRecord>,
        tree: &mut BranchTree,
    );

    fn stop(&mut self, tree: &mut BranchTree);
}

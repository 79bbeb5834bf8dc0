pub mod arena;
pub mod bitshare;
pub mod coverage;
pub mod loops;
pub mod node;
pub mod tree;

pub use arena::{NodeArena, NodeId};
pub use bitshare::{BitshareCache, BITSHARE_CACHE_CAP};
pub use coverage::Coverage;
pub use loops::{detect_loops_along_path, LoopBoundary, LoopInfo};
pub use node::{BranchingNode, Successor};
pub use tree::{BranchTree, TreeDelta, TreeError, TreeStats};

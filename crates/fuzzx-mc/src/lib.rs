pub mod explore;
pub mod histogram;
pub mod pivots;

pub use explore::{select_iid_coverage_target, ProbabilityGenerator};
pub use histogram::{HitCountFrame, HitCounts};
pub use pivots::{IidLocationProps, IidPivotProps, IidPivots};

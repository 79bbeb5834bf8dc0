pub mod config;
pub mod dump;
pub mod engine;
pub mod error;
pub mod stats;
pub mod targets;

pub use config::FuzzerConfig;
pub use engine::{Fuzzer, FuzzerState, RoundBegin, TerminationReason};
pub use error::EngineError;
pub use stats::{AnalysisOutcomes, EngineStats, TerminationKind};

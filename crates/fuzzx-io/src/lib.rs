pub mod bits;
pub mod record;
pub mod stdin_model;
pub mod trace;
pub mod types;
pub mod width;

pub use bits::{bits_to_bytes, bytes_to_bits, hamming_distance, StdinRecord};
pub use record::{flags, ExecutionRecord};
pub use stdin_model::{stdin_model_by_name, ReplayBytesModel, StdinModel};
pub use trace::{ExecutionTrace, LocationId, Predicate, RawExecution, RawStdin, TraceRecord};
pub use types::{InputType, Termination};

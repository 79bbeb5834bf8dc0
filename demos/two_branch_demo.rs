//! Minimal end-to-end run: one byte, one equality branching.
//!
//! The "client" is emulated in-process; a real deployment would put
//! the instrumented binary behind the same `ClientExecutor` trait.

use fuzz_x::{dump, run_fuzzing, ClientExecutor, FuzzerConfig, RawExecution, Termination};
use fuzzx_io::{InputType, LocationId, Predicate, TraceRecord};

struct TwoBranchClient;

impl ClientExecutor for TwoBranchClient {
    fn execute(&mut self, stdin_bytes: &[u8]) -> RawExecution {
        let x = stdin_bytes.first().copied().unwrap_or(0x55);
        let value = x as f64 - 42.0;
        let trace = vec![TraceRecord {
            loc: LocationId::flat(1),
            direction: Predicate::Equal.holds_f64(value, 0.0),
            value,
            num_stdin_bytes: 1,
            xor_like: false,
            predicate: Predicate::Equal,
        }];
        RawExecution::new(Termination::Normal, trace, vec![x], vec![InputType::U8])
    }
}

fn main() {
    tracing_subscriber::fmt().init();

    let outcomes = run_fuzzing(&mut TwoBranchClient, FuzzerConfig::default());
    println!("{}", dump::outcomes_to_json_string(&outcomes));
}

//! Nested conditions: the typed descent has to keep the outer
//! inequality satisfied while zeroing the inner equality.

use fuzz_x::{dump, run_fuzzing, ClientExecutor, FuzzerConfig, RawExecution, Termination};
use fuzzx_io::{InputType, LocationId, Predicate, TraceRecord};

struct NestedIfClient;

impl ClientExecutor for NestedIfClient {
    fn execute(&mut self, stdin_bytes: &[u8]) -> RawExecution {
        let mut bytes = [0x55u8; 4];
        for (slot, byte) in bytes.iter_mut().zip(stdin_bytes) {
            *slot = *byte;
        }
        let x = u32::from_le_bytes(bytes);

        let mut trace = Vec::new();
        let outer = x as f64 - 10.0;
        let took_outer = Predicate::Less.holds_f64(outer, 0.0);
        trace.push(TraceRecord {
            loc: LocationId::flat(1),
            direction: took_outer,
            value: outer,
            num_stdin_bytes: 4,
            xor_like: false,
            predicate: Predicate::Less,
        });
        if took_outer {
            let inner = x as f64 - 3.0;
            trace.push(TraceRecord {
                loc: LocationId::flat(2),
                direction: Predicate::Equal.holds_f64(inner, 0.0),
                value: inner,
                num_stdin_bytes: 4,
                xor_like: false,
                predicate: Predicate::Equal,
            });
        }
        RawExecution::new(
            Termination::Normal,
            trace,
            bytes.to_vec(),
            vec![InputType::U32],
        )
    }
}

fn main() {
    tracing_subscriber::fmt().init();

    let config = FuzzerConfig {
        max_executions: 400,
        ..FuzzerConfig::default()
    };
    let outcomes = run_fuzzing(&mut NestedIfClient, config);
    println!("{}", dump::outcomes_to_json_string(&outcomes));
}

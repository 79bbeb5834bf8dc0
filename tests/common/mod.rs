//! In-process mock client: interprets a small program against the
//! configured stdin model and produces the trace the real runner
//! would ship back.

// Each integration binary pulls in the subset it needs.
#![allow(dead_code)]

use fuzz_x::{ClientExecutor, RawExecution, Termination};
use fuzzx_io::{stdin_model_by_name, InputType, LocationId, Predicate, StdinModel, TraceRecord};

/// Execution context handed to a mock program: typed stdin reads plus
/// branching instrumentation.
pub struct ClientCtx {
    model: Box<dyn StdinModel>,
    trace: Vec<TraceRecord>,
}

impl ClientCtx {
    pub fn read_u8(&mut self) -> Result<u8, Termination> {
        let mut buf = [0u8; 1];
        self.model.read(InputType::U8, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, Termination> {
        let mut buf = [0u8; 4];
        self.model.read(InputType::U32, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Records one branching hit. `value` is the raw branching
    /// function; the condition is `predicate(value, 0)` and the taken
    /// direction is its outcome.
    pub fn branch(&mut self, loc: LocationId, value: f64, predicate: Predicate) -> bool {
        self.branch_full(loc, value, predicate, false)
    }

    pub fn branch_xor_like(&mut self, loc: LocationId, value: f64, predicate: Predicate) -> bool {
        self.branch_full(loc, value, predicate, true)
    }

    fn branch_full(
        &mut self,
        loc: LocationId,
        value: f64,
        predicate: Predicate,
        xor_like: bool,
    ) -> bool {
        let direction = predicate.holds_f64(value, 0.0);
        self.trace.push(TraceRecord {
            loc,
            direction,
            value,
            num_stdin_bytes: self.model.num_bytes_read(),
            xor_like,
            predicate,
        });
        direction
    }
}

/// Runs a program closure once per `execute` call, each time against
/// a fresh stdin model primed with the engine-produced bytes.
pub struct MockClient<F> {
    program: F,
    stdin_model_name: String,
    max_stdin_bytes: u32,
    pub executions: u32,
}

impl<F> MockClient<F>
where
    F: FnMut(&mut ClientCtx) -> Result<(), Termination>,
{
    pub fn new(program: F) -> Self {
        Self {
            program,
            stdin_model_name: "replay_bytes_then_repeat_byte".to_string(),
            max_stdin_bytes: 1800,
            executions: 0,
        }
    }

    pub fn with_max_stdin_bytes(mut self, max_stdin_bytes: u32) -> Self {
        self.max_stdin_bytes = max_stdin_bytes;
        self
    }
}

impl<F> ClientExecutor for MockClient<F>
where
    F: FnMut(&mut ClientCtx) -> Result<(), Termination>,
{
    fn execute(&mut self, stdin_bytes: &[u8]) -> RawExecution {
        let mut model = stdin_model_by_name(&self.stdin_model_name, self.max_stdin_bytes)
            .expect("known stdin model");
        model.set_bytes(stdin_bytes);
        let mut ctx = ClientCtx {
            model,
            trace: Vec::new(),
        };
        let termination = match (self.program)(&mut ctx) {
            Ok(()) => Termination::Normal,
            Err(termination) => termination,
        };
        self.executions += 1;
        RawExecution::new(
            termination,
            ctx.trace,
            ctx.model.bytes().to_vec(),
            ctx.model.types().to_vec(),
        )
    }
}

//! Fuzz-X: a coverage-guided grey-box fuzzer search engine.
//!
//! The engine drives an instrumented client through executions,
//! hunting for stdin bytes that force every conditional branch both
//! ways. The client itself lives behind [`ClientExecutor`]; the
//! engine only sees deserialized traces and emits stdin bit vectors.

pub use fuzzx_core::dump;
pub use fuzzx_core::engine::RoundBegin;
pub use fuzzx_core::{
    AnalysisOutcomes, EngineError, Fuzzer, FuzzerConfig, TerminationKind, TerminationReason,
};
pub use fuzzx_io::{bits_to_bytes, ExecutionRecord, InputType, RawExecution, Termination};

/// The host side of one client run.
///
/// Implementations launch (or emulate) the instrumented client on the
/// given stdin bytes, run it to completion under the external time
/// and memory bounds, and hand back the deserialized trace.
pub trait ClientExecutor {
    fn execute(&mut self, stdin_bytes: &[u8]) -> RawExecution;
}

/// Configures and builds a [`Fuzzer`].
pub struct FuzzerBuilder {
    config: FuzzerConfig,
    seed: Option<u64>,
}

impl FuzzerBuilder {
    pub fn new() -> Self {
        Self {
            config: FuzzerConfig::default(),
            seed: None,
        }
    }

    pub fn with_config(mut self, config: FuzzerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Fuzzer, EngineError> {
        self.config.validate()?;
        Ok(match self.seed {
            Some(seed) => Fuzzer::with_seed(self.config, seed),
            None => Fuzzer::new(self.config),
        })
    }
}

impl Default for FuzzerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The cooperative search loop: alternates input generation with
/// client execution until a budget runs out or the strategy is
/// exhausted. Never panics on engine-internal failures; they surface
/// as `ServerInternalError` outcomes.
pub fn run_fuzzing(executor: &mut dyn ClientExecutor, config: FuzzerConfig) -> AnalysisOutcomes {
    run_fuzzing_with_seed(executor, config, None)
}

pub fn run_fuzzing_with_seed(
    executor: &mut dyn ClientExecutor,
    config: FuzzerConfig,
    seed: Option<u64>,
) -> AnalysisOutcomes {
    let mut builder = FuzzerBuilder::new().with_config(config);
    if let Some(seed) = seed {
        builder = builder.with_seed(seed);
    }
    let mut fuzzer = match builder.build() {
        Ok(fuzzer) => fuzzer,
        Err(err) => {
            let fallback = Fuzzer::new(FuzzerConfig::default());
            return fallback.outcomes(
                TerminationKind::ServerInternalError,
                None,
                err.to_string(),
                Vec::new(),
            );
        }
    };

    let mut records: Vec<ExecutionRecord> = Vec::new();
    loop {
        match fuzzer.round_begin() {
            Ok(RoundBegin::Execute(bits)) => {
                let bytes = bits_to_bytes(&bits);
                let raw = executor.execute(&bytes);
                match fuzzer.round_end(&raw) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "engine failure in round_end");
                        fuzzer.terminate();
                        return fuzzer.outcomes(
                            TerminationKind::ServerInternalError,
                            None,
                            err.to_string(),
                            records,
                        );
                    }
                }
            }
            Ok(RoundBegin::Terminated(reason)) => {
                tracing::info!(?reason, "fuzzing loop finished");
                return fuzzer.outcomes(TerminationKind::Normal, Some(reason), String::new(), records);
            }
            Err(err) => {
                tracing::error!(error = %err, "engine failure in round_begin");
                fuzzer.terminate();
                return fuzzer.outcomes(
                    TerminationKind::ServerInternalError,
                    None,
                    err.to_string(),
                    records,
                );
            }
        }
    }
}

use serde::Deserialize;

use crate::error::EngineError;

/// Search budgets and host-model knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct FuzzerConfig {
    pub max_executions: u32,
    pub max_seconds: u64,
    pub max_trace_length: u32,
    pub max_stdin_bytes: u32,
    pub stdin_model_name: String,
    pub stdout_model_name: String,
    /// Keep emitting random inputs once every strategy is exhausted
    /// instead of terminating with strategy depletion.
    pub allow_blind_fuzzing: bool,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            max_executions: 40,
            max_seconds: 60,
            max_trace_length: 10_000,
            max_stdin_bytes: 1800,
            stdin_model_name: "replay_bytes_then_repeat_byte".to_string(),
            stdout_model_name: "ignore".to_string(),
            allow_blind_fuzzing: false,
        }
    }
}

impl FuzzerConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if fuzzx_io::stdin_model_by_name(&self.stdin_model_name, self.max_stdin_bytes).is_none() {
            return Err(EngineError::Config(format!(
                "unknown stdin model '{}'",
                self.stdin_model_name
            )));
        }
        if self.stdout_model_name != "ignore" {
            return Err(EngineError::Config(format!(
                "unknown stdout model '{}'",
                self.stdout_model_name
            )));
        }
        Ok(())
    }
}

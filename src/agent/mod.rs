//! Agent executor seam.
//!
//! Every agent phase of a unit is one `invoke` call. The orchestrator never
//! looks at generated content: it only needs artifact paths, the continuation
//! token, and usage figures for metrics.
//!
//! Real implementation: [`CommandAgent`]. Tests drive the orchestrator with
//! scripted implementations of [`AgentExecutor`].

pub mod command;
pub mod instructions;
pub mod stream;

pub use command::CommandAgent;
pub use instructions::{Feedback, InstructionContext, build_instructions};

use std::path::PathBuf;

use async_trait::async_trait;
use porter_common::UnitPhase;

use crate::errors::AgentError;

/// Everything an agent call needs.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub run_id: String,
    pub unit_id: String,
    pub phase: UnitPhase,
    /// 1-based attempt number of the unit
    pub attempt: u32,
    pub instructions: String,
    pub continuation_token: Option<String>,
}

/// Cost and size figures reported by the agent, when it reports any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUsage {
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turns: u64,
    pub duration_ms: u64,
}

impl AgentUsage {
    pub fn add(&mut self, other: &AgentUsage) {
        self.cost_usd += other.cost_usd;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.turns += other.turns;
        self.duration_ms += other.duration_ms;
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub artifacts: Vec<PathBuf>,
    /// Replaces the previous token when present.
    pub continuation_token: Option<String>,
    pub usage: AgentUsage,
}

/// Abstraction over the generation mechanism.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn invoke(&self, call: &AgentCall) -> Result<AgentOutput, AgentError>;
}

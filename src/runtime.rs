//! Runtime events emitted by the pipeline for observability.
//!
//! Events are lightweight (ids and short strings only) so stages can emit
//! them without blocking audio paths. Delivery is best-effort: a slow
//! subscriber lags and loses events rather than stalling the pipeline.

use serde::Serialize;

/// Which worker an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Llm,
    QuickSynthesis,
    FinalSynthesis,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Llm => "llm",
            Self::QuickSynthesis => "quick_synthesis",
            Self::FinalSynthesis => "final_synthesis",
        };
        f.write_str(name)
    }
}

/// Why a `prepare` request did not produce a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Same text as a recent request inside the debounce window.
    Duplicate,
    /// Too similar to the running generation's source text.
    TooSimilar,
    /// Empty or whitespace-only text.
    Empty,
}

/// Events that describe what the pipeline is doing "right now".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A new generation became current.
    GenerationStarted { id: u64, source_text: String },
    /// The quick answer was split off the token stream.
    QuickAnswerReady { id: u64, text: String },
    /// All stages finished without an abort.
    GenerationCompleted { id: u64, text: String },
    /// The abort coordinator stopped a generation.
    GenerationAborted { id: u64, reason: String },
    /// A stage failed and gave up on its generation.
    GenerationFailed { id: u64, stage: Stage, error: String },
    /// A `prepare` request was dropped.
    RequestIgnored { reason: IgnoreReason, text: String },
}

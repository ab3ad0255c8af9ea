//! Reply orchestration: dispatcher, stage workers and abort coordination.

pub mod abort;
pub mod audio_buffer;
pub mod boundary;
pub mod coordinator;
mod dispatcher;
pub mod generation;
pub mod history;
mod llm_stage;
pub mod messages;
pub mod similarity;
mod synthesis_stage;

//! Inbound client audio.

pub mod input_queue;

pub mod engine;
pub mod sequencer;

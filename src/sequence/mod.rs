//! Sequence playback: waveform library (C6), playback engine (C7), and the
//! façade that owns the single active run (C8).

pub mod controller;
pub mod library;
pub mod manager;

pub use controller::{SequenceController, SequenceEvent};
pub use library::SequenceLibrary;
pub use manager::SequenceManager;

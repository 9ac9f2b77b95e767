//! Trigger scripts: durable library (C6-equivalent), evaluator runtime (C9),
//! and the façade owning the single active run (C10).

pub mod library;
pub mod manager;
pub mod runtime;

pub use library::TriggerScriptLibrary;
pub use manager::TriggerScriptManager;
pub use runtime::{TriggerRuntime, TriggerRuntimeEvent};

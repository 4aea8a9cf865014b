pub mod runner;

pub use runner::{run_engine, EngineDeps, EngineOutcome};

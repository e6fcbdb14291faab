//! simulado-core: ENEM practice-exam engine.
//!
//! This crate defines the data model, store traits and the services that
//! generate, run, score and reward practice exams, plus study-time tracking.
//! Storage backends live in `simulado-store`.

pub mod bank;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod model;
pub mod parser;
pub mod ranking;
pub mod report;
pub mod rewards;
pub mod scorer;
pub mod session;
pub mod study;
pub mod traits;

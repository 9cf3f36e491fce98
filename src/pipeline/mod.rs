//! Turn-taking pipeline: stage messages and the dialogue orchestrator.

pub mod messages;
pub mod orchestrator;

//! CLI command implementations

pub mod provision;
pub mod resolve;
pub mod run;

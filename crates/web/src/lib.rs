//! Suiterun function front-end
//!
//! Exposes the test runner as a function-as-a-service handler and as a
//! small HTTP service wrapping that handler.

pub mod handler;
pub mod server;

pub use handler::{FunctionHandler, InvocationError, INVALID_TOKEN};

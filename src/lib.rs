//! Restricted execution sandbox for student-submitted Python.
//!
//! A submission passes the [`gatekeeper`], runs on the embedded Python
//! [`runtime`] in a worker process started by the [`harness`] with only the
//! names of its [`capabilities::CapabilitySet`], and comes back as a bounded
//! transcript built by [`capture`].

pub mod capabilities;
pub mod capture;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod harness;
pub mod http_server;
pub mod runtime;
pub mod sandbox;
pub mod state;

pub use capture::ExecutionResult;
pub use harness::Evaluation;
pub use sandbox::{RunOptions, Sandbox};

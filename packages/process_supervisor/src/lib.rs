//! Portable child-process lifecycle actor.
//!
//! This crate has no HTTP dependencies and no domain-specific knowledge
//! (no GOWA awareness). It owns exactly one concern: spawn a child
//! process, signal it portably, and let a caller observe its exit.
//!
//! # Example
//!
//! ```no_run
//! use process_supervisor::{ProcessActor, ProcessConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ProcessConfig {
//!         command: "/usr/local/bin/gowa".to_string(),
//!         args: vec!["rest".to_string(), "--port=8000".to_string()],
//!         working_dir: Some("/data/instances/1".to_string()),
//!         env: vec![("PORT".to_string(), "8000".to_string())],
//!     };
//!
//!     let mut handle = ProcessActor::spawn(config).unwrap();
//!     handle.wait_exited().await;
//! }
//! ```

mod actor;
mod error;

pub use actor::{ProcessActor, ProcessConfig, ProcessHandle, ProcessState};
pub use error::ProcessError;

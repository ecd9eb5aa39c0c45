//! ailaunch Launcher Library
//!
//! Core functionality for launching the packaged assistant:
//! - Subprocess supervision (ports, readiness, process-tree teardown)
//! - Instance registry for multi-instance runs
//! - Install layout discovery for the bundled executable
//! - Browser hand-off once an instance is ready

pub mod browser;
pub mod controller;
pub mod layout;
pub mod registry;
pub mod subprocess;

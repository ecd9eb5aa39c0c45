//! Subprocess supervision for the packaged assistant.

pub mod error;
pub mod manager;
pub mod port;
pub mod terminate;
pub mod types;

pub use error::SupervisorError;
pub use manager::{EventSender, ManagedProcess, Supervisor, SupervisorConfig};
pub use port::{ReservedPort, find_free_port, find_free_port_excluding, find_free_port_in, is_port_free};
pub use terminate::{TreeTerminator, platform_terminator, process_exists};
pub use types::{
    ConfigHandoff, LaunchRequest, OutputStream, ProcessEvent, ProcessState, Readiness,
};

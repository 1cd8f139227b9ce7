//! Supervision kernel for interactive background shells.
//!
//! The pieces, leaves first: [`ansi`] strips escape sequences,
//! [`ring_buffer`] bounds captured output, [`classifier`] tags notable
//! lines, [`summary`] words the poll message, [`shell`] runs one shell's
//! state machine, [`registry`] keys shells by label, and [`supervisor`]
//! fronts the whole thing for the control plane. The scheduler is internal:
//! it is the only driver of time-based transitions.

pub mod ansi;
pub mod classifier;
pub mod config;
pub mod error;
pub mod registry;
pub mod ring_buffer;
mod scheduler;
pub mod shell;
pub mod summary;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::Result;
pub use error::SupervisorError;
pub use shell::ShellListEntry;
pub use shell::ShellSnapshot;
pub use shell::ShellState;
pub use summary::NO_NOTABLE_EVENTS;
pub use supervisor::DEFAULT_CHECK_LOG_LINES;
pub use supervisor::ShellSupervisor;
pub use supervisor::StartShellParams;

//! Process-level plumbing for modlink.
//!
//! A module is an ordinary executable whose stdin and stdout carry the
//! protocol while stderr stays attached to the host's stderr. This crate
//! launches such executables and hands their stdio to the layers above:
//! - [`ModuleProcess`] spawns and supervises a module child process
//! - [`in_process_link`] builds a duplex pair for modules hosted in-process
//!   (Unix only)
//!
//! This is the lowest layer of modlink. Everything else only needs a
//! `Read` half and a `Write` half.

pub mod error;
#[cfg(unix)]
pub mod link;
pub mod process;

pub use error::{Result, TransportError};
#[cfg(unix)]
pub use link::{in_process_link, LinkEnd};
pub use process::{ModuleProcess, ModuleStdio};

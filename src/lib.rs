//! This is the VSL compiler as a library.  See the `src/bin` directory for
//! the executable driver using this library.

pub mod common;
pub mod front;
pub mod middle;
pub mod back;

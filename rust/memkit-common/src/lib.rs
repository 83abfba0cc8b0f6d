//! Core definitions shared by all memkit-* crates: the error taxonomy and the
//! `Result` alias.

pub mod error;
pub mod result;

pub use error::{Error, ErrorKind};
pub use result::Result;

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod generation;
pub mod hook;
pub mod simulate;
mod util;

pub use error::{Error, Result};
pub use exchange::Exchange;

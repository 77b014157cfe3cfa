//! Shared tracing bootstrap for the anonwatch binaries.
//!
//! `RUST_LOG` drives the filter; `RUST_LOG_FORMAT=json` switches to structured
//! JSON lines, anything else gives the compact human format.

mod subscriber;

pub use subscriber::{init, init_with_level};

#[macro_use]
extern crate tracing;

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod labels;
pub mod stats;
pub mod target_group;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod tls;
pub mod trace;

pub use discovery::Discovery;
pub use target_group::{LabelSet, TargetGroup};

#![forbid(unsafe_code)]
#![deny(unused)]

//! A tiny in-process metric registry. Metrics are registered by name, and
//! every distinct set of `Attributes` gets its own observer.

mod attributes;
mod counter;
mod histogram;
mod registry;

pub use attributes::Attributes;
pub use counter::Counter;
pub use histogram::{Histogram, HistogramObservation, ObservationBucket, exponential_buckets};
pub use registry::{Metric, Observation, Registry, Reporter};

use std::iter;
use std::sync::Arc;

use parking_lot::Mutex;

/// A bucketed observation
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationBucket {
    pub count: u64,
    pub le: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistogramObservation {
    pub buckets: Vec<ObservationBucket>,
    pub sum: f64,
}

impl HistogramObservation {
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}

#[derive(Clone, Debug)]
pub struct Histogram {
    state: Arc<Mutex<HistogramObservation>>,
}

impl Histogram {
    /// Bucket bounds are sorted and deduplicated, a `+Inf` bucket is always
    /// appended.
    pub fn new(bounds: &[f64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();

        let buckets = bounds
            .into_iter()
            .chain(iter::once(f64::INFINITY))
            .map(|le| ObservationBucket { le, count: 0 })
            .collect();

        Self {
            state: Arc::new(Mutex::new(HistogramObservation { buckets, sum: 0.0 })),
        }
    }

    pub fn record(&self, value: f64) {
        let mut state = self.state.lock();

        if let Some(bucket) = state.buckets.iter_mut().find(|b| value <= b.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.sum += value;
        }
    }

    pub fn get(&self) -> HistogramObservation {
        self.state.lock().clone()
    }
}

pub fn exponential_buckets(start: f64, factor: f64, length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| start * factor.powf(i as f64))
        .collect()
}

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attributes::{Attributes, assert_legal_key};
use crate::{Counter, Histogram, HistogramObservation};

/// The current value of one series.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Counter(u64),
    Histogram(HistogramObservation),
}

trait Observer: Clone + Send + 'static {
    fn observe(&self) -> Observation;
}

impl Observer for Counter {
    fn observe(&self) -> Observation {
        Observation::Counter(self.fetch())
    }
}

impl Observer for Histogram {
    fn observe(&self) -> Observation {
        Observation::Histogram(self.get())
    }
}

/// A named metric, holding one observer per unique set of attributes.
#[derive(Clone)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    series: Arc<Mutex<BTreeMap<Attributes, T>>>,
    make: fn(&[f64]) -> T,
    bounds: Arc<[f64]>,
}

impl<T: Clone> Metric<T> {
    fn new(
        name: &'static str,
        description: &'static str,
        make: fn(&[f64]) -> T,
        bounds: &[f64],
    ) -> Self {
        assert_legal_key(name);

        Metric {
            name,
            description,
            series: Arc::new(Mutex::new(BTreeMap::new())),
            make,
            bounds: bounds.into(),
        }
    }

    /// Returns the observer for the given attributes, creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.series
            .lock()
            .entry(attributes.into())
            .or_insert_with(|| (self.make)(&self.bounds))
            .clone()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub trait Reporter {
    fn start_metric(&mut self, name: &'static str, description: &'static str);

    fn report(&mut self, attrs: &Attributes, observation: Observation);

    /// Finish recording a given metric
    fn finish_metric(&mut self);
}

#[derive(Clone, Default)]
pub struct Registry {
    counters: Arc<Mutex<BTreeMap<&'static str, Metric<Counter>>>>,
    histograms: Arc<Mutex<BTreeMap<&'static str, Metric<Histogram>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same name twice returns the already registered metric.
    pub fn register_counter(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<Counter> {
        self.counters
            .lock()
            .entry(name)
            .or_insert_with(|| Metric::new(name, description, |_| Counter::default(), &[]))
            .clone()
    }

    pub fn register_histogram(
        &self,
        name: &'static str,
        description: &'static str,
        bounds: &[f64],
    ) -> Metric<Histogram> {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| Metric::new(name, description, Histogram::new, bounds))
            .clone()
    }

    pub fn report(&self, reporter: &mut impl Reporter) {
        report_all(reporter, &self.counters.lock());
        report_all(reporter, &self.histograms.lock());
    }
}

fn report_all<T: Observer>(
    reporter: &mut impl Reporter,
    metrics: &BTreeMap<&'static str, Metric<T>>,
) {
    for metric in metrics.values() {
        reporter.start_metric(metric.name, metric.description);
        for (attrs, observer) in metric.series.lock().iter() {
            reporter.report(attrs, observer.observe());
        }
        reporter.finish_metric();
    }
}

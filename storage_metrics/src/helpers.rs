use log::warn;
use prometheus::{Histogram, HistogramTimer, HistogramVec, IntCounterVec, IntGaugeVec};

pub fn start_timer_vec(histogram_vec: &HistogramVec, labels: &[&str]) -> Option<HistogramTimer> {
    match histogram_vec
        .get_metric_with_label_values(labels)
        .as_ref()
        .map(Histogram::start_timer)
    {
        Ok(timer) => Some(timer),
        Err(error) => {
            warn!("unable to observe {labels:?} metric for histogram_vec ({histogram_vec:?}): {error}");

            None
        }
    }
}

pub fn increment_counter_vec(counter_vec: &IntCounterVec, labels: &[&str]) {
    match counter_vec.get_metric_with_label_values(labels) {
        Ok(counter) => counter.inc(),
        Err(error) => {
            warn!("unable to increment {labels:?} metric for counter_vec ({counter_vec:?}): {error}");
        }
    }
}

pub fn set_gauge_vec(gauge_vec: &IntGaugeVec, labels: &[&str], value: i64) {
    match gauge_vec.get_metric_with_label_values(labels) {
        Ok(gauge) => gauge.set(value),
        Err(error) => {
            warn!("unable to set {labels:?} metric for gauge_vec ({gauge_vec:?}): {error}");
        }
    }
}

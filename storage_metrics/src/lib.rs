pub use crate::{
    helpers::{increment_counter_vec, set_gauge_vec, start_timer_vec},
    metrics::{StorageMetrics, METRICS},
};

mod helpers;
mod metrics;

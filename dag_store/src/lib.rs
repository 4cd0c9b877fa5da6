pub use crate::{
    caching::CachingDagStore,
    durable::DurableDagStore,
    error::Error,
    index_cache::WeightedIndexCache,
    metered::MeteredDagStore,
    store::{BlockDagStore, RankGroup},
};

mod caching;
mod durable;
mod error;
mod index_cache;
mod metered;
mod store;

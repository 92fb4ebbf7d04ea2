pub mod backoff;

pub use backoff::{
    calculate_backoff_millis, BackoffConfig, ExponentialBackoff, MAX_BACKOFF_MILLIS, RANDOM_FACTOR,
};

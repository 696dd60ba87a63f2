//! Tunable limits for the bucket catalog.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. The catalog snapshots these values into a [`CatalogConfig`] at
//! construction; a running catalog does not observe later changes.
//!
//! [`CatalogConfig`]: crate::CatalogConfig

use std::{
    env,
    str::FromStr,
    sync::LazyLock,
};

use value::MAX_USER_DOCUMENT_SIZE;

/// Read a knob override from the environment, keeping the default when the
/// variable is absent or unparseable. Overrides are logged so a deployment's
/// effective limits can be reconstructed from its startup output.
fn env_config<T: FromStr>(name: &str, default: T) -> T {
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => {
            tracing::info!("Overriding {name} to {raw} from the environment");
            value
        },
        Err(_) => {
            tracing::warn!("Ignoring unparseable value {raw:?} for {name}");
            default
        },
    }
}

/// Maximum number of measurements in a bucket before it must be closed.
pub static TIMESERIES_BUCKET_MAX_COUNT: LazyLock<u32> =
    LazyLock::new(|| env_config("TIMESERIES_BUCKET_MAX_COUNT", 1000));

/// Minimum number of measurements below which a bucket that overflows the
/// size limit may be kept open for large measurements (requires the
/// scalability improvements to be enabled).
pub static TIMESERIES_BUCKET_MIN_COUNT: LazyLock<u32> =
    LazyLock::new(|| env_config("TIMESERIES_BUCKET_MIN_COUNT", 10));

/// Maximum serialized size of a bucket in bytes. The default is the maximum
/// user document size; buckets kept open for large measurements are bounded
/// separately (see the catalog module).
pub static TIMESERIES_BUCKET_MAX_SIZE: LazyLock<u32> =
    LazyLock::new(|| env_config("TIMESERIES_BUCKET_MAX_SIZE", MAX_USER_DOCUMENT_SIZE as u32));

/// Once the catalog's total memory footprint exceeds this many bytes, idle
/// buckets are expired on every allocation until it drops back under.
pub static TIMESERIES_IDLE_BUCKET_EXPIRY_MEMORY_USAGE_THRESHOLD_BYTES: LazyLock<u64> =
    LazyLock::new(|| {
        env_config(
            "TIMESERIES_IDLE_BUCKET_EXPIRY_MEMORY_USAGE_THRESHOLD_BYTES",
            100 * 1024 * 1024,
        )
    });

/// Bound on how many buckets a single expiry pass will close or archive, so
/// no individual insert absorbs an unbounded cleanup.
pub static TIMESERIES_IDLE_BUCKET_EXPIRY_MAX_COUNT_PER_ATTEMPT: LazyLock<u32> =
    LazyLock::new(|| env_config("TIMESERIES_IDLE_BUCKET_EXPIRY_MAX_COUNT_PER_ATTEMPT", 3));

/// Gates archival behavior: when enabled, buckets rolled over for time range
/// or memory pressure are archived (cheap to reopen) instead of closed.
pub static TIMESERIES_SCALABILITY_IMPROVEMENTS_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("TIMESERIES_SCALABILITY_IMPROVEMENTS_ENABLED", false));

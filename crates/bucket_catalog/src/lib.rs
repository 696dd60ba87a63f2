//! In-memory bucket catalog for time-series collections.
//!
//! The catalog decides which bucket each incoming measurement belongs to,
//! when a bucket must roll over (close or archive) and a replacement be
//! opened, how concurrent writers batch updates to the same bucket while
//! commits stay serialized per bucket, and when idle buckets are expired
//! under memory pressure.
//!
//! The write path: [`BucketCatalog::insert`] resolves a bucket under its
//! stripe's lock and appends the measurement to a per-operation
//! [`WriteBatch`]. The caller then claims the batch's commit rights, calls
//! [`BucketCatalog::prepare_commit`], performs its own persistence, and
//! resolves the batch with [`BucketCatalog::finish`] or
//! [`BucketCatalog::abort`].

mod batch;
mod bucket;
mod catalog;
pub mod knobs;
mod metadata;
pub mod minmax;
pub mod options;
pub mod schema;
mod state;
mod stats;

#[cfg(test)]
mod tests;

pub use batch::{
    BucketHandle,
    CommitInfo,
    OperationId,
    StripeNumber,
    WriteBatch,
};
pub use bucket::{
    ClosedBucket,
    ClosedBuckets,
};
pub use catalog::{
    BucketCatalog,
    CatalogConfig,
    CombineWithInsertsFromOtherClients,
    InsertResult,
    TimeseriesCollection,
    NUMBER_OF_STRIPES,
};
pub use metadata::{
    BucketKey,
    BucketMetadata,
};
pub use minmax::MinMax;
pub use options::{
    Granularity,
    TimeseriesOptions,
};
pub use schema::{
    Schema,
    UpdateStatus,
};
pub use state::BucketState;
pub use stats::{
    ExecutionStats,
    ExecutionStatsController,
};

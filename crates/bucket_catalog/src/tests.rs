use std::sync::Arc;

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use value::{
    date_from_millis,
    doc,
    Document,
    Namespace,
    ObjectId,
    Value,
};

use crate::{
    batch::WriteBatch,
    catalog::{
        BucketCatalog,
        CatalogConfig,
        CombineWithInsertsFromOtherClients,
        InsertResult,
        TimeseriesCollection,
        NUMBER_OF_STRIPES,
    },
    metadata::{
        BucketKey,
        BucketMetadata,
    },
    options::TimeseriesOptions,
    CommitInfo,
};

fn test_ns() -> Namespace {
    "db.t".parse().unwrap()
}

fn test_options() -> TimeseriesOptions {
    TimeseriesOptions::new("t".parse().unwrap()).with_meta_field("m".parse().unwrap())
}

fn test_config() -> CatalogConfig {
    CatalogConfig {
        bucket_max_count: 1000,
        bucket_min_count: 10,
        bucket_max_size: 16 * 1024 * 1024,
        // Effectively disables idle expiry; memory-pressure tests lower it.
        idle_bucket_expiry_memory_usage_threshold: u64::MAX,
        idle_bucket_expiry_max_count_per_attempt: 3,
        scalability_improvements_enabled: false,
    }
}

fn insert(catalog: &BucketCatalog, doc: Document) -> InsertResult {
    catalog
        .insert(
            test_ns(),
            None,
            &test_options(),
            doc,
            0,
            CombineWithInsertsFromOtherClients::Allow,
        )
        .unwrap()
}

async fn commit_batch(catalog: &BucketCatalog, batch: &Arc<WriteBatch>) -> Option<crate::ClosedBucket> {
    assert!(batch.claim_commit_rights());
    catalog.prepare_commit(batch.clone()).await.unwrap();
    catalog.finish(batch.clone(), CommitInfo::default())
}

fn collection_stat(catalog: &BucketCatalog, name: &str) -> i64 {
    let mut builder = Document::new();
    catalog.append_execution_stats(&test_ns(), &mut builder);
    match builder.get(name) {
        Some(Value::Int64(v)) => *v,
        _ => 0,
    }
}

/// Find a metadata value whose bucket key lands on the same stripe as
/// `reference`'s, so single-stripe behaviors can be tested across two
/// distinct series.
fn meta_on_same_stripe(reference: &str) -> String {
    let stripe_of = |meta: &str| {
        let key = BucketKey::new(
            test_ns(),
            BucketMetadata::new(Some(("m".parse().unwrap(), Value::from(meta))), None),
        );
        key.hash % NUMBER_OF_STRIPES as u64
    };
    let target = stripe_of(reference);
    (0..)
        .map(|i| format!("other-{i}"))
        .find(|candidate| stripe_of(candidate) == target)
        .expect("some candidate lands on the same stripe")
}

#[tokio::test]
async fn test_basic_insert_commit_flow() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => 1i64 },
    );
    assert!(result.closed_buckets.is_empty());

    let batch = result.batch;
    // The bucket id's timestamp is the minute-rounded window start.
    assert_eq!(batch.bucket().id.timestamp(), 60);
    assert!(batch.claim_commit_rights());
    catalog.prepare_commit(batch.clone()).await.unwrap();
    assert_eq!(batch.measurements().len(), 1);
    assert_eq!(batch.num_previously_committed_measurements(), 0);

    let closed = catalog.finish(batch.clone(), CommitInfo::default());
    assert!(closed.is_none());
    assert_eq!(batch.get_result().await.unwrap(), CommitInfo::default());

    assert_eq!(collection_stat(&catalog, "numBucketInserts"), 1);
    assert_eq!(collection_stat(&catalog, "numCommits"), 1);
    assert_eq!(collection_stat(&catalog, "numMeasurementsCommitted"), 1);

    // A second measurement lands on the same bucket as an update.
    let result = insert(
        &catalog,
        doc! { "t" => date_from_millis(61_000), "m" => "a", "x" => 2i64 },
    );
    let batch = result.batch;
    assert!(batch.claim_commit_rights());
    catalog.prepare_commit(batch.clone()).await.unwrap();
    assert_eq!(batch.num_previously_committed_measurements(), 1);
    catalog.finish(batch, CommitInfo::default());
    assert_eq!(collection_stat(&catalog, "numBucketUpdates"), 1);
}

#[tokio::test]
async fn test_combining_inserts_shares_one_batch() {
    let catalog = BucketCatalog::with_config(test_config());
    let first = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let second = insert(&catalog, doc! { "t" => date_from_millis(60_500), "m" => "a" });
    assert!(Arc::ptr_eq(&first.batch, &second.batch));
    assert_eq!(first.batch.measurements().len(), 2);

    // Distinct operations that disallow combining get distinct batches.
    let third = catalog
        .insert(
            test_ns(),
            None,
            &test_options(),
            doc! { "t" => date_from_millis(60_700), "m" => "a" },
            7,
            CombineWithInsertsFromOtherClients::Disallow,
        )
        .unwrap();
    assert!(!Arc::ptr_eq(&first.batch, &third.batch));
    assert_eq!(third.batch.bucket(), first.batch.bucket());
}

#[test]
fn test_insert_requires_datetime_time_field() {
    let catalog = BucketCatalog::with_config(test_config());
    for bad_doc in [doc! { "m" => "a" }, doc! { "t" => 60_000i64, "m" => "a" }] {
        let err = catalog
            .insert(
                test_ns(),
                None,
                &test_options(),
                bad_doc,
                0,
                CombineWithInsertsFromOtherClients::Allow,
            )
            .unwrap_err();
        assert!(err.is_bad_value());
    }
}

#[tokio::test]
async fn test_schema_change_closes_committed_bucket() {
    let catalog = BucketCatalog::with_config(test_config());
    let first = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => 1i64 },
    );
    let first_bucket = first.batch.bucket().id;
    commit_batch(&catalog, &first.batch).await;

    // Same field, different type: the open bucket can't take it.
    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => "s" },
    );
    assert_ne!(second.batch.bucket().id, first_bucket);
    assert_eq!(second.closed_buckets.len(), 1);
    assert_eq!(second.closed_buckets[0].bucket_id, first_bucket);
    assert!(!second.closed_buckets[0].eligible_for_reopening);
    assert_eq!(collection_stat(&catalog, "numBucketsClosedDueToSchemaChange"), 1);

    // The old bucket is fully gone; rollover is one-way.
    let live: usize = catalog.sum_over_stripes(|stripe| {
        usize::from(stripe.all_buckets.contains_key(&first_bucket))
    });
    assert_eq!(live, 0);
}

#[tokio::test]
async fn test_schema_change_defers_close_until_finish() {
    let catalog = BucketCatalog::with_config(test_config());
    let first = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => 1i64 },
    );
    let first_bucket = first.batch.bucket().id;

    // The first batch is still pending, so the close must wait for it.
    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => "s" },
    );
    assert_ne!(second.batch.bucket().id, first_bucket);
    assert!(second.closed_buckets.is_empty());

    let closed = commit_batch(&catalog, &first.batch).await;
    let closed = closed.expect("deferred close applies on the last finish");
    assert_eq!(closed.bucket_id, first_bucket);
    assert_eq!(closed.num_measurements, 1);
}

#[tokio::test]
async fn test_count_rollover() {
    let mut config = test_config();
    config.bucket_max_count = 2;
    let catalog = BucketCatalog::with_config(config);

    for ms in [60_000, 60_500] {
        let result = insert(&catalog, doc! { "t" => date_from_millis(ms), "m" => "a" });
        commit_batch(&catalog, &result.batch).await;
    }
    let result = insert(&catalog, doc! { "t" => date_from_millis(61_000), "m" => "a" });
    assert_eq!(result.closed_buckets.len(), 1);
    assert_eq!(result.closed_buckets[0].num_measurements, 2);
    assert_eq!(collection_stat(&catalog, "numBucketsClosedDueToCount"), 1);
}

#[tokio::test]
async fn test_time_forward_closes_without_scalability() {
    let catalog = BucketCatalog::with_config(test_config());
    let first = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    commit_batch(&catalog, &first.batch).await;

    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000 + 3_600_000), "m" => "a" },
    );
    assert_eq!(second.closed_buckets.len(), 1);
    assert_eq!(collection_stat(&catalog, "numBucketsClosedDueToTimeForward"), 1);
}

#[tokio::test]
async fn test_time_forward_archives_with_scalability() {
    let mut config = test_config();
    config.scalability_improvements_enabled = true;
    let catalog = BucketCatalog::with_config(config);

    let first = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let first_bucket = first.batch.bucket().id;
    commit_batch(&catalog, &first.batch).await;

    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000 + 3_600_000), "m" => "a" },
    );
    // Archived, not closed: nothing is handed back to the caller.
    assert!(second.closed_buckets.is_empty());
    assert_ne!(second.batch.bucket().id, first_bucket);
    assert_eq!(collection_stat(&catalog, "numBucketsArchivedDueToTimeForward"), 1);

    let archived: usize =
        catalog.sum_over_stripes(|stripe| stripe.archived_buckets.values().map(|s| s.len()).sum());
    assert_eq!(archived, 1);
}

#[tokio::test]
async fn test_time_backward_archives_with_scalability() {
    let mut config = test_config();
    config.scalability_improvements_enabled = true;
    let catalog = BucketCatalog::with_config(config);

    let first = insert(&catalog, doc! { "t" => date_from_millis(3_600_000), "m" => "a" });
    commit_batch(&catalog, &first.batch).await;

    let second = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    assert!(second.closed_buckets.is_empty());
    assert_eq!(collection_stat(&catalog, "numBucketsArchivedDueToTimeBackward"), 1);
}

#[tokio::test]
async fn test_size_rollover() {
    let mut config = test_config();
    config.bucket_max_size = 256;
    let catalog = BucketCatalog::with_config(config);

    let first = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "s" => "x".repeat(64) },
    );
    commit_batch(&catalog, &first.batch).await;

    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_500), "m" => "a", "s" => "y".repeat(64) },
    );
    assert_eq!(second.closed_buckets.len(), 1);
    assert_eq!(collection_stat(&catalog, "numBucketsClosedDueToSize"), 1);
}

#[tokio::test]
async fn test_large_measurements_keep_bucket_open() {
    let mut config = test_config();
    config.bucket_max_size = 256;
    config.scalability_improvements_enabled = true;
    let catalog = BucketCatalog::with_config(config);

    let first = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => "a", "s" => "x".repeat(64) },
    );
    let first_bucket = first.batch.bucket().id;
    commit_batch(&catalog, &first.batch).await;

    // Overflows the configured max size, but the bucket has fewer than
    // bucket_min_count measurements and stays open for large measurements.
    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_500), "m" => "a", "s" => "y".repeat(64) },
    );
    assert!(second.closed_buckets.is_empty());
    assert_eq!(second.batch.bucket().id, first_bucket);
    assert_eq!(
        collection_stat(&catalog, "numBucketsKeptOpenDueToLargeMeasurements"),
        1
    );

    // The latch only counts once per bucket.
    let third = insert(
        &catalog,
        doc! { "t" => date_from_millis(61_000), "m" => "a", "s" => "z".repeat(64) },
    );
    assert_eq!(third.batch.bucket().id, first_bucket);
    assert_eq!(
        collection_stat(&catalog, "numBucketsKeptOpenDueToLargeMeasurements"),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_prepare_serializes_commits() {
    let catalog = Arc::new(BucketCatalog::with_config(test_config()));
    let options = test_options();

    let batch_for_op = |op_id| {
        catalog
            .insert(
                test_ns(),
                None,
                &options,
                doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => op_id as i64 },
                op_id,
                CombineWithInsertsFromOtherClients::Disallow,
            )
            .unwrap()
            .batch
    };
    let first = batch_for_op(1);
    let second = batch_for_op(2);
    assert_eq!(first.bucket(), second.bucket());
    assert!(first.claim_commit_rights());
    assert!(second.claim_commit_rights());

    catalog.prepare_commit(first.clone()).await.unwrap();

    let second_prepare = tokio::spawn({
        let catalog = catalog.clone();
        let second = second.clone();
        async move { catalog.prepare_commit(second).await }
    });
    // The second prepare must wait for the first batch to resolve.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!second_prepare.is_finished());

    catalog.finish(first.clone(), CommitInfo::default());
    second_prepare.await.unwrap().unwrap();

    // Exactly one batch is prepared at any instant; it's the second now.
    let prepared_is_second: usize = catalog.sum_over_stripes(|stripe| {
        stripe
            .all_buckets
            .values()
            .filter(|bucket| {
                bucket
                    .prepared_batch
                    .as_ref()
                    .is_some_and(|prepared| Arc::ptr_eq(prepared, &second))
            })
            .count()
    });
    assert_eq!(prepared_is_second, 1);

    catalog.finish(second.clone(), CommitInfo::default());
    assert_eq!(second.num_previously_committed_measurements(), 1);
    assert!(collection_stat(&catalog, "numWaits") >= 1);
    assert_eq!(collection_stat(&catalog, "numCommits"), 2);
}

#[tokio::test]
async fn test_clear_during_prepared_commit_raises_write_conflict() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let batch = result.batch;
    let bucket_id = batch.bucket().id;

    assert!(batch.claim_commit_rights());
    catalog.prepare_commit(batch.clone()).await.unwrap();

    let err = catalog.clear_bucket(bucket_id).unwrap_err();
    assert!(err.is_write_conflict());

    // The prepared batch still finishes; the bucket is dropped afterwards.
    assert!(catalog.finish(batch.clone(), CommitInfo::default()).is_none());
    assert_eq!(batch.get_result().await.unwrap(), CommitInfo::default());

    // A later insert for the same series opens a fresh bucket.
    let next = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    assert_ne!(next.batch.bucket().id, bucket_id);
}

#[tokio::test]
async fn test_clear_unprepared_bucket_invalidates_inserts() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let bucket_id = result.batch.bucket().id;

    catalog.clear_bucket(bucket_id).unwrap();

    // The cleared bucket is replaced on the next insert, and its pending
    // batch is aborted in the process.
    let next = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    assert_ne!(next.batch.bucket().id, bucket_id);
    let err = result.batch.get_result().await.unwrap_err();
    assert!(err.is_bucket_cleared());
}

#[tokio::test]
async fn test_memory_threshold_closes_idle_bucket() {
    let mut config = test_config();
    config.idle_bucket_expiry_memory_usage_threshold = 1;
    let catalog = BucketCatalog::with_config(config);

    let first = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let first_bucket = first.batch.bucket().id;
    commit_batch(&catalog, &first.batch).await;

    // Allocating a bucket for a second series on the same stripe trips the
    // expiry pass, which closes the idle bucket.
    let other_meta = meta_on_same_stripe("a");
    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => other_meta.as_str() },
    );
    assert_eq!(second.closed_buckets.len(), 1);
    assert_eq!(second.closed_buckets[0].bucket_id, first_bucket);
    assert!(!second.closed_buckets[0].eligible_for_reopening);
    assert_eq!(
        collection_stat(&catalog, "numBucketsClosedDueToMemoryThreshold"),
        1
    );
}

#[tokio::test]
async fn test_memory_threshold_archives_then_drops_archived() {
    let mut config = test_config();
    config.idle_bucket_expiry_memory_usage_threshold = 1;
    config.scalability_improvements_enabled = true;
    let catalog = BucketCatalog::with_config(config);

    let first = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let first_bucket = first.batch.bucket().id;
    commit_batch(&catalog, &first.batch).await;

    // One expiry pass archives the idle bucket and, still over the
    // threshold, immediately drops the archived residue too. The dropped
    // entry is handed back as reopenable.
    let other_meta = meta_on_same_stripe("a");
    let second = insert(
        &catalog,
        doc! { "t" => date_from_millis(60_000), "m" => other_meta.as_str() },
    );
    assert_eq!(second.closed_buckets.len(), 1);
    assert_eq!(second.closed_buckets[0].bucket_id, first_bucket);
    assert!(second.closed_buckets[0].eligible_for_reopening);
    assert_eq!(
        collection_stat(&catalog, "numBucketsArchivedDueToMemoryThreshold"),
        1
    );
    assert_eq!(
        collection_stat(&catalog, "numBucketsClosedDueToMemoryThreshold"),
        1
    );

    let archived: usize =
        catalog.sum_over_stripes(|stripe| stripe.archived_buckets.values().map(|s| s.len()).sum());
    assert_eq!(archived, 0);
}

#[tokio::test]
async fn test_clear_namespace_aborts_outstanding_batches() {
    let catalog = BucketCatalog::with_config(test_config());
    let first = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let second = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "b" });
    assert_eq!(collection_stat(&catalog, "numBucketsOpenedDueToMetadata"), 2);

    catalog.clear_namespace(&test_ns());

    for batch in [first.batch, second.batch] {
        let err = batch.get_result().await.unwrap_err();
        assert!(err.is_bucket_cleared());
    }
    let live: usize = catalog.sum_over_stripes(|stripe| stripe.all_buckets.len());
    assert_eq!(live, 0);
    // The namespace's stats were dropped along with its buckets.
    assert_eq!(collection_stat(&catalog, "numBucketsOpenedDueToMetadata"), 0);
}

#[tokio::test]
async fn test_abort_resolves_batch_and_drops_bucket() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let batch = result.batch;
    assert!(batch.claim_commit_rights());

    catalog.abort(
        batch.clone(),
        ErrorMetadata::bad_value("WriteFailed", "persistence failed"),
    );
    let err = batch.get_result().await.unwrap_err();
    assert!(err.is_bad_value());

    let live: usize = catalog.sum_over_stripes(|stripe| stripe.all_buckets.len());
    assert_eq!(live, 0);
}

#[tokio::test]
async fn test_prepare_commit_observes_background_abort() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let batch = result.batch;

    catalog.clear_namespace(&test_ns());

    assert!(batch.claim_commit_rights());
    let err = catalog.prepare_commit(batch).await.unwrap_err();
    assert!(err.is_bucket_cleared());
}

fn reopenable_bucket_doc(bucket_id: ObjectId) -> Document {
    doc! {
        "_id" => bucket_id,
        "control" => doc! {
            "version" => 1i64,
            "min" => doc! { "t" => date_from_millis(60_000), "x" => 1i64 },
            "max" => doc! { "t" => date_from_millis(62_000), "x" => 3i64 },
        },
        "m" => "a",
        "data" => doc! {
            "t" => doc! {
                "0" => date_from_millis(60_000),
                "1" => date_from_millis(61_000),
                "2" => date_from_millis(62_000),
            },
            "x" => doc! { "0" => 1i64, "1" => 2i64, "2" => 3i64 },
        },
    }
}

fn test_collection() -> TimeseriesCollection {
    TimeseriesCollection {
        ns: test_ns(),
        options: Some(test_options()),
        collator: None,
    }
}

#[tokio::test]
async fn test_reopen_bucket_accepts_new_measurements() {
    let mut config = test_config();
    config.scalability_improvements_enabled = true;
    let catalog = BucketCatalog::with_config(config);

    let mut bucket_id = ObjectId::generate();
    bucket_id.set_timestamp(60);
    catalog
        .reopen_bucket(&test_collection(), reopenable_bucket_doc(bucket_id))
        .unwrap();
    assert_eq!(collection_stat(&catalog, "numBucketsReopened"), 1);

    // A measurement for the same series lands on the reopened bucket and
    // commits as an update over its persisted measurements.
    let result = insert(
        &catalog,
        doc! { "t" => date_from_millis(62_500), "m" => "a", "x" => 4i64 },
    );
    let batch = result.batch;
    assert_eq!(batch.bucket().id, bucket_id);
    assert!(batch.claim_commit_rights());
    catalog.prepare_commit(batch.clone()).await.unwrap();
    assert_eq!(batch.num_previously_committed_measurements(), 3);
    catalog.finish(batch, CommitInfo::default());
    assert_eq!(collection_stat(&catalog, "numBucketUpdates"), 1);
}

#[test]
fn test_reopen_compressed_bucket_counts_column_elements() {
    let catalog = BucketCatalog::with_config(test_config());
    let bucket_id = ObjectId::generate();
    let mut column = 5u32.to_le_bytes().to_vec();
    column.extend_from_slice(b"packed-times");
    let bucket_doc = doc! {
        "_id" => bucket_id,
        "control" => doc! {
            "version" => 2i64,
            "min" => doc! { "t" => date_from_millis(60_000) },
            "max" => doc! { "t" => date_from_millis(64_000) },
        },
        "m" => "a",
        "data" => doc! { "t" => Value::Binary(column) },
    };
    catalog.reopen_bucket(&test_collection(), bucket_doc).unwrap();

    let num_measurements: u32 = catalog.sum_over_stripes(|stripe| {
        stripe
            .all_buckets
            .get(&bucket_id)
            .map_or(0, |bucket| bucket.num_measurements)
    });
    assert_eq!(num_measurements, 5);
}

#[test]
fn test_reopen_rejects_malformed_documents() {
    let catalog = BucketCatalog::with_config(test_config());
    let coll = test_collection();

    let missing_id = doc! { "control" => doc! {}, "data" => doc! {} };
    assert!(catalog.reopen_bucket(&coll, missing_id).unwrap_err().is_bad_value());

    let missing_control = doc! { "_id" => ObjectId::generate(), "data" => doc! {} };
    assert!(catalog
        .reopen_bucket(&coll, missing_control)
        .unwrap_err()
        .is_bad_value());

    let no_time_column = doc! {
        "_id" => ObjectId::generate(),
        "control" => doc! {
            "min" => doc! { "t" => date_from_millis(60_000) },
            "max" => doc! { "t" => date_from_millis(62_000) },
        },
        "data" => doc! { "x" => doc! { "0" => 1i64 } },
    };
    assert!(catalog
        .reopen_bucket(&coll, no_time_column)
        .unwrap_err()
        .is_bad_value());
}

#[test]
#[should_panic(expected = "non-timeseries")]
fn test_reopen_requires_timeseries_options() {
    let catalog = BucketCatalog::with_config(test_config());
    let coll = TimeseriesCollection {
        ns: test_ns(),
        options: None,
        collator: None,
    };
    let _ = catalog.reopen_bucket(&coll, reopenable_bucket_doc(ObjectId::generate()));
}

#[test]
fn test_get_metadata() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    assert_eq!(catalog.get_metadata(result.batch.bucket()), doc! { "m" => "a" });

    let unknown = crate::BucketHandle {
        id: ObjectId::generate(),
        stripe: 0,
    };
    assert!(catalog.get_metadata(&unknown).is_empty());
}

#[tokio::test]
async fn test_server_status() {
    let catalog = BucketCatalog::with_config(test_config());
    assert!(catalog.server_status().is_empty());

    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    commit_batch(&catalog, &result.batch).await;

    let status = catalog.server_status();
    assert_eq!(status.get("numBuckets"), Some(&Value::Int64(1)));
    assert_eq!(status.get("numOpenBuckets"), Some(&Value::Int64(1)));
    assert_eq!(status.get("numIdleBuckets"), Some(&Value::Int64(1)));
    let Some(Value::Int64(memory)) = status.get("memoryUsage") else {
        panic!("memoryUsage should be reported");
    };
    assert!(*memory > 0);
    assert_eq!(status.get("numCommits"), Some(&Value::Int64(1)));
}

#[tokio::test]
async fn test_idle_list_tracks_pending_batches() {
    let catalog = BucketCatalog::with_config(test_config());
    let result = insert(&catalog, doc! { "t" => date_from_millis(60_000), "m" => "a" });
    let bucket_id = result.batch.bucket().id;
    let stripe_number = result.batch.bucket().stripe;

    // Pending batch: not idle.
    {
        let stripe = catalog.stripes[stripe_number].lock();
        assert!(stripe.idle_buckets.is_empty());
        assert!(stripe.all_buckets[&bucket_id].idle_list_entry.is_none());
    }

    commit_batch(&catalog, &result.batch).await;

    // Everything committed: idle, and the list entry matches.
    {
        let stripe = catalog.stripes[stripe_number].lock();
        let entry = stripe.all_buckets[&bucket_id]
            .idle_list_entry
            .expect("committed bucket is idle");
        assert_eq!(stripe.idle_buckets.get(&entry), Some(&bucket_id));
    }

    // Another insert takes it off the idle list again.
    let result = insert(&catalog, doc! { "t" => date_from_millis(61_000), "m" => "a" });
    assert_eq!(result.batch.bucket().id, bucket_id);
    {
        let stripe = catalog.stripes[stripe_number].lock();
        assert!(stripe.idle_buckets.is_empty());
        assert!(stripe.all_buckets[&bucket_id].idle_list_entry.is_none());
    }
}

#[tokio::test]
async fn test_memory_counter_matches_live_buckets() {
    let catalog = BucketCatalog::with_config(test_config());
    for (ms, meta) in [(60_000, "a"), (60_100, "b"), (60_200, "a")] {
        let result = insert(&catalog, doc! { "t" => date_from_millis(ms), "m" => meta, "x" => 1i64 });
        commit_batch(&catalog, &result.batch).await;
    }

    let expected: u64 = catalog.sum_over_stripes(|stripe| {
        stripe
            .all_buckets
            .values()
            .map(|bucket| bucket.memory_usage)
            .sum::<u64>()
    });
    assert_eq!(catalog.memory_usage(), expected);
}

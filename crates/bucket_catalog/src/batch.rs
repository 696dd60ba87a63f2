//! One operation's pending measurements against a bucket.
//!
//! A batch accumulates measurements under the stripe lock, then commits
//! through the three-step protocol: `prepare_commit` serializes it against
//! the bucket, the caller persists the write, and `finish` (or `abort`)
//! resolves the batch's one-shot result so every waiter observes the same
//! outcome. Exactly one caller wins `claim_commit_rights` and drives the
//! protocol; everyone else just awaits the result.

use std::{
    collections::HashSet,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use errors::ErrorMetadata;
use futures::{
    future::{
        BoxFuture,
        Shared,
    },
    FutureExt,
};
use parking_lot::{
    MappedMutexGuard,
    Mutex,
    MutexGuard,
};
use tokio::sync::oneshot;
use value::{
    Document,
    FieldName,
    ObjectId,
    Value,
};

use crate::stats::ExecutionStatsController;

/// Identifies the operation a batch belongs to. Operation id `0` is the
/// shared batch combining inserts from different clients.
pub type OperationId = u32;

/// Index of the stripe that owns a bucket.
pub type StripeNumber = usize;

/// Stable reference to a bucket: its id plus the owning stripe, so a holder
/// can find the right lock without consulting the key index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BucketHandle {
    pub id: ObjectId,
    pub stripe: StripeNumber,
}

/// Caller-supplied information about the persisted write that committed a
/// batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub op_time: Option<u64>,
    pub election_id: Option<ObjectId>,
}

type CommitResult = Result<CommitInfo, ErrorMetadata>;
type SharedCommitResult = Shared<BoxFuture<'static, CommitResult>>;

#[derive(Default)]
pub(crate) struct WriteBatchInner {
    pub measurements: Vec<Document>,
    pub min: Document,
    pub max: Document,
    pub new_field_names: HashSet<FieldName>,
    pub num_previously_committed: u32,
}

pub struct WriteBatch {
    bucket: BucketHandle,
    op_id: OperationId,
    stats: ExecutionStatsController,
    commit_rights: AtomicBool,
    promise: Mutex<Option<oneshot::Sender<CommitResult>>>,
    result: SharedCommitResult,
    inner: Mutex<WriteBatchInner>,
}

impl WriteBatch {
    pub(crate) fn new(
        bucket: BucketHandle,
        op_id: OperationId,
        stats: ExecutionStatsController,
    ) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        let result = rx
            .map(|received: Result<CommitResult, oneshot::error::RecvError>| {
                received.unwrap_or_else(|_| {
                    Err(ErrorMetadata::internal(
                        "BatchAbandoned",
                        "write batch was dropped without being finished or aborted",
                    ))
                })
            })
            .boxed()
            .shared();
        Arc::new(Self {
            bucket,
            op_id,
            stats,
            commit_rights: AtomicBool::new(false),
            promise: Mutex::new(Some(tx)),
            result,
            inner: Mutex::new(WriteBatchInner::default()),
        })
    }

    pub fn bucket(&self) -> &BucketHandle {
        &self.bucket
    }

    pub(crate) fn op_id(&self) -> OperationId {
        self.op_id
    }

    pub(crate) fn stats(&self) -> &ExecutionStatsController {
        &self.stats
    }

    /// Attempt to claim the right to commit this batch. Returns true on the
    /// first call; only the winner may prepare, finish, or abort the batch.
    pub fn claim_commit_rights(&self) -> bool {
        !self.commit_rights.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn has_commit_rights(&self) -> bool {
        self.commit_rights.load(Ordering::SeqCst)
    }

    /// Whether the batch's result has been resolved, by finish or abort.
    pub fn finished(&self) -> bool {
        self.promise.lock().is_none()
    }

    /// Await the batch's outcome. Resolves exactly once per batch; any
    /// number of waiters may await it and all observe the same result.
    pub async fn get_result(&self) -> anyhow::Result<CommitInfo> {
        if !self.finished() {
            self.stats.inc_num_waits();
        }
        self.result.clone().await.map_err(Into::into)
    }

    pub fn measurements(&self) -> MappedMutexGuard<'_, Vec<Document>> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.measurements)
    }

    /// Minimum summary delta captured when this batch was prepared.
    pub fn min(&self) -> MappedMutexGuard<'_, Document> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.min)
    }

    /// Maximum summary delta captured when this batch was prepared.
    pub fn max(&self) -> MappedMutexGuard<'_, Document> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.max)
    }

    pub fn new_field_names_to_be_inserted(&self) -> MappedMutexGuard<'_, HashSet<FieldName>> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.new_field_names)
    }

    pub fn num_previously_committed_measurements(&self) -> u32 {
        self.inner.lock().num_previously_committed
    }

    /// Diagnostic summary of the batch.
    pub fn to_doc(&self) -> Document {
        let inner = self.inner.lock();
        let mut new_fields: Vec<_> = inner
            .new_field_names
            .iter()
            .map(|f| Value::from(f.as_str()))
            .collect();
        new_fields.sort_by(|a, b| value::cmp_values(a, b, None));
        let mut d = Document::new();
        d.append(
            "docs".parse().expect("static field name"),
            Value::Array(inner.measurements.iter().cloned().map(Value::Object).collect()),
        );
        d.append("bucketMin".parse().expect("static field name"), inner.min.clone());
        d.append("bucketMax".parse().expect("static field name"), inner.max.clone());
        d.append(
            "numCommittedMeasurements".parse().expect("static field name"),
            inner.num_previously_committed as i64,
        );
        d.append(
            "newFieldNamesToBeInserted".parse().expect("static field name"),
            Value::Array(new_fields),
        );
        d
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, WriteBatchInner> {
        self.inner.lock()
    }

    pub(crate) fn add_measurement(&self, doc: Document) {
        self.inner.lock().measurements.push(doc);
    }

    /// Resolve the batch successfully. The caller must hold commit rights
    /// and the batch must not already be finished.
    pub(crate) fn finish(&self, info: CommitInfo) {
        assert!(self.has_commit_rights());
        let tx = self
            .promise
            .lock()
            .take()
            .expect("batch finished more than once");
        let _ = tx.send(Ok(info));
    }

    /// Resolve the batch with an error. No-op if already finished.
    pub(crate) fn abort(&self, status: ErrorMetadata) {
        let Some(tx) = self.promise.lock().take() else {
            return;
        };
        let _ = tx.send(Err(status));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };
    use value::{
        doc,
        ObjectId,
        Value,
    };

    use super::{
        BucketHandle,
        CommitInfo,
        WriteBatch,
    };
    use crate::stats::{
        ExecutionStats,
        ExecutionStatsController,
    };

    fn test_batch() -> Arc<WriteBatch> {
        let stats = ExecutionStatsController::new(
            Arc::new(ExecutionStats::default()),
            Arc::new(ExecutionStats::default()),
        );
        WriteBatch::new(
            BucketHandle {
                id: ObjectId::generate(),
                stripe: 0,
            },
            0,
            stats,
        )
    }

    #[test]
    fn test_commit_rights_single_winner() {
        let batch = test_batch();
        assert!(batch.claim_commit_rights());
        assert!(!batch.claim_commit_rights());
    }

    #[tokio::test]
    async fn test_all_waiters_observe_one_result() {
        let batch = test_batch();
        assert!(batch.claim_commit_rights());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let batch = batch.clone();
                tokio::spawn(async move { batch.get_result().await })
            })
            .collect();

        batch.finish(CommitInfo::default());
        assert!(batch.finished());
        for waiter in waiters {
            let result = waiter.await.unwrap().unwrap();
            assert_eq!(result, CommitInfo::default());
        }
    }

    #[tokio::test]
    async fn test_abort_resolves_with_error() {
        let batch = test_batch();
        batch.abort(ErrorMetadata::bucket_cleared("bucket was cleared"));
        let err = batch.get_result().await.unwrap_err();
        assert!(err.is_bucket_cleared());
        // A second abort is a no-op rather than a panic.
        batch.abort(ErrorMetadata::bucket_cleared("again"));
    }

    #[test]
    fn test_to_doc_summary() {
        let batch = test_batch();
        batch.add_measurement(doc! { "t" => 1i64 });
        let summary = batch.to_doc();
        let Some(Value::Array(docs)) = summary.get("docs") else {
            panic!("docs should be an array");
        };
        assert_eq!(docs.len(), 1);
        assert_eq!(summary.get("numCommittedMeasurements"), Some(&Value::Int64(0)));
    }
}

//! Time-series collection options and the persisted bucket document shape.

use chrono::{
    DateTime,
    Utc,
};
use errors::ErrorMetadata;
use value::{
    date_from_millis,
    Document,
    FieldName,
    Value,
};

/// Top-level field holding the bucket id in a persisted bucket document.
pub const BUCKET_ID_FIELD_NAME: &str = "_id";
/// Top-level field holding the bucket's control block.
pub const BUCKET_CONTROL_FIELD_NAME: &str = "control";
/// Per-field minimums, under `control`.
pub const BUCKET_CONTROL_MIN_FIELD_NAME: &str = "min";
/// Per-field maximums, under `control`.
pub const BUCKET_CONTROL_MAX_FIELD_NAME: &str = "max";
/// Bucket format version, under `control`.
pub const BUCKET_CONTROL_VERSION_FIELD_NAME: &str = "version";
/// Top-level field holding the per-field measurement columns.
pub const BUCKET_DATA_FIELD_NAME: &str = "data";

/// `control.version` for buckets whose data columns are compressed.
pub const COMPRESSED_BUCKET_VERSION: i64 = 2;

/// The granularity of a time-series collection determines the boundary the
/// bucket id timestamp is rounded down to, and with it how measurements
/// group into predictable time windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Minutes,
    Hours,
    Days,
}

impl Granularity {
    fn rounding_seconds(&self) -> i64 {
        match self {
            Granularity::Minutes => 60,
            Granularity::Hours => 60 * 60,
            Granularity::Days => 24 * 60 * 60,
        }
    }

    /// Widest time span a single bucket may cover unless overridden.
    pub fn default_bucket_max_span_seconds(&self) -> u32 {
        match self {
            Granularity::Minutes => 60 * 60,
            Granularity::Hours => 24 * 60 * 60,
            Granularity::Days => 30 * 24 * 60 * 60,
        }
    }
}

/// Options of a time-series collection, as stored in its metadata.
#[derive(Clone, Debug)]
pub struct TimeseriesOptions {
    pub time_field: FieldName,
    pub meta_field: Option<FieldName>,
    pub granularity: Granularity,
    pub bucket_max_span_seconds: u32,
}

impl TimeseriesOptions {
    pub fn new(time_field: FieldName) -> Self {
        let granularity = Granularity::Minutes;
        Self {
            time_field,
            meta_field: None,
            granularity,
            bucket_max_span_seconds: granularity.default_bucket_max_span_seconds(),
        }
    }

    pub fn with_meta_field(mut self, meta_field: FieldName) -> Self {
        self.meta_field = Some(meta_field);
        self
    }

    /// Set the granularity, resetting the max span to its default.
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self.bucket_max_span_seconds = granularity.default_bucket_max_span_seconds();
        self
    }

    pub fn with_bucket_max_span_seconds(mut self, seconds: u32) -> Self {
        self.bucket_max_span_seconds = seconds;
        self
    }
}

/// Round a measurement timestamp down to the granularity boundary. Sub-second
/// precision is dropped along with the rounding.
pub fn round_timestamp_to_granularity(
    time: DateTime<Utc>,
    granularity: Granularity,
) -> DateTime<Utc> {
    let bucket = granularity.rounding_seconds();
    let rounded = time.timestamp().div_euclid(bucket) * bucket;
    date_from_millis(rounded * 1000)
}

/// Whether a persisted bucket document's data columns are compressed.
pub fn is_compressed_bucket(bucket_doc: &Document) -> bool {
    bucket_doc
        .get_object(BUCKET_CONTROL_FIELD_NAME)
        .and_then(|control| control.get(BUCKET_CONTROL_VERSION_FIELD_NAME))
        == Some(&Value::Int64(COMPRESSED_BUCKET_VERSION))
}

/// Number of elements in a compressed column payload.
///
/// The payload carries its element count in a little-endian u32 header ahead
/// of the packed column; only the count is needed here, decoding the column
/// itself is the persistence layer's business.
pub fn compressed_column_element_count(payload: &[u8]) -> anyhow::Result<u32> {
    let header: [u8; 4] = payload
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            ErrorMetadata::bad_value(
                "TruncatedColumn",
                "compressed column payload is shorter than its count header",
            )
        })?;
    Ok(u32::from_le_bytes(header))
}

#[cfg(test)]
mod tests {
    use value::{
        date_from_millis,
        doc,
    };

    use super::{
        compressed_column_element_count,
        is_compressed_bucket,
        round_timestamp_to_granularity,
        Granularity,
    };

    #[test]
    fn test_rounding_boundaries() {
        let t = date_from_millis(119_999); // 1m59.999s
        assert_eq!(
            round_timestamp_to_granularity(t, Granularity::Minutes),
            date_from_millis(60_000)
        );
        assert_eq!(
            round_timestamp_to_granularity(t, Granularity::Hours),
            date_from_millis(0)
        );
        let noon_and_change = date_from_millis(12 * 3600 * 1000 + 5_000);
        assert_eq!(
            round_timestamp_to_granularity(noon_and_change, Granularity::Days),
            date_from_millis(0)
        );
    }

    #[test]
    fn test_compressed_bucket_detection() {
        let compressed = doc! { "control" => doc! { "version" => 2i64 } };
        let plain = doc! { "control" => doc! { "version" => 1i64 } };
        assert!(is_compressed_bucket(&compressed));
        assert!(!is_compressed_bucket(&plain));
        assert!(!is_compressed_bucket(&doc! {}));
    }

    #[test]
    fn test_column_count_header() {
        let mut payload = 7u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"packed");
        assert_eq!(compressed_column_element_count(&payload).unwrap(), 7);
        assert!(compressed_column_element_count(&[1, 2]).is_err());
    }

    #[test]
    fn test_granularity_defaults() {
        assert_eq!(Granularity::Minutes.default_bucket_max_span_seconds(), 3600);
        assert_eq!(Granularity::Hours.default_bucket_max_span_seconds(), 86400);
    }
}

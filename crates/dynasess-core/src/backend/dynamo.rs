use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{KeyValueBackend, ScanCursor, ScanPage, WriteCondition};
use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::record::{SessionId, SessionRecord};

pub const ATTR_ID: &str = "id";
pub const ATTR_PAYLOAD: &str = "payload";
pub const ATTR_EXPIRES_AT: &str = "expiresAt";
pub const ATTR_VERSION: &str = "version";
pub const ATTR_LAST_MODIFIED: &str = "lastModified";

/// Service error codes worth another attempt.
const TRANSIENT_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionConflictException",
];

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-based sessions table.
pub struct DynamoBackend {
    client: Client,
    table_name: String,
}

impl DynamoBackend {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    /// Build a client for the configured region (and endpoint, if any) using
    /// the default AWS credential chain.
    pub async fn connect(cfg: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(cfg.table_region.clone()));
        if let Some(url) = &cfg.endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config), cfg.table_name.clone())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

#[async_trait]
impl KeyValueBackend for DynamoBackend {
    async fn get_item(
        &self,
        id: &SessionId,
        consistent: bool,
    ) -> Result<Option<SessionRecord>, StorageError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_ID, AttributeValue::S(id.to_string()))
            .consistent_read(consistent)
            .send()
            .await
            .map_err(classify)?;

        Ok(output.item.map(|item| parse_record(id, &item)))
    }

    async fn put_item(
        &self,
        record: &SessionRecord,
        condition: &WriteCondition,
    ) -> Result<(), StorageError> {
        let mut req = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_to_item(record)));

        req = match condition {
            WriteCondition::Unconditional => req,
            WriteCondition::IfAbsent => req
                .condition_expression("attribute_not_exists(#id)")
                .expression_attribute_names("#id", ATTR_ID),
            // Rows written before versioning existed carry no version attribute.
            WriteCondition::IfVersion(v) if v.as_str().is_empty() => req
                .condition_expression("attribute_exists(#id) AND attribute_not_exists(#v)")
                .expression_attribute_names("#id", ATTR_ID)
                .expression_attribute_names("#v", ATTR_VERSION),
            WriteCondition::IfVersion(v) => req
                .condition_expression("#v = :expected")
                .expression_attribute_names("#v", ATTR_VERSION)
                .expression_attribute_values(":expected", AttributeValue::S(v.to_string())),
        };

        req.send().await.map_err(classify)?;
        debug!("DynamoDB put_item ok: {}", record.id);
        Ok(())
    }

    async fn delete_item(&self, id: &SessionId) -> Result<(), StorageError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(ATTR_ID, AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_if_expired(
        &self,
        id: &SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(ATTR_ID, AttributeValue::S(id.to_string()))
            .condition_expression("#exp < :cutoff")
            .expression_attribute_names("#exp", ATTR_EXPIRES_AT)
            .expression_attribute_values(
                ":cutoff",
                AttributeValue::N(cutoff.timestamp().to_string()),
            )
            .send()
            .await;

        match result.map_err(classify) {
            Ok(_) => Ok(true),
            Err(StorageError::VersionConflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn scan_expired_page(
        &self,
        cutoff: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: u32,
    ) -> Result<ScanPage, StorageError> {
        let start_key = cursor.map(|c| {
            HashMap::from([(ATTR_ID.to_string(), AttributeValue::S(c.0.to_string()))])
        });

        let output = self
            .client
            .scan()
            .table_name(&self.table_name)
            .filter_expression("#exp < :cutoff")
            .projection_expression("#id")
            .expression_attribute_names("#exp", ATTR_EXPIRES_AT)
            .expression_attribute_names("#id", ATTR_ID)
            .expression_attribute_values(
                ":cutoff",
                AttributeValue::N(cutoff.timestamp().to_string()),
            )
            .limit(limit.clamp(1, i32::MAX as u32) as i32)
            .set_exclusive_start_key(start_key)
            .send()
            .await
            .map_err(classify)?;

        let mut ids = Vec::new();
        for item in output.items.unwrap_or_default() {
            let raw = item.get(ATTR_ID).and_then(|v| v.as_s().ok());
            match raw.map(|s| SessionId::parse(s)) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!("Skipping sessions row with unusable id: {:?}", raw),
            }
        }

        let next = output
            .last_evaluated_key
            .as_ref()
            .and_then(|key| key.get(ATTR_ID))
            .and_then(|v| v.as_s().ok())
            .and_then(|s| SessionId::parse(s).ok())
            .map(ScanCursor);

        Ok(ScanPage { ids, next })
    }
}

fn record_to_item(record: &SessionRecord) -> Item {
    HashMap::from([
        (ATTR_ID.to_string(), AttributeValue::S(record.id.to_string())),
        (
            ATTR_PAYLOAD.to_string(),
            AttributeValue::B(Blob::new(record.payload.clone())),
        ),
        (
            ATTR_EXPIRES_AT.to_string(),
            AttributeValue::N(expiry_secs(record.expires_at).to_string()),
        ),
        (ATTR_VERSION.to_string(), AttributeValue::S(record.version.to_string())),
        (
            ATTR_LAST_MODIFIED.to_string(),
            AttributeValue::N(record.last_modified.timestamp().to_string()),
        ),
    ])
}

/// Whole epoch seconds, rounded up so a stored session never expires early.
fn expiry_secs(at: DateTime<Utc>) -> i64 {
    at.timestamp() + i64::from(at.timestamp_subsec_nanos() > 0)
}

/// Parse a stored item leniently. Missing fields degrade rather than fail:
/// no payload decodes as corrupt, no expiry counts as expired, no version is
/// the empty token that `put_item` knows how to guard.
fn parse_record(id: &SessionId, item: &Item) -> SessionRecord {
    let payload = match item.get(ATTR_PAYLOAD) {
        Some(AttributeValue::B(blob)) => blob.as_ref().to_vec(),
        Some(AttributeValue::S(s)) => s.as_bytes().to_vec(),
        _ => Vec::new(),
    };

    SessionRecord {
        id: id.clone(),
        payload,
        expires_at: epoch_attr(item, ATTR_EXPIRES_AT).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        version: item
            .get(ATTR_VERSION)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .unwrap_or_default()
            .into(),
        last_modified: epoch_attr(item, ATTR_LAST_MODIFIED).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    }
}

fn epoch_attr(item: &Item, name: &str) -> Option<DateTime<Utc>> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn classify<E, R>(err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(message)
        }
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some("ConditionalCheckFailedException") => StorageError::VersionConflict,
            Some(code) if TRANSIENT_CODES.contains(&code) => StorageError::Transient(message),
            _ => StorageError::Permanent(message),
        },
        _ => StorageError::Permanent(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Version;

    fn sample() -> SessionRecord {
        SessionRecord {
            id: SessionId::parse("abc").unwrap(),
            payload: vec![0, 1, 2, 255],
            expires_at: DateTime::from_timestamp(1_900_000_000, 0).unwrap(),
            version: Version::generate(),
            last_modified: DateTime::from_timestamp(1_800_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_item_layout() {
        let item = record_to_item(&sample());
        assert_eq!(item.get(ATTR_ID).unwrap().as_s().unwrap(), "abc");
        assert_eq!(item.get(ATTR_EXPIRES_AT).unwrap().as_n().unwrap(), "1900000000");
        assert!(item.get(ATTR_PAYLOAD).unwrap().as_b().is_ok());
        assert!(item.get(ATTR_VERSION).unwrap().as_s().is_ok());
    }

    #[test]
    fn test_item_parse_back() {
        let record = sample();
        let parsed = parse_record(&record.id, &record_to_item(&record));
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_subsecond_expiry_rounds_up() {
        let mut record = sample();
        record.expires_at = DateTime::from_timestamp(1_900_000_000, 900_000_000).unwrap();
        let item = record_to_item(&record);
        assert_eq!(item.get(ATTR_EXPIRES_AT).unwrap().as_n().unwrap(), "1900000001");

        let parsed = parse_record(&record.id, &item);
        assert!(!parsed.is_expired(DateTime::from_timestamp(1_900_000_000, 950_000_000).unwrap()));
        assert!(parsed.is_expired(DateTime::from_timestamp(1_900_000_001, 0).unwrap()));

        record.expires_at = DateTime::from_timestamp(1_900_000_000, 0).unwrap();
        assert_eq!(expiry_secs(record.expires_at), 1_900_000_000);
    }

    #[test]
    fn test_legacy_item_degrades() {
        let id = SessionId::parse("legacy").unwrap();
        let item = HashMap::from([
            (ATTR_ID.to_string(), AttributeValue::S("legacy".to_string())),
            ("data".to_string(), AttributeValue::S("a|s:1:\"b\";".to_string())),
        ]);
        let parsed = parse_record(&id, &item);
        assert!(parsed.payload.is_empty());
        assert!(parsed.version.as_str().is_empty());
        assert!(parsed.is_expired(Utc::now()));
    }
}

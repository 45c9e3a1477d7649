//! Input format detection.
//!
//! When a job does not declare its input format, the engine sniffs the
//! first bytes: Parquet magic wins, then a first line that parses as a
//! JSON object means JSON-lines, and anything else is treated as CSV.

use pravah_core::{DataFormat, Result};

use crate::store::StoreClient;

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// Classify an object from its leading bytes.
pub fn detect_format(head: &[u8]) -> DataFormat {
    if head.len() >= PARQUET_MAGIC.len() && &head[..PARQUET_MAGIC.len()] == PARQUET_MAGIC {
        return DataFormat::Parquet;
    }
    let first_line = head
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    let trimmed = first_line
        .strip_suffix(b"\r")
        .unwrap_or(first_line);
    if trimmed.first() == Some(&b'{')
        && serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(trimmed).is_ok()
    {
        return DataFormat::Jsonl;
    }
    DataFormat::Csv
}

/// The declared format, or a detection pass over the object head.
pub async fn resolve_format(
    client: &StoreClient,
    key: &str,
    declared: Option<DataFormat>,
    detection_bytes: usize,
) -> Result<DataFormat> {
    if let Some(format) = declared {
        return Ok(format);
    }
    let head = client.get_range(key, 0, detection_bytes).await?;
    let format = detect_format(&head);
    tracing::info!(%key, ?format, "detected input format");
    Ok(format)
}

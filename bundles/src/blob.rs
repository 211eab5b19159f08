//! Decoding of the opaque per-row blobs: gzip-compressed camelCase JSON.

use crate::error::{DecodeBlobSnafu, DecompressBlobSnafu, Result};
use bundle_types::{DocumentData, ResultChunkData};
use flate2::read::GzDecoder;
use snafu::ResultExt;
use std::io::Read;

/// Decode a `documents.data` blob.
pub(crate) fn decode_document_data(data: &[u8]) -> Result<DocumentData> {
    serde_json::from_slice(&decompress(data)?).context(DecodeBlobSnafu)
}

/// Decode a `resultChunks.data` blob.
pub(crate) fn decode_result_chunk_data(data: &[u8]) -> Result<ResultChunkData> {
    serde_json::from_slice(&decompress(data)?).context(DecodeBlobSnafu)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut buf)
        .context(DecompressBlobSnafu)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::gzip_json;
    use bundle_types::Id;
    use serde_json::json;

    #[test]
    fn test_decode_document_data() {
        let blob = gzip_json(&json!({
            "ranges": {
                "1": {
                    "startLine": 0, "startCharacter": 3,
                    "endLine": 0, "endCharacter": 9,
                    "hoverResultId": "7"
                }
            },
            "hoverResults": {"7": "some docs"},
        }));

        let document = decode_document_data(&blob).unwrap();
        assert_eq!(document.ranges.len(), 1);
        assert_eq!(
            document.ranges[&Id::from("1")].hover_result_id,
            Some(Id::from("7"))
        );
        assert_eq!(document.hover_results[&Id::from("7")], "some docs");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // not gzip at all
        assert!(decode_document_data(b"not a blob").is_err());

        // gzip, but not the document shape
        let blob = gzip_json(&json!({"ranges": "not a map"}));
        assert!(decode_result_chunk_data(&blob).is_err());
    }
}

//! Chunk and metadata record encoding for the entity store.

use bincode::serde::{decode_from_slice, encode_to_vec};

use crate::constants::CHUNK_COMPRESS_THRESHOLD;
use crate::error::Result;
use crate::io::backend::{record_config, seal, unseal};
use crate::types::{BulkItem, ChunkEncoding, EntityMetadata};

/// Encode a chunk's items into a sealed on-disk record. Larger chunks get
/// zstd; tiny tails stay plain to avoid paying compression for nothing.
pub fn encode_chunk(items: &[BulkItem]) -> Result<Vec<u8>> {
    let raw = encode_to_vec(items, record_config())?;
    let encoding = if raw.len() >= CHUNK_COMPRESS_THRESHOLD {
        ChunkEncoding::Zstd
    } else {
        ChunkEncoding::Plain
    };
    seal(&raw, encoding)
}

pub fn decode_chunk(bytes: &[u8]) -> Result<Vec<BulkItem>> {
    let raw = unseal(bytes)?;
    let (items, _) = decode_from_slice(&raw, record_config())?;
    Ok(items)
}

pub fn encode_metadata(metadata: &EntityMetadata) -> Result<Vec<u8>> {
    let raw = encode_to_vec(metadata, record_config())?;
    seal(&raw, ChunkEncoding::Plain)
}

pub fn decode_metadata(bytes: &[u8]) -> Result<EntityMetadata> {
    let raw = unseal(bytes)?;
    let (metadata, _) = decode_from_slice(&raw, record_config())?;
    Ok(metadata)
}

/// Split a full field's items into capacity-sized chunks; every chunk except
/// the last is exactly `capacity` items.
pub fn plan_chunks(items: &[BulkItem], capacity: u32) -> Vec<&[BulkItem]> {
    if items.is_empty() {
        return Vec::new();
    }
    items.chunks(capacity.max(1) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(id: &str) -> BulkItem {
        BulkItem::new(id, Utc::now()).with_payload(serde_json::json!({ "idx": id }))
    }

    #[test]
    fn chunk_roundtrip_small_and_large() {
        let small = vec![item("a")];
        let large: Vec<BulkItem> = (0..200).map(|i| item(&format!("shot-{i}"))).collect();

        for items in [small, large] {
            let encoded = encode_chunk(&items).expect("encode");
            let decoded = decode_chunk(&encoded).expect("decode");
            assert_eq!(decoded, items);
        }
    }

    #[test]
    fn metadata_roundtrip() {
        let mut meta = EntityMetadata::new("roundtrip");
        meta.tags = vec!["focus".into()];
        meta.sequence = 7;
        let encoded = encode_metadata(&meta).expect("encode");
        assert_eq!(decode_metadata(&encoded).expect("decode"), meta);
    }

    #[test]
    fn plan_chunks_only_last_under_capacity() {
        let items: Vec<BulkItem> = (0..47).map(|i| item(&i.to_string())).collect();
        let chunks = plan_chunks(&items, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 20);
        assert_eq!(chunks[1].len(), 20);
        assert_eq!(chunks[2].len(), 7);
        assert!(plan_chunks(&[], 20).is_empty());
    }
}

use crate::hash::{pedersen, PedersenHash};

/// Returns `value - i64::MIN` as big-endian bytes, mapping the signed range
/// onto `0..2^64` while preserving order.
pub(crate) fn bias_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

/// Right-aligns `parts` (concatenated in order) inside a 32-byte field
/// element.
pub(crate) fn pack_bytes(parts: &[&[u8]]) -> PedersenHash {
    let mut bytes = [0; 32];
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut offset = 32 - total;
    for part in parts {
        bytes[offset..offset + part.len()].copy_from_slice(part);
        offset += part.len();
    }
    PedersenHash(bytes)
}

/// Returns `H(...H(H(0, items[0]), items[1])..., items[n-1])`.
pub(crate) fn hash_chain<'a>(items: impl IntoIterator<Item = &'a PedersenHash>) -> PedersenHash {
    items
        .into_iter()
        .fold(PedersenHash::ZERO, |acc, item| pedersen(&acc, item))
}

pub mod block;
pub mod transaction;

/// Decode a hex hash field into raw bytes. The genesis literal `"0"` (and
/// anything unparseable, which validation rejects elsewhere) maps to zeroes.
pub fn decode_hash(s: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    if let Ok(bytes) = hex::decode(s)
        && bytes.len() == 32
    {
        out.copy_from_slice(&bytes);
    }
    out
}

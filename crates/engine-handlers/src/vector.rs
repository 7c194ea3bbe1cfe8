//! Converts a provider embedding response into the storage blob form
//! (spec.md S4.7 "Embedding handler" step 4): little-endian `f32`s
//! packed back to back, the simplest fixed-width encoding a warehouse
//! reader can slice back apart without a schema registry.

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let values = vec![0.0_f32, -1.5, 3.25, f32::MIN, f32::MAX];
        let bytes = encode_vector(&values);
        assert_eq!(bytes.len(), values.len() * 4);
        assert_eq!(decode_vector(&bytes), values);
    }
}

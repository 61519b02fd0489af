//! Binary encoding/decoding utilities for indexed triples

use crate::core::IndexedTriple;

/// Size of a single encoded record in bytes
pub const RECORD_SIZE: usize = 24;

/// Encode an indexed triple into a byte buffer
pub fn encode_record(buffer: &mut [u8; RECORD_SIZE], subject: u64, relation: u64, object: u64) {
    buffer[0..8].copy_from_slice(&subject.to_le_bytes());
    buffer[8..16].copy_from_slice(&relation.to_le_bytes());
    buffer[16..24].copy_from_slice(&object.to_le_bytes());
}

/// Decode a byte buffer into an indexed triple record
pub fn decode_record(buffer: &[u8; RECORD_SIZE]) -> (u64, u64, u64) {
    let mut word = [0u8; 8];
    let mut read = |range: std::ops::Range<usize>| {
        word.copy_from_slice(&buffer[range]);
        u64::from_le_bytes(word)
    };
    let subject = read(0..8);
    let relation = read(8..16);
    let object = read(16..24);
    (subject, relation, object)
}

impl IndexedTriple {
    pub fn new(subject: u64, relation: u64, object: u64) -> Self {
        Self { subject, relation, object }
    }

    /// Encode this triple to bytes
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buffer = [0u8; RECORD_SIZE];
        encode_record(&mut buffer, self.subject, self.relation, self.object);
        buffer
    }

    pub fn from_bytes(buffer: &[u8; RECORD_SIZE]) -> Self {
        let (subject, relation, object) = decode_record(buffer);
        Self { subject, relation, object }
    }

    pub fn as_array(&self) -> [u64; 3] {
        [self.subject, self.relation, self.object]
    }
}

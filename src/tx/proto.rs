//! Minimal protobuf writer for the handful of Cosmos SDK messages we sign.
//!
//! Fields are emitted in the order they are written, which must be ascending
//! field number for the output to match the canonical encoding the chain
//! verifies signatures against. Default values (zero, empty) are skipped.

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

#[derive(Debug, Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uint64(mut self, field: u32, value: u64) -> Self {
        if value != 0 {
            self.key(field, WIRE_VARINT);
            put_varint(&mut self.buf, value);
        }
        self
    }

    pub fn bytes(mut self, field: u32, value: &[u8]) -> Self {
        if !value.is_empty() {
            self.len_delimited(field, value);
        }
        self
    }

    pub fn string(self, field: u32, value: &str) -> Self {
        self.bytes(field, value.as_bytes())
    }

    /// Embedded message. Written even when empty, as presence matters for
    /// message fields.
    pub fn message(mut self, field: u32, value: &[u8]) -> Self {
        self.len_delimited(field, value);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        put_varint(&mut self.buf, (u64::from(field) << 3) | u64::from(wire_type));
    }

    fn len_delimited(&mut self, field: u32, value: &[u8]) {
        self.key(field, WIRE_LEN);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
    }
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);

        let mut buf = Vec::new();
        put_varint(&mut buf, 1);
        assert_eq!(buf, vec![0x01]);
    }

    #[test]
    fn test_fields_and_defaults() {
        let encoded = ProtoWriter::new()
            .string(1, "ab")
            .uint64(2, 0)
            .uint64(3, 150)
            .bytes(4, &[])
            .message(5, &[])
            .finish();
        // field 1 len 2 "ab", field 2 skipped, field 3 varint 150, field 4 skipped, field 5 empty message
        assert_eq!(encoded, vec![0x0a, 0x02, b'a', b'b', 0x18, 0x96, 0x01, 0x2a, 0x00]);
    }
}

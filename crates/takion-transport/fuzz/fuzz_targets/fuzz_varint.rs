#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use takion_transport::wire::{FieldReader, VarInt};

// Varints must survive a re-encode; the field reader must never panic on
// arbitrary input, whatever accessor is used on a field.
fuzz_target!(|data: &[u8]| {
    if let Ok(vi) = VarInt::decode(&mut &data[..]) {
        let mut buf = BytesMut::new();
        vi.encode(&mut buf);
        assert_eq!(buf.len(), vi.encoded_len());
        assert_eq!(VarInt::decode(&mut &buf[..]).map(VarInt::value), Ok(vi.value()));
    }

    let mut reader = FieldReader::new(Bytes::copy_from_slice(data));
    while let Ok(Some((field, value))) = reader.next_field() {
        let _ = value.as_u32(field);
        let _ = value.as_f64(field);
        let _ = value.into_string(field);
    }
});

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use takion_transport::packet::{auth_view, Datagram};

/// Fuzz datagram framing: control chunks, congestion reports, AV headers.
///
/// None of the decoders may panic; the auth view must keep the length.
fuzz_target!(|data: &[u8]| {
    let _ = Datagram::decode(Bytes::copy_from_slice(data));
    if let Ok(view) = auth_view(data) {
        assert_eq!(view.len(), data.len());
    }
});

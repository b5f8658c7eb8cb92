#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use takion_transport::message::TakionMessage;

/// Fuzz the control message decoder.
///
/// Arbitrary bytes must decode or fail cleanly, and anything that decodes
/// must survive a re-encode unchanged.
fuzz_target!(|data: &[u8]| {
    if let Ok(message) = TakionMessage::decode(Bytes::copy_from_slice(data)) {
        let again = TakionMessage::decode(message.encode()).expect("re-decode must succeed");
        // NaN floats in CONNECTIONQUALITY never compare equal.
        if !matches!(message, TakionMessage::ConnectionQuality(_)) {
            assert_eq!(again, message);
        }
    }
});

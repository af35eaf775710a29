#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use zbc_core::protocol::{MessageCodec, MessageWriter};

fuzz_target!(|data: &[u8]| {
    let mut codec = MessageCodec::with_max_frame_length(64 * 1024);
    let mut buf = BytesMut::from(data);

    while let Ok(Some(item)) = codec.decode(&mut buf) {
        if let Ok(message) = item {
            let _ = message.request_id();
            let _ = message.subscriber_key();
            // Anything we can decode we must be able to write back.
            let written = MessageWriter::new().write_message(&message);
            assert!(written.is_ok());
        }
    }
});

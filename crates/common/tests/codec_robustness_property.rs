use proptest::prelude::*;
use wikisync_common::protocol::{decode_envelope, encode_frame, Heartbeat, Message, SyncMessage};
use wikisync_common::{ProtocolError, SessionId};
use yrs::encoding::write::Write;

// State vectors and presence updates decode into maps, so only empty or
// single-entry payloads keep their exact bytes.
fn state_vector_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::option::of((any::<u32>(), any::<u32>())).prop_map(|entry| {
        let mut buf = Vec::new();
        match entry {
            None => buf.write_var(0u32),
            Some((client, clock)) => {
                buf.write_var(1u32);
                buf.write_var(client);
                buf.write_var(clock);
            }
        }
        buf
    })
}

fn presence_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::option::of((any::<u32>(), any::<u32>(), "[a-z{}\":]{0,16}")).prop_map(|entry| {
        let mut buf = Vec::new();
        match entry {
            None => buf.write_var(0u32),
            Some((client, clock, json)) => {
                buf.write_var(1u32);
                buf.write_var(client);
                buf.write_var(clock);
                buf.write_string(&json);
            }
        }
        buf
    })
}

fn message_strategy() -> impl Strategy<Value = Message> {
    let bytes = proptest::collection::vec(any::<u8>(), 0..64);
    prop_oneof![
        state_vector_strategy().prop_map(|data| Message::Sync(SyncMessage::Step1(data))),
        bytes.clone().prop_map(|data| Message::Sync(SyncMessage::Step2(data))),
        bytes.prop_map(|data| Message::Sync(SyncMessage::Update(data))),
        presence_strategy().prop_map(Message::Awareness),
        proptest::option::of(".{0,24}").prop_map(Message::Auth),
        Just(Message::QueryAwareness),
        any::<i64>().prop_map(Message::handshake),
        Just(Message::Heartbeat(Heartbeat::Ping)),
        Just(Message::Heartbeat(Heartbeat::Pong)),
    ]
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(envelope) = decode_envelope(&bytes) {
            let _ = envelope.message();
        }
        let _ = Message::decode(&bytes);
    }

    #[test]
    fn truncated_frames_fail_cleanly(
        message in message_strategy(),
        doc_name in proptest::option::of("[a-z/]{1,16}"),
        cut in any::<prop::sample::Index>(),
    ) {
        let session = SessionId::new();
        let frame = encode_frame(session, doc_name.as_deref(), &message);
        let envelope = decode_envelope(&frame).expect("full frame decodes");
        prop_assert_eq!(envelope.message(), Ok(message.clone()));

        let truncated = &frame[..cut.index(frame.len())];
        match decode_envelope(truncated) {
            Err(ProtocolError::MalformedFrame(_)) => {}
            Err(other) => prop_assert!(false, "unexpected error kind: {other}"),
            Ok(envelope) => {
                // Cuts inside the payload still leave a readable envelope.
                let _ = envelope.message();
            }
        }
    }
}

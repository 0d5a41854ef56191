//! Property-based tests for the crmsync wire format.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never causes a panic in frame decoding.
//! 2. Task chat destinations parse back to the task id they were built from.
//! 3. Frame bodies carry any string payload unchanged.
//! 4. Unrecognised notification types decode as `Unknown`, never as errors.

use proptest::prelude::*;
use crmsync_proto::frame::{self, ClientFrame, ServerFrame};
use crmsync_proto::notification::{Notification, NotificationType};
use crmsync_proto::topic::{SubscriptionId, Topic};
use uuid::Uuid;

// --- Strategies ---

fn arb_subscription_id() -> impl Strategy<Value = SubscriptionId> {
    any::<u128>().prop_map(|n| SubscriptionId::from_uuid(Uuid::from_u128(n)))
}

fn arb_server_frame() -> impl Strategy<Value = ServerFrame> {
    prop_oneof![
        ".{0,32}".prop_map(|username| ServerFrame::Connected { username }),
        (arb_subscription_id(), ".{0,64}", ".{0,256}").prop_map(
            |(subscription, destination, body)| ServerFrame::Message {
                subscription,
                destination,
                body,
            }
        ),
        ".{0,64}".prop_map(|message| ServerFrame::Error { message }),
    ]
}

// --- Property tests ---

proptest! {
    /// Arbitrary text never panics when decoded as either frame direction.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = frame::decode_server(&text);
        let _ = frame::decode_client(&text);
    }

    /// Every task chat destination parses back to its task id.
    #[test]
    fn task_chat_destination_parses_back(task_id in any::<i64>()) {
        let destination = Topic::TaskChat(task_id).destination();
        prop_assert_eq!(Topic::task_chat_id(&destination), Some(task_id));
    }

    /// Server frames survive the JSON codec whatever their string contents.
    #[test]
    fn server_frame_survives_codec(frame in arb_server_frame()) {
        let text = frame::encode_server(&frame).expect("encode should succeed");
        let decoded = frame::decode_server(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// A SEND frame body is carried byte-for-byte.
    #[test]
    fn send_body_is_opaque(body in ".{0,512}") {
        let sent = ClientFrame::Send { destination: "/topic/tasks/1/chat".to_string(), body };
        let text = frame::encode_client(&sent).expect("encode should succeed");
        prop_assert_eq!(frame::decode_client(&text).expect("decode should succeed"), sent);
    }

    /// Any type name outside the known set decodes as `Unknown`.
    #[test]
    fn unrecognised_type_is_unknown(kind in "[A-Z_]{1,24}") {
        prop_assume!(!matches!(
            kind.as_str(),
            "TASK_STATUS_CHANGED" | "TASK_NEW_COMMENT" | "TASK_DUE_DATE" | "UNKNOWN"
        ));
        let json = serde_json::json!({ "id": 1, "type": kind }).to_string();
        let decoded: Notification = serde_json::from_str(&json).expect("decode should succeed");
        prop_assert_eq!(decoded.kind, NotificationType::Unknown);
    }
}

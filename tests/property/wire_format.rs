//! Property-based tests for the signaling wire format.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never makes `decode` panic (it returns `Err` gracefully).
//! 2. Requests carrying arbitrary user text survive encode → decode.
//! 3. Negotiation payloads survive the trip through an opaque JSON value.
//! 4. Keyword normalization is idempotent and never yields a blank keyword.

use proptest::prelude::*;
use strangers_proto::codec;
use strangers_proto::negotiation::{IceCandidate, NegotiationPayload, SdpType, SessionDescription};
use strangers_proto::signal::{SignalingEvent, SignalingRequest, normalize_keyword};

// --- Strategies ---

fn arb_identity() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,36}"
}

fn arb_description() -> impl Strategy<Value = SessionDescription> {
    (
        prop_oneof![
            Just(SdpType::Offer),
            Just(SdpType::Answer),
            Just(SdpType::Pranswer),
        ],
        ".{0,256}",
    )
        .prop_map(|(kind, sdp)| SessionDescription { kind, sdp })
}

fn arb_candidate() -> impl Strategy<Value = IceCandidate> {
    (
        ".{0,128}",
        proptest::option::of("[0-9a-z]{1,4}"),
        proptest::option::of(any::<u16>()),
        proptest::option::of("[a-zA-Z0-9]{4,16}"),
    )
        .prop_map(
            |(candidate, sdp_mid, sdp_m_line_index, username_fragment)| IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
                username_fragment,
            },
        )
}

fn arb_payload() -> impl Strategy<Value = NegotiationPayload> {
    prop_oneof![
        arb_description().prop_map(NegotiationPayload::Description),
        arb_candidate().prop_map(|candidate| NegotiationPayload::Candidate { candidate }),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics_on_arbitrary_text(text in ".{0,512}") {
        let _ = codec::decode::<SignalingEvent>(&text);
        let _ = codec::decode::<SignalingRequest>(&text);
    }

    #[test]
    fn chat_text_survives_the_wire(to in arb_identity(), text in ".{0,512}") {
        let request = SignalingRequest::SendMessage { to, text };
        let encoded = codec::encode(&request).unwrap();
        let decoded: SignalingRequest = codec::decode(&encoded).unwrap();
        prop_assert_eq!(decoded, request);
    }

    #[test]
    fn negotiation_payload_survives_opaque_value(payload in arb_payload(), from in arb_identity()) {
        let event = SignalingEvent::WebrtcSignal { from, data: payload.to_value().unwrap() };
        let encoded = codec::encode(&event).unwrap();
        let decoded: SignalingEvent = codec::decode(&encoded).unwrap();
        match decoded {
            SignalingEvent::WebrtcSignal { data, .. } => {
                prop_assert_eq!(NegotiationPayload::from_value(data).unwrap(), payload);
            }
            other => prop_assert!(false, "expected WebrtcSignal, got {:?}", other),
        }
    }

    #[test]
    fn keyword_normalization_is_idempotent(raw in ".{0,64}") {
        let once = normalize_keyword(&raw);
        prop_assert!(!once.trim().is_empty());
        prop_assert_eq!(normalize_keyword(&once), once);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! The wire format spoken between the Pi sender, the signalling relay
//! and the viewer.

use serde::{Deserialize, Serialize};

/// A signalling message as it appears on the WebSocket.
///
/// The payload of [`Offer`](Envelope::Offer) and
/// [`Answer`](Envelope::Answer) is the raw SDP text. The payload of
/// [`Ice`](Envelope::Ice) is a JSON-encoded [`IceCandidate`], nested as
/// a string: browser peers produce `JSON.stringify(candidate.toJSON())`
/// there and expect the same back.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "camelCase")]
pub enum Envelope {
    /// Conveys an SDP offer
    Offer(String),
    /// Conveys an SDP answer
    Answer(String),
    /// Conveys an ICE candidate, JSON-encoded as a string
    Ice(String),
}

/// The document carried inside [`Envelope::Ice`].
///
/// Browsers attach further members (`sdpMid`, `usernameFragment`, ...)
/// when serializing an `RTCIceCandidate`; those are ignored here.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate string
    pub candidate: String,
    /// The mline index the candidate applies to
    pub sdp_m_line_index: u32,
}

impl Envelope {
    /// Wrap a locally gathered candidate for sending.
    pub fn from_candidate(candidate: &IceCandidate) -> Result<Self, serde_json::Error> {
        Ok(Envelope::Ice(serde_json::to_string(candidate)?))
    }

    /// Decode the nested candidate of an `ice` envelope.
    ///
    /// Returns `None` for the SDP-carrying message types.
    pub fn candidate(&self) -> Option<Result<IceCandidate, serde_json::Error>> {
        match self {
            Envelope::Ice(payload) => Some(serde_json::from_str(payload)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_layout() {
        let msg = Envelope::Offer("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n".to_string());
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "offer", "data": "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n"})
        );
    }

    #[test]
    fn answer_layout() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"type": "answer", "data": "v=0\r\n"}"#).unwrap();
        assert_eq!(parsed, Envelope::Answer("v=0\r\n".to_string()));
    }

    #[test]
    fn ice_is_nested_as_a_string() {
        let msg = Envelope::from_candidate(&IceCandidate {
            candidate: "candidate:1 1 UDP 2015363327 192.168.4.2 44323 typ host".to_string(),
            sdp_m_line_index: 0,
        })
        .unwrap();

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice");

        // data must be a string, not an object
        let payload = value["data"].as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(payload).unwrap(),
            json!({
                "candidate": "candidate:1 1 UDP 2015363327 192.168.4.2 44323 typ host",
                "sdpMLineIndex": 0
            })
        );
    }

    #[test]
    fn ice_from_a_browser_peer() {
        // RTCIceCandidate.toJSON() carries members we don't use
        let payload = json!({
            "candidate": "candidate:2 1 UDP 1679819007 10.0.0.5 50000 typ srflx",
            "sdpMLineIndex": 0,
            "sdpMid": "video0",
            "usernameFragment": "abcd"
        })
        .to_string();

        let msg: Envelope =
            serde_json::from_value(json!({"type": "ice", "data": payload})).unwrap();
        let candidate = msg.candidate().unwrap().unwrap();
        assert_eq!(candidate.sdp_m_line_index, 0);
        assert!(candidate.candidate.starts_with("candidate:2"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Envelope>(r#"{"type": "bye", "data": ""}"#).is_err());
    }

    #[test]
    fn sdp_messages_carry_no_candidate() {
        assert!(Envelope::Offer("v=0\r\n".to_string()).candidate().is_none());
    }

    #[test]
    fn malformed_ice_payload_is_an_error() {
        let msg = Envelope::Ice("{not json".to_string());
        assert!(msg.candidate().unwrap().is_err());
    }
}

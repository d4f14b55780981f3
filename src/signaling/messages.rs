// JSON frames exchanged with the invite broker
// Every frame is an object with a `type` discriminator

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Frames the broker sends to the host.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerFrame {
    #[serde(rename = "createInvite", rename_all = "camelCase")]
    CreateInvite {
        invite_code: String,
        #[serde(default)]
        timeout_milliseconds: u64,
        #[serde(default)]
        censored_nickname: String,
    },

    #[serde(rename = "joinInvite")]
    JoinInvite(JoinInvite),

    #[serde(rename = "iceCandidate")]
    IceCandidate {
        session: String,
        candidate: RTCIceCandidateInit,
    },
}

/// A client asking to join through our invite code.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInvite {
    pub session: String,
    pub offer: String,
    pub nickname: String,
    #[serde(default)]
    pub mods: Vec<String>,
    #[serde(default)]
    pub is_mods_vanilla_compatible: bool,
    #[serde(default)]
    pub country_code: Option<String>,
    /// Base64 car style blob; empty means defaults.
    #[serde(default)]
    pub car_style: String,
}

/// Frames the host sends to the broker.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum HostFrame {
    #[serde(rename = "createInvite")]
    CreateInvite { version: String },

    #[serde(rename = "acceptJoin", rename_all = "camelCase")]
    AcceptJoin {
        version: String,
        session: String,
        is_mods_vanilla_compatible: bool,
        mods: Vec<String>,
        client_id: u32,
        answer: String,
    },

    #[serde(rename = "iceCandidate")]
    IceCandidate {
        version: String,
        session: String,
        candidate: RTCIceCandidateInit,
    },
}

/// One entry of the ICE server list fetched at startup.
#[derive(Debug, Deserialize)]
pub struct IceServerEntry {
    pub urls: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_invite() {
        let text = r#"{
            "type": "joinInvite",
            "session": "abc123",
            "offer": "v=0...",
            "nickname": "speedy",
            "mods": [],
            "isModsVanillaCompatible": true,
            "countryCode": "SE",
            "carStyle": "AAAA"
        }"#;

        let frame: BrokerFrame = serde_json::from_str(text).unwrap();
        match frame {
            BrokerFrame::JoinInvite(join) => {
                assert_eq!(join.session, "abc123");
                assert_eq!(join.nickname, "speedy");
                assert_eq!(join.country_code.as_deref(), Some("SE"));
                assert!(join.is_mods_vanilla_compatible);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn join_invite_optionals_default() {
        let text = r#"{
            "type": "joinInvite",
            "session": "s",
            "offer": "o",
            "nickname": "n"
        }"#;
        let frame: BrokerFrame = serde_json::from_str(text).unwrap();
        match frame {
            BrokerFrame::JoinInvite(join) => {
                assert!(join.mods.is_empty());
                assert_eq!(join.country_code, None);
                assert_eq!(join.car_style, "");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_create_invite_reply() {
        let text = r#"{
            "type": "createInvite",
            "inviteCode": "XYZ42",
            "timeoutMilliseconds": 60000,
            "censoredNickname": "host"
        }"#;
        let frame: BrokerFrame = serde_json::from_str(text).unwrap();
        match frame {
            BrokerFrame::CreateInvite {
                invite_code,
                timeout_milliseconds,
                ..
            } => {
                assert_eq!(invite_code, "XYZ42");
                assert_eq!(timeout_milliseconds, 60000);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn accept_join_uses_camel_case_tags() {
        let frame = HostFrame::AcceptJoin {
            version: "0.6.0-beta1".to_string(),
            session: "s1".to_string(),
            is_mods_vanilla_compatible: true,
            mods: vec![],
            client_id: 3,
            answer: "v=0".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "acceptJoin");
        assert_eq!(json["clientId"], 3);
        assert_eq!(json["isModsVanillaCompatible"], true);
    }
}

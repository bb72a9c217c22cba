// JSON message type definitions
// Defines client ↔ server message protocol

use serde::{Deserialize, Serialize};

/// Initial handshake as sent by clients (flat JSON, no "type" field).
#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    pub user: String,
    /// Maidenhead locator from the user's profile
    #[serde(default)]
    pub grid: Option<String>,
    /// Preferred band in metres
    #[serde(default)]
    pub preferred_band: Option<u32>,
    #[serde(default)]
    pub client_version: Option<String>,
}

/// Messages sent from client to server after the handshake
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Set or change the user's grid locator. Empty clears it.
    SetGrid { grid: String },

    /// Move to a band channel (metres)
    SetBand { band: u32 },

    /// How loud `speaker` should be for this user (0..=10)
    SetVolume { speaker: u32, factor: f32 },

    /// One frame of PCM samples in [-1, 1]
    Voice {
        #[serde(default)]
        seq: u64,
        samples: Vec<f32>,
    },

    /// Keep-alive heartbeat
    Heartbeat {},
}

/// Messages sent from server to client
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake response
    Handshake {
        motd: String,
        session: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        reconnect_in: Option<u32>,
        heartbeat: bool,
    },

    /// Server or propagation notice
    Text { message: String },

    /// A speaker became audible or blocked for this listener
    Routing {
        speaker: u32,
        quality: f64,
        blocked: bool,
    },

    /// Degraded voice frame from another user
    Voice {
        speaker: u32,
        seq: u64,
        samples: Vec<f32>,
    },

    /// Heartbeat message
    Heartbeat { server_time: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_handshake_flat() {
        let json = r#"{
            "user": "w1aw",
            "grid": "FN31pr",
            "preferred_band": 20
        }"#;

        let req: HandshakeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.user, "w1aw");
        assert_eq!(req.grid.as_deref(), Some("FN31pr"));
        assert_eq!(req.preferred_band, Some(20));
        assert!(req.client_version.is_none());
    }

    #[test]
    fn test_deserialize_handshake_minimal() {
        let req: HandshakeRequest = serde_json::from_str(r#"{"user": "g4abc"}"#).unwrap();
        assert!(req.grid.is_none());
        assert!(req.preferred_band.is_none());
    }

    #[test]
    fn test_deserialize_client_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "set_grid", "grid": "JO62qm"}"#).unwrap();
        match msg {
            ClientMessage::SetGrid { grid } => assert_eq!(grid, "JO62qm"),
            _ => panic!("Expected SetGrid"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "voice", "seq": 7, "samples": [0.5, -0.25]}"#).unwrap();
        match msg {
            ClientMessage::Voice { seq, samples } => {
                assert_eq!(seq, 7);
                assert_eq!(samples, vec![0.5, -0.25]);
            }
            _ => panic!("Expected Voice"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "heartbeat"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Heartbeat {}));

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "set_volume", "speaker": 3, "factor": 2.5}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SetVolume { speaker: 3, .. }));
    }

    #[test]
    fn test_serialize_handshake_response() {
        let msg = ServerMessage::Handshake {
            motd: "73!".to_string(),
            session: 4,
            reconnect_in: None,
            heartbeat: true,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"motd\":\"73!\""));
        assert!(json.contains("\"session\":4"));
        assert!(!json.contains("reconnect_in"));
    }

    #[test]
    fn test_serialize_routing() {
        let msg = ServerMessage::Routing {
            speaker: 2,
            quality: 0.25,
            blocked: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"routing\""));
        assert!(json.contains("\"blocked\":false"));
    }
}

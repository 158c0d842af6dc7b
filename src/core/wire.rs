//! The client's view of the relay's JSON bodies.
//!
//! `body` is always lowercase hex; `phase` is free text. The relay wraps
//! every response in a `welcome` object, which may carry a fatal `error`.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_derive::{Deserialize, Serialize};

use super::WormholeError;

/// Server-supplied metadata included in every response and pushed as the
/// first event on a stream.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct Welcome {
    pub current_version: Option<String>,
    pub motd: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct OutboundMessage<'a> {
    pub side: &'a str,
    pub phase: &'a str,
    pub body: String,
}

#[derive(Deserialize, Debug)]
pub struct MessageEntry {
    pub phase: String,
    pub body: String,
}

#[derive(Deserialize, Debug)]
pub struct ChannelResponse {
    #[serde(default)]
    pub welcome: Welcome,
    pub messages: Vec<MessageEntry>,
}

#[derive(Deserialize, Debug)]
pub struct AllocatedResponse {
    #[serde(default)]
    pub welcome: Welcome,
    #[serde(rename = "channel-id")]
    pub channel_id: u32,
}

#[derive(Serialize, Debug)]
pub struct SideOnly<'a> {
    pub side: &'a str,
}

/// Funnel for every welcome the relay hands us: shows the MOTD once, warns
/// once on a version mismatch, and turns a server `error` into a fatal
/// [`WormholeError::Server`].
pub struct WelcomeGate {
    relay: String,
    motd_shown: AtomicBool,
    version_warned: AtomicBool,
}

impl WelcomeGate {
    pub fn new(relay: String) -> Arc<Self> {
        Arc::new(WelcomeGate {
            relay,
            motd_shown: AtomicBool::new(false),
            version_warned: AtomicBool::new(false),
        })
    }

    pub fn observe(&self, welcome: &Welcome) -> Result<(), WormholeError> {
        if let Some(motd) = &welcome.motd {
            if !self.motd_shown.swap(true, Ordering::Relaxed) {
                tracing::info!("server at {} says: {}", self.relay, motd);
            }
        }
        if let Some(current) = &welcome.current_version {
            if current != env!("CARGO_PKG_VERSION")
                && !self.version_warned.swap(true, Ordering::Relaxed)
            {
                tracing::warn!(
                    "server claims {} is current, but ours is {}; \
                     errors may occur unless both sides run the same version",
                    current,
                    env!("CARGO_PKG_VERSION"),
                );
            }
        }
        if let Some(error) = &welcome.error {
            bail!(WormholeError::Server {
                message: error.clone(),
                relay: self.relay.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use serde_json::{Value, from_str, json};

    use super::*;

    #[test]
    fn test_outbound_message() {
        let m = OutboundMessage {
            side: "side1",
            phase: "pake",
            body: hex::encode(b"body"),
        };
        let s = serde_json::to_string(&m).unwrap();
        let v: Value = from_str(&s).unwrap();
        assert_eq!(
            v,
            json!({"side": "side1", "phase": "pake", "body": "626f6479"})
        );
    }

    #[test]
    fn test_allocated_response() {
        let r: AllocatedResponse =
            from_str(r#"{"welcome": {"motd": "hello"}, "channel-id": 17}"#).unwrap();
        assert_eq!(r.channel_id, 17);
        assert_eq!(r.welcome.motd.as_deref(), Some("hello"));
    }

    #[test]
    fn test_channel_response_without_welcome() {
        let r: ChannelResponse =
            from_str(r#"{"messages": [{"phase": "pake", "body": "00ff"}]}"#).unwrap();
        assert_eq!(r.messages.len(), 1);
        assert_eq!(r.messages[0].phase, "pake");
        assert!(r.welcome.error.is_none());
    }

    #[test]
    fn test_welcome_error_is_fatal() {
        let gate = WelcomeGate::new("http://relay.example/".into());
        let ok: Welcome = from_str(r#"{"motd": "hi"}"#).unwrap();
        assert!(gate.observe(&ok).is_ok());

        let unwelcome: Welcome = from_str(r#"{"error": "closed for maintenance"}"#).unwrap();
        match gate.observe(&unwelcome) {
            Err(WormholeError::Server { message, relay }) => {
                assert_eq!(message, "closed for maintenance");
                assert_eq!(relay, "http://relay.example/");
            },
            other => panic!("expected a server error, got {other:?}"),
        }
    }
}

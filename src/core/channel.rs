//! Client side of one relay channel: store-and-forward sends plus
//! subscribe-and-wait receives.
//!
//! The relay broadcasts every message to every subscriber, including the
//! party that posted it. A message only counts as coming from the peer if we
//! never sent it ourselves, so filtering is by content, not by `side`: even a
//! man-in-the-middle reflecting our own bytes back at us cannot make them
//! look like a peer message.

use std::{collections::HashSet, sync::Arc};

use url::Url;

use super::{
    AppID, MySide, Phase, WormholeError,
    eventsource::EventSource,
    wire::{self, WelcomeGate},
};
use crate::util::DisplayBytes;

/// Shared plumbing for channels of one session: the relay base URL, the app
/// namespace, our side, and the welcome funnel.
pub(crate) struct ChannelManager {
    http: reqwest::Client,
    relay: Url,
    appid: AppID,
    side: MySide,
    gate: Arc<WelcomeGate>,
}

impl ChannelManager {
    pub fn new(relay: Url, appid: AppID, side: MySide) -> Result<Self, WormholeError> {
        let http = reqwest::Client::builder().build()?;
        let gate = WelcomeGate::new(relay.as_str().to_owned());
        Ok(ChannelManager {
            http,
            relay,
            appid,
            side,
            gate,
        })
    }

    /// Ask the relay for a fresh channel id.
    pub async fn allocate(&self) -> Result<u32, WormholeError> {
        let url = self.relay.join(&format!("{}/allocate", self.appid))?;
        let response: wire::AllocatedResponse = self
            .http
            .post(url)
            .json(&wire::SideOnly {
                side: self.side.as_ref(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.gate.observe(&response.welcome)?;
        tracing::debug!("allocated channel {}", response.channel_id);
        Ok(response.channel_id)
    }

    /// The client view of `channel_id`. No network traffic yet.
    pub fn connect(&self, channel_id: u32) -> Result<Channel, WormholeError> {
        Ok(Channel {
            http: self.http.clone(),
            url: self.relay.join(&format!("{}/{}", self.appid, channel_id))?,
            side: self.side.clone(),
            gate: self.gate.clone(),
            received: HashSet::new(),
            sent: HashSet::new(),
        })
    }
}

pub(crate) struct Channel {
    http: reqwest::Client,
    url: Url,
    side: MySide,
    gate: Arc<WelcomeGate>,
    received: HashSet<(Phase, Vec<u8>)>,
    sent: HashSet<(Phase, Vec<u8>)>,
}

impl Channel {
    fn merge_inbound(
        &mut self,
        messages: impl IntoIterator<Item = wire::MessageEntry>,
    ) -> Result<(), WormholeError> {
        for message in messages {
            let body = hex::decode(&message.body)?;
            self.received.insert((Phase::from(message.phase), body));
        }
        Ok(())
    }

    /// The first message for `phase` that was not one of ours.
    fn peer_message(&self, phase: &Phase) -> Option<Vec<u8>> {
        self.received
            .iter()
            .filter(|entry| !self.sent.contains(entry))
            .find(|(their_phase, _)| their_phase == phase)
            .map(|(_, body)| body.clone())
    }

    /// Post one message. The relay answers with the full channel history,
    /// which is merged into the received set.
    // TODO: retry on failure with exponential backoff, to ride out a
    // temporarily unreachable relay
    pub async fn send(&mut self, phase: Phase, body: &[u8]) -> Result<(), WormholeError> {
        tracing::trace!("sending {} message {}", phase, DisplayBytes(body));
        self.sent.insert((phase.clone(), body.to_vec()));
        let payload = wire::OutboundMessage {
            side: self.side.as_ref(),
            phase: phase.as_ref(),
            body: hex::encode(body),
        };
        let response: wire::ChannelResponse = self
            .http
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.gate.observe(&response.welcome)?;
        self.merge_inbound(response.messages)
    }

    /// The body of the first peer message for `phase`: either one we already
    /// hold, or the next one pushed over a fresh event stream.
    pub async fn get(&mut self, phase: &Phase) -> Result<Vec<u8>, WormholeError> {
        if let Some(body) = self.peer_message(phase) {
            return Ok(body);
        }
        let mut events = EventSource::connect(self.http.clone(), self.url.clone()).await?;
        loop {
            let (name, data) = events.next_event().await?;
            match name.as_str() {
                "welcome" => self.gate.observe(&serde_json::from_str(&data)?)?,
                "message" => {
                    let entry: wire::MessageEntry = serde_json::from_str(&data)?;
                    self.merge_inbound([entry])?;
                    if let Some(body) = self.peer_message(phase) {
                        return Ok(body);
                    }
                },
                other => tracing::debug!("ignoring event {other:?}"),
            }
        }
    }

    /// Drop our claim on the channel. One attempt, no retries, failures
    /// swallowed.
    pub async fn deallocate(&mut self) {
        let deallocate_url = format!("{}/deallocate", self.url);
        let result = self
            .http
            .post(deallocate_url)
            .json(&wire::SideOnly {
                side: self.side.as_ref(),
            })
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(err) = result {
            tracing::debug!("deallocate failed (ignored): {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_channel() -> Channel {
        let manager = ChannelManager::new(
            Url::parse("http://relay.example/").unwrap(),
            AppID::new("appid"),
            MySide::generate(),
        )
        .unwrap();
        manager.connect(1).unwrap()
    }

    #[test]
    fn test_own_messages_are_not_peer_messages() {
        let mut channel = test_channel();
        channel.sent.insert((Phase::PAKE, b"msg1".to_vec()));
        // the relay echoes our own message back at us
        channel.received.insert((Phase::PAKE, b"msg1".to_vec()));
        assert_eq!(channel.peer_message(&Phase::PAKE), None);

        // a genuine peer message on the same phase still gets through
        channel.received.insert((Phase::PAKE, b"msg2".to_vec()));
        assert_eq!(channel.peer_message(&Phase::PAKE), Some(b"msg2".to_vec()));
    }

    #[test]
    fn test_peer_message_matches_phase() {
        let mut channel = test_channel();
        channel.received.insert((Phase::PAKE, b"pake".to_vec()));
        assert_eq!(channel.peer_message(&Phase::DATA), None);
    }

    #[test]
    fn test_merge_inbound_rejects_bad_hex() {
        let mut channel = test_channel();
        let entry = wire::MessageEntry {
            phase: "pake".to_owned(),
            body: "not hex".to_owned(),
        };
        assert!(channel.merge_inbound([entry]).is_err());
    }
}

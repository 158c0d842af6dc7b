//! Live (non-durable) relay state: which channels currently have event
//! stream subscribers, and how fresh channel ids are chosen.

use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use rand::{Rng, seq::SliceRandom};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{Message, Relay, RelayError};

#[derive(Default)]
pub(crate) struct AppNamespace {
    pub channels: HashMap<u32, ChannelState>,
}

/// A channel only holds handles to its subscribers, never the subscribers
/// themselves: when a transport dies, its registration must vanish with it.
#[derive(Default)]
pub(crate) struct ChannelState {
    pub subscribers: HashMap<u64, UnboundedSender<Message>>,
}

/// Pick an unallocated channel id: uniformly from the smallest digit-count
/// range (1-9, 10-99, 100-999) that still has a free id, then random draws
/// above that, and eventually give up.
pub(crate) fn choose_channel_id(allocated: &HashSet<u32>) -> Result<u32, RelayError> {
    let mut rng = rand::thread_rng();
    for digits in 1..=3u32 {
        let range = 10u32.pow(digits - 1)..10u32.pow(digits);
        let free: Vec<u32> = range.filter(|cid| !allocated.contains(cid)).collect();
        if let Some(&channel_id) = free.choose(&mut rng) {
            return Ok(channel_id);
        }
    }
    for _tries in 0..1000 {
        let channel_id = rng.gen_range(1_000..1_000_000);
        if !allocated.contains(&channel_id) {
            return Ok(channel_id);
        }
    }
    Err(RelayError::ChannelsExhausted)
}

/// One live event stream registration. Yields every message posted to the
/// channel after the subscription was taken; ends when the channel is
/// deleted. Dropping it removes the registration.
pub struct Subscription {
    rx: UnboundedReceiver<Message>,
    _guard: SubscriberGuard,
}

impl Subscription {
    pub(crate) fn new(
        rx: UnboundedReceiver<Message>,
        relay: Arc<Relay>,
        app_id: String,
        channel_id: u32,
        subscriber_id: u64,
    ) -> Self {
        Subscription {
            rx,
            _guard: SubscriberGuard {
                relay,
                app_id,
                channel_id,
                subscriber_id,
            },
        }
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct SubscriberGuard {
    relay: Arc<Relay>,
    app_id: String,
    channel_id: u32,
    subscriber_id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.relay
            .unsubscribe(&self.app_id, self.channel_id, self.subscriber_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_allocations_are_single_digit() {
        let allocated = HashSet::new();
        for _ in 0..20 {
            let channel_id = choose_channel_id(&allocated).unwrap();
            assert!((1..=9).contains(&channel_id));
        }
    }

    #[test]
    fn test_falls_back_to_two_digits() {
        let allocated: HashSet<u32> = (1..=9).collect();
        for _ in 0..20 {
            let channel_id = choose_channel_id(&allocated).unwrap();
            assert!((10..=99).contains(&channel_id));
        }
    }

    #[test]
    fn test_falls_back_to_random_draws() {
        let allocated: HashSet<u32> = (1..=999).collect();
        let channel_id = choose_channel_id(&allocated).unwrap();
        assert!((1_000..1_000_000).contains(&channel_id));
    }

    #[test]
    fn test_exhaustion() {
        let allocated: HashSet<u32> = (1..1_000_000).collect();
        assert!(matches!(
            choose_channel_id(&allocated),
            Err(RelayError::ChannelsExhausted)
        ));
    }
}

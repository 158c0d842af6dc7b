#![forbid(unsafe_code)]

//! Establish a short, human-transcribable "wormhole code" between two
//! endpoints and use it to bootstrap an authenticated, confidential channel
//! for exchanging an arbitrary payload.
//!
//! A rendezvous relay (see the `wormhole-relay` crate) mediates discovery and
//! message forwarding; it never learns the shared secret. Both sides run a
//! symmetric password-authenticated key exchange over a numbered channel,
//! derive a session key from the code, and swap one authenticated-encrypted
//! payload each.
//!
//! ```no_run
//! # async fn example() -> Result<(), wormhole::WormholeError> {
//! use wormhole::{AppID, Wormhole};
//!
//! let mut sender = Wormhole::new(AppID::new("example.org-text"), "http://localhost:4000/")?;
//! let code = sender.get_code(2).await?;
//! println!("tell your peer: {code}");
//! sender.send_data(b"hello").await?;
//! let reply = sender.get_data().await?;
//! sender.close().await;
//! # Ok(()) }
//! ```
//!
//! The receiving side constructs its session the same way, enters the code
//! with [`Wormhole::set_code`], and runs the mirrored calls. Either side may
//! compare [`Wormhole::get_verifier`] values out-of-band before trusting the
//! channel.

#[macro_use]
mod util;

pub mod blocking;
mod core;

pub use crate::core::{
    AppID, Code, Phase, Wormhole, WormholeError,
    wordlist::{CodeWords, Wordlist},
};

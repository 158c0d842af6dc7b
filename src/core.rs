pub(crate) mod channel;
pub(crate) mod eventsource;
pub(super) mod key;
mod wire;
pub mod wordlist;

use std::{borrow::Cow, str::FromStr};

use serde_derive::{Deserialize, Serialize};
use url::Url;

use self::{
    channel::{Channel, ChannelManager},
    wordlist::{CodeWords, Wordlist},
};

/// An error occurred on the wormhole connection
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WormholeError {
    /// A session operation was called out of its legal state, or with an
    /// argument of the wrong shape. Raised before any network I/O happens.
    #[error("invalid use of the session: {0}")]
    Usage(&'static str),
    /// The relay's welcome carried a fatal error message. The server operator
    /// uses this to turn clients away.
    #[error("the server at {relay} reported: {message}")]
    Server { message: String, relay: String },
    /// The peer's payload failed to authenticate. If you didn't mistype the
    /// code, this is a sign of an attacker guessing codes. Please try again
    /// some time later.
    #[error(
        "wrong password: the peer's message failed to authenticate. If you \
        didn't mistype the code, this is a sign of an attacker guessing codes."
    )]
    WrongPassword,
    /// Key agreement failed on a malformed peer message
    #[error("key agreement failed")]
    PakeFailed,
    /// Cannot encrypt the outbound message
    #[error("cannot encrypt the outbound message")]
    Crypto,
    /// Corrupt message received from peer. Some deserialization went wrong,
    /// we probably got some garbage
    #[error("corrupt message received from peer")]
    ProtocolJson(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// A message body was not valid lowercase hex
    #[error("malformed message body")]
    ProtocolHex(
        #[from]
        #[source]
        hex::FromHexError,
    ),
    /// The wormhole code does not look like `NN-word-word`
    #[error("malformed code: {0}")]
    BadCode(String),
    /// Error talking to the relay server
    #[error("relay request failed")]
    Transport(
        #[from]
        #[source]
        reqwest::Error,
    ),
    /// The relay URL could not be parsed
    #[error("invalid relay URL")]
    RelayUrl(
        #[from]
        #[source]
        url::ParseError,
    ),
    /// I/O error from the runtime
    #[error("I/O error")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/// Newtype wrapper for application IDs
///
/// The application ID is a string that scopes all channels to that name,
/// effectively separating different protocols on the same relay server.
/// It is used as a URL path segment and must therefore not contain `/`.
#[derive(
    PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display, derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
#[display("{_0}")]
pub struct AppID(Cow<'static, str>);

impl AppID {
    /// Create a new app ID from an ID string
    pub fn new(id: impl Into<Cow<'static, str>>) -> Self {
        AppID(id.into())
    }
}

impl From<String> for AppID {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for AppID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// MySide is the string we put in all our outbound messages, so that we can
// recognize which channel messages are our own.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display)]
#[serde(transparent)]
#[display("{_0}")]
pub(crate) struct MySide(String);

impl MySide {
    /// 5 random bytes, hex-encoded
    pub fn generate() -> MySide {
        use rand::{RngCore, rngs::OsRng};

        let mut bytes: [u8; 5] = [0; 5];
        OsRng.fill_bytes(&mut bytes);

        MySide(hex::encode(bytes))
    }
}

impl AsRef<str> for MySide {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Short text tag distinguishing the logical messages on a channel.
///
/// The relay preserves it verbatim and does not interpret it.
#[derive(PartialEq, Eq, Clone, Debug, Hash, Deserialize, Serialize, derive_more::Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct Phase(Cow<'static, str>);

impl Phase {
    pub const DATA: Self = Phase(Cow::Borrowed("data"));
    pub const PAKE: Self = Phase(Cow::Borrowed("pake"));
}

impl From<String> for Phase {
    fn from(s: String) -> Phase {
        Phase(Cow::Owned(s))
    }
}

impl AsRef<str> for Phase {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A wormhole code à la `15-purple-elephant`
///
/// The part until the first dash is the channel id and is purely numeric. The
/// rest may be arbitrary, although dash-joining words from a word list is the
/// convention. The whole string is the PAKE password.
#[derive(
    PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display, derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
#[display("{_0}")]
pub struct Code(String);

impl FromStr for Code {
    type Err = WormholeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_code(s).map(|(code, _channel_id)| code)
    }
}

impl AsRef<str> for Code {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Split a code of the form `NN-...` into the code and its channel id.
fn parse_code(code: &str) -> Result<(Code, u32), WormholeError> {
    let Some((prefix, _rest)) = code.split_once('-') else {
        bail!(WormholeError::BadCode(format!(
            "code ({code}) must start with NN-"
        )));
    };
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        bail!(WormholeError::BadCode(format!(
            "code ({code}) must start with a numeric channel id"
        )));
    }
    let channel_id = prefix.parse().map_err(|_| {
        WormholeError::BadCode(format!("channel id in ({code}) is out of range"))
    })?;
    Ok((Code(code.to_owned()), channel_id))
}

/// Session state snapshot, only valid between code selection and key
/// agreement. The PAKE first-message has not been transmitted at that point,
/// so rehydration simply restarts the exchange with a fresh ephemeral.
#[derive(Serialize, Deserialize)]
struct SerializedState {
    app_id: String,
    relay: String,
    code: String,
    side: String,
}

/// A wormhole session: one side of the pairing protocol.
///
/// The session is linear. It starts *new*, learns its code (either by
/// allocating one via [`Wormhole::get_code`] or accepting a transcribed one
/// via [`Wormhole::set_code`]), agrees on a session key with the peer behind
/// the scenes on the first keyed operation, exchanges at most one payload in
/// each direction, and ends with [`Wormhole::close`]. Operations called out
/// of that order fail with [`WormholeError::Usage`] without touching the
/// network.
pub struct Wormhole {
    appid: AppID,
    relay: Url,
    side: MySide,
    manager: ChannelManager,
    wordlist: Box<dyn CodeWords + Send + Sync>,
    code: Option<Code>,
    channel: Option<Channel>,
    pake: Option<spake2::Spake2<spake2::Ed25519Group>>,
    msg1: Option<Vec<u8>>,
    key: Option<key::SessionKey>,
    verifier: Option<Vec<u8>>,
    started_code: bool,
    sent_data: bool,
    got_data: bool,
    closed: bool,
}

impl Wormhole {
    /// Create a new session talking to the relay at `relay_url`.
    ///
    /// Only wormholes created with the same `appid` can find each other.
    pub fn new(appid: AppID, relay_url: &str) -> Result<Self, WormholeError> {
        Self::with_side(appid, relay_url, MySide::generate())
    }

    fn with_side(appid: AppID, relay_url: &str, side: MySide) -> Result<Self, WormholeError> {
        ensure!(
            !appid.as_ref().contains('/'),
            WormholeError::Usage("app id must not contain '/'")
        );
        let mut relay = Url::parse(relay_url)?;
        if !relay.path().ends_with('/') {
            let path = format!("{}/", relay.path());
            relay.set_path(&path);
        }
        let manager = ChannelManager::new(relay.clone(), appid.clone(), side.clone())?;
        Ok(Wormhole {
            appid,
            relay,
            side,
            manager,
            wordlist: Box::new(Wordlist::default()),
            code: None,
            channel: None,
            pake: None,
            msg1: None,
            key: None,
            verifier: None,
            started_code: false,
            sent_data: false,
            got_data: false,
            closed: false,
        })
    }

    /// Replace the default word list used by [`Wormhole::get_code`].
    pub fn set_wordlist(&mut self, wordlist: Box<dyn CodeWords + Send + Sync>) {
        self.wordlist = wordlist;
    }

    /// The code this session is bound to, once one has been set.
    pub fn code(&self) -> Option<&Code> {
        self.code.as_ref()
    }

    /// Allocate a fresh channel on the relay and mint a code for it.
    ///
    /// `length` is the number of words appended after the channel id.
    /// May only be called once, and not after [`Wormhole::set_code`].
    pub async fn get_code(&mut self, length: usize) -> Result<Code, WormholeError> {
        ensure!(
            self.code.is_none(),
            WormholeError::Usage("a code has already been set")
        );
        ensure!(
            !self.started_code,
            WormholeError::Usage("get_code may only be called once")
        );
        self.started_code = true;
        let channel_id = self.manager.allocate().await?;
        let code = Code(format!(
            "{}-{}",
            channel_id,
            self.wordlist.suffix(channel_id, length)
        ));
        self.accept_code(code.clone(), channel_id)?;
        Ok(code)
    }

    /// Accept a code transcribed from the peer.
    ///
    /// Validates the `NN-` form and connects to the channel it names, without
    /// any network traffic yet.
    pub fn set_code(&mut self, code: &str) -> Result<(), WormholeError> {
        ensure!(
            self.code.is_none(),
            WormholeError::Usage("a code has already been set")
        );
        ensure!(
            !self.started_code,
            WormholeError::Usage("get_code has already been called")
        );
        let (code, channel_id) = parse_code(code)?;
        self.accept_code(code, channel_id)
    }

    fn accept_code(&mut self, code: Code, channel_id: u32) -> Result<(), WormholeError> {
        let (pake, msg1) = key::start_pake(code.as_ref(), &self.appid);
        self.channel = Some(self.manager.connect(channel_id)?);
        self.pake = Some(pake);
        self.msg1 = Some(msg1);
        self.code = Some(code);
        Ok(())
    }

    /// Run the PAKE exchange if it has not happened yet and return the
    /// session key. Idempotent; a transport failure leaves the session
    /// retryable.
    async fn agree_key(&mut self) -> Result<key::SessionKey, WormholeError> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or(WormholeError::Usage("no code has been set"))?;
        let msg1 = self
            .msg1
            .clone()
            .ok_or(WormholeError::Usage("no code has been set"))?;
        channel.send(Phase::PAKE, &msg1).await?;
        let peer_pake = channel.get(&Phase::PAKE).await?;
        let pake = self
            .pake
            .take()
            .ok_or(WormholeError::Usage("key exchange already finished"))?;
        let session_key = key::finish_pake(pake, &peer_pake)?;
        self.verifier = Some(key::derive_verifier(&session_key, &self.appid)?);
        self.key = Some(session_key.clone());
        self.msg1 = None;
        tracing::debug!("session key established");
        Ok(session_key)
    }

    /// A 32-byte value both sides can compare out-of-band to confirm they
    /// share the session key without revealing it.
    ///
    /// Drives the key agreement if it has not completed yet.
    pub async fn get_verifier(&mut self) -> Result<Vec<u8>, WormholeError> {
        ensure!(
            self.code.is_some(),
            WormholeError::Usage("get_verifier requires a code")
        );
        self.agree_key().await?;
        self.verifier.clone().ok_or(WormholeError::PakeFailed)
    }

    /// Derive a sub-key from the session key for an application-chosen
    /// purpose. Requires the key agreement to have completed.
    pub fn derive_key(&self, purpose: &[u8], length: usize) -> Result<Vec<u8>, WormholeError> {
        let key = self
            .key
            .as_ref()
            .ok_or(WormholeError::Usage("derive_key requires the session key"))?;
        key::derive_key(key, purpose, length)
    }

    /// Encrypt `plaintext` under the shared data key and post it to the peer.
    /// May only be called once.
    pub async fn send_data(&mut self, plaintext: &[u8]) -> Result<(), WormholeError> {
        ensure!(
            !self.sent_data,
            WormholeError::Usage("send_data may only be called once")
        );
        ensure!(
            self.code.is_some(),
            WormholeError::Usage("send_data requires a code")
        );
        let key = self.agree_key().await?;
        // Without predefined roles we cannot derive per-side keys, so both
        // directions use the same data key. Random nonces keep the messages
        // distinct, and the channel filters out reflections.
        let data_key = key::derive_key(&key, b"data-key", key::KEY_SIZE)?;
        let encrypted = key::encrypt_data(&data_key, plaintext)?;
        let channel = self
            .channel
            .as_mut()
            .ok_or(WormholeError::Usage("no code has been set"))?;
        channel.send(Phase::DATA, &encrypted).await?;
        self.sent_data = true;
        Ok(())
    }

    /// Wait for the peer's payload and decrypt it. May only be called once.
    ///
    /// Fails with [`WormholeError::WrongPassword`] when the payload does not
    /// authenticate under the shared data key, which is what happens when the
    /// two sides typed different codes.
    pub async fn get_data(&mut self) -> Result<Vec<u8>, WormholeError> {
        ensure!(
            !self.got_data,
            WormholeError::Usage("get_data may only be called once")
        );
        ensure!(
            self.code.is_some(),
            WormholeError::Usage("get_data requires a code")
        );
        let key = self.agree_key().await?;
        let data_key = key::derive_key(&key, b"data-key", key::KEY_SIZE)?;
        let channel = self
            .channel
            .as_mut()
            .ok_or(WormholeError::Usage("no code has been set"))?;
        let encrypted = channel.get(&Phase::DATA).await?;
        let plaintext =
            key::decrypt_data(&data_key, &encrypted).ok_or(WormholeError::WrongPassword)?;
        self.got_data = true;
        Ok(plaintext)
    }

    /// Snapshot the session as a JSON string.
    ///
    /// Only permitted after the code is set and before any keyed operation:
    /// past that point the session holds live key material that deliberately
    /// never leaves the process.
    pub fn serialize(&self) -> Result<String, WormholeError> {
        ensure!(
            self.code.is_some(),
            WormholeError::Usage("serialize requires a code")
        );
        ensure!(
            self.key.is_none() && !self.sent_data && !self.got_data,
            WormholeError::Usage("serialize is only permitted before key agreement")
        );
        let state = SerializedState {
            app_id: self.appid.to_string(),
            relay: self.relay.to_string(),
            code: self
                .code
                .as_ref()
                .map(|code| code.to_string())
                .unwrap_or_default(),
            side: self.side.to_string(),
        };
        Ok(serde_json::to_string(&state)?)
    }

    /// Rehydrate a session snapshotted with [`Wormhole::serialize`].
    pub fn from_serialized(data: &str) -> Result<Self, WormholeError> {
        let state: SerializedState = serde_json::from_str(data)?;
        let mut wormhole =
            Self::with_side(AppID::from(state.app_id), &state.relay, MySide(state.side))?;
        wormhole.set_code(&state.code)?;
        Ok(wormhole)
    }

    /// Release our claim on the channel. Best-effort: failures are swallowed,
    /// the relay expires abandoned channels on its own.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.deallocate().await;
        }
        self.closed = true;
    }
}

impl Drop for Wormhole {
    fn drop(&mut self) {
        if !self.closed && self.channel.is_some() {
            tracing::warn!("wormhole session dropped without close()");
        }
    }
}

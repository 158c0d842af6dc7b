//! Synchronous front-end over the async session.
//!
//! Drives the same protocol code on a private current-thread runtime, so the
//! wire behavior is identical to the async surface. Intended for simple
//! tools that do not otherwise run an async runtime.

use crate::core::{self, AppID, Code, WormholeError};

/// Blocking counterpart of [`crate::Wormhole`]. Every method maps 1:1 and
/// has the same preconditions.
pub struct Wormhole {
    runtime: tokio::runtime::Runtime,
    inner: core::Wormhole,
}

impl Wormhole {
    pub fn new(appid: AppID, relay_url: &str) -> Result<Self, WormholeError> {
        Ok(Wormhole {
            runtime: new_runtime()?,
            inner: core::Wormhole::new(appid, relay_url)?,
        })
    }

    pub fn get_code(&mut self, length: usize) -> Result<Code, WormholeError> {
        self.runtime.block_on(self.inner.get_code(length))
    }

    pub fn set_code(&mut self, code: &str) -> Result<(), WormholeError> {
        self.inner.set_code(code)
    }

    pub fn code(&self) -> Option<&Code> {
        self.inner.code()
    }

    pub fn get_verifier(&mut self) -> Result<Vec<u8>, WormholeError> {
        self.runtime.block_on(self.inner.get_verifier())
    }

    pub fn derive_key(&self, purpose: &[u8], length: usize) -> Result<Vec<u8>, WormholeError> {
        self.inner.derive_key(purpose, length)
    }

    pub fn send_data(&mut self, plaintext: &[u8]) -> Result<(), WormholeError> {
        self.runtime.block_on(self.inner.send_data(plaintext))
    }

    pub fn get_data(&mut self) -> Result<Vec<u8>, WormholeError> {
        self.runtime.block_on(self.inner.get_data())
    }

    pub fn serialize(&self) -> Result<String, WormholeError> {
        self.inner.serialize()
    }

    pub fn from_serialized(data: &str) -> Result<Self, WormholeError> {
        Ok(Wormhole {
            runtime: new_runtime()?,
            inner: core::Wormhole::from_serialized(data)?,
        })
    }

    pub fn close(&mut self) {
        self.runtime.block_on(self.inner.close())
    }
}

fn new_runtime() -> Result<tokio::runtime::Runtime, WormholeError> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

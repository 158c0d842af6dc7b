//! The cryptography of the protocol: symmetric PAKE over the channel, HKDF
//! sub-key derivation, and the secretbox sealing the payload.

use crypto_secretbox as secretbox;
use crypto_secretbox::aead::{Aead, AeadCore, KeyInit, OsRng};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};

use super::{AppID, WormholeError};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;

/// The 32-byte key both sides agree on; everything else is derived from it.
pub type SessionKey = secretbox::Key;

/// Begin the symmetric PAKE: the full code is the password, the app id the
/// domain separator. Returns the in-progress state and the message to post
/// under the `pake` phase.
pub fn start_pake(code: &str, appid: &AppID) -> (Spake2<Ed25519Group>, Vec<u8>) {
    Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(code.as_bytes()),
        &Identity::new(appid.as_ref().as_bytes()),
    )
}

/// Feed the peer's `pake` message into our state and produce the session key.
pub fn finish_pake(
    state: Spake2<Ed25519Group>,
    peer_msg: &[u8],
) -> Result<SessionKey, WormholeError> {
    let key = state
        .finish(peer_msg)
        .map_err(|_| WormholeError::PakeFailed)?;
    ensure!(key.len() == KEY_SIZE, WormholeError::PakeFailed);
    Ok(SessionKey::clone_from_slice(&key))
}

/// HKDF-SHA256 expansion of the session key for one purpose.
pub fn derive_key(
    key: &SessionKey,
    purpose: &[u8],
    length: usize,
) -> Result<Vec<u8>, WormholeError> {
    let hk = Hkdf::<Sha256>::new(None, key.as_slice());
    let mut derived = vec![0; length];
    hk.expand(purpose, &mut derived)
        .map_err(|_| WormholeError::Usage("derived key length out of range"))?;
    Ok(derived)
}

/// The verifier both sides compare out-of-band: bound to the app id so
/// different applications never produce comparable values.
pub fn derive_verifier(key: &SessionKey, appid: &AppID) -> Result<Vec<u8>, WormholeError> {
    let mut purpose = appid.as_ref().as_bytes().to_vec();
    purpose.extend_from_slice(b":Verifier");
    derive_key(key, &purpose, KEY_SIZE)
}

fn encrypt_data_with_nonce(
    key: &[u8],
    plaintext: &[u8],
    noncebuf: &[u8],
) -> Result<Vec<u8>, WormholeError> {
    let cipher = secretbox::XSalsa20Poly1305::new(secretbox::Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(secretbox::Nonce::from_slice(noncebuf), plaintext)
        .map_err(|_| WormholeError::Crypto)?;
    let mut nonce_and_ciphertext = noncebuf.to_vec();
    nonce_and_ciphertext.extend(ciphertext);
    Ok(nonce_and_ciphertext)
}

/// Seal `plaintext` under a random 24-byte nonce; the nonce is prepended to
/// the authenticated ciphertext.
pub fn encrypt_data(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, WormholeError> {
    ensure!(
        key.len() == KEY_SIZE,
        WormholeError::Usage("encryption key must be 32 bytes")
    );
    let noncebuf = secretbox::XSalsa20Poly1305::generate_nonce(&mut OsRng);
    encrypt_data_with_nonce(key, plaintext, &noncebuf)
}

/// Open a nonce-prefixed secretbox. `None` means the ciphertext did not
/// authenticate under `key`, which the session surfaces as a wrong password.
pub fn decrypt_data(key: &[u8], encrypted: &[u8]) -> Option<Vec<u8>> {
    if key.len() != KEY_SIZE || encrypted.len() < NONCE_SIZE {
        return None;
    }
    let (noncebuf, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let cipher = secretbox::XSalsa20Poly1305::new(secretbox::Key::from_slice(key));
    cipher
        .decrypt(secretbox::Nonce::from_slice(noncebuf), ciphertext)
        .ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn session_key(bytes: &[u8]) -> SessionKey {
        let mut padded = [0; KEY_SIZE];
        padded[..bytes.len()].copy_from_slice(bytes);
        SessionKey::clone_from_slice(&padded)
    }

    #[test]
    fn test_derive_key() {
        let main = SessionKey::clone_from_slice(
            &hex::decode("588ba9eef353778b074413a0140205d90d7479e36e0dd4ee35bb729d26131ef1")
                .unwrap(),
        );
        let dk1 = derive_key(&main, b"purpose1", 32).unwrap();
        assert_eq!(
            hex::encode(dk1),
            "835b5df80ce9ca46908e8524fb308649122cfbcefbeaa7e65061c6ef08ee1b2a"
        );

        let dk2 = derive_key(&main, b"purpose2", 10).unwrap();
        assert_eq!(hex::encode(dk2), "f2238e84315b47eb6279");
    }

    #[test]
    fn test_derive_key_too_long() {
        let main = session_key(b"key");
        // HKDF-SHA256 caps expansion at 255 blocks
        assert!(derive_key(&main, b"purpose", 255 * 32 + 1).is_err());
    }

    #[test]
    fn test_verifier_depends_on_appid() {
        let main = session_key(b"key");
        let v1 = derive_verifier(&main, &AppID::new("app1")).unwrap();
        let v2 = derive_verifier(&main, &AppID::new("app2")).unwrap();
        assert_eq!(v1.len(), KEY_SIZE);
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_encrypt_data() {
        let k = hex::decode("ddc543ef8e4629a603d39dd0307a51bb1e7adb9cb259f6b085c91d0842a18679")
            .unwrap();
        let plaintext = hex::decode("edc089a518219ec1cee184e89d2d37af").unwrap();
        assert_eq!(plaintext.len(), 16);
        let nonce = hex::decode("2d5e43eb465aa42e750f991e425bee485f06abad7e04af80").unwrap();
        assert_eq!(nonce.len(), NONCE_SIZE);
        let msg = encrypt_data_with_nonce(&k, &plaintext, &nonce).unwrap();
        assert_eq!(
            hex::encode(msg),
            "2d5e43eb465aa42e750f991e425bee485f06abad7e04af80fe318e39d0e4ce932d2b54b300c56d2cda55ee5f0488d63eb1d5f76f7919a49a"
        );
    }

    #[test]
    fn test_decrypt_data() {
        let k = hex::decode("ddc543ef8e4629a603d39dd0307a51bb1e7adb9cb259f6b085c91d0842a18679")
            .unwrap();
        let encrypted = hex::decode(
            "2d5e43eb465aa42e750f991e425bee485f06abad7e04af80fe318e39d0e4ce932d2b54b300c56d2cda55ee5f0488d63eb1d5f76f7919a49a",
        )
        .unwrap();
        match decrypt_data(&k, &encrypted) {
            Some(plaintext) => {
                assert_eq!(hex::encode(plaintext), "edc089a518219ec1cee184e89d2d37af");
            },
            None => {
                panic!("failed to decrypt");
            },
        };
    }

    #[test]
    fn test_encrypt_data_decrypt_data_roundtrip() {
        let main = session_key(b"key");
        let data_key = derive_key(&main, b"data-key", KEY_SIZE).unwrap();
        let plaintext = b"hello world";

        let encrypted = encrypt_data(&data_key, plaintext).unwrap();
        let decrypted = decrypt_data(&data_key, &encrypted).unwrap();
        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_decrypt_data_rejects_tampering() {
        let main = session_key(b"key");
        let data_key = derive_key(&main, b"data-key", KEY_SIZE).unwrap();
        let mut encrypted = encrypt_data(&data_key, b"hello world").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert_eq!(decrypt_data(&data_key, &encrypted), None);

        // truncated below the nonce length
        assert_eq!(decrypt_data(&data_key, &encrypted[..NONCE_SIZE - 1]), None);
    }
}

//! Cryptographic building blocks shared by IP Secure and Data Secure.
//!
//! KNX uses AES-128 in CCM mode, but with a split layout: the CBC-MAC is
//! computed over a caller-built block 0 and additional data, then the MAC
//! and the payload are encrypted together in CTR mode starting at counter 0.
//! Both halves are exposed separately because the secure wrapper, the
//! session handshake, timer notifies and Data Secure each build their
//! blocks differently.

use crate::error::{KnxError, Result};
use aes::{Aes128, Block};
use cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

/// AES-128 key
pub type Key = [u8; 16];

const PBKDF2_ITERATIONS: u32 = 65_536;
const USER_PASSWORD_SALT: &[u8] = b"user-password.1.secure.ip.knx.org";
const DEVICE_AUTHENTICATION_SALT: &[u8] = b"device-authentication-code.1.secure.ip.knx.org";

fn cipher(key: &Key) -> Aes128 {
    Aes128::new(&(*key).into())
}

/// CBC-MAC over `block_0 | len(additional_data) | additional_data | payload`,
/// zero padded to the block size, with a zero IV.
pub fn cbc_mac(key: &Key, additional_data: &[u8], payload: &[u8], block_0: &[u8; 16]) -> [u8; 16] {
    let aes = cipher(key);
    let mut data = Vec::with_capacity(16 + 2 + additional_data.len() + payload.len() + 15);
    data.extend_from_slice(block_0);
    data.extend_from_slice(&(additional_data.len() as u16).to_be_bytes());
    data.extend_from_slice(additional_data);
    data.extend_from_slice(payload);
    data.resize(data.len().div_ceil(16) * 16, 0);

    let mut state = Block::default();
    for chunk in data.chunks_exact(16) {
        for (s, b) in state.iter_mut().zip(chunk) {
            *s ^= b;
        }
        aes.encrypt_block(&mut state);
    }
    state.into()
}

/// AES-CTR starting at `counter_0`.
///
/// The first key stream block is applied to `mac`, the following ones to
/// `payload`. Encryption and decryption are the same operation.
///
/// Returns the transformed payload and MAC.
pub fn ctr(key: &Key, counter_0: &[u8; 16], mac: &[u8; 16], payload: &[u8]) -> (Vec<u8>, [u8; 16]) {
    let mut stream = Ctr128BE::<Aes128>::new(&(*key).into(), &(*counter_0).into());
    let mut out_mac = *mac;
    stream.apply_keystream(&mut out_mac);
    let mut out = payload.to_vec();
    stream.apply_keystream(&mut out);
    (out, out_mac)
}

/// Compare two MACs in constant time.
pub fn macs_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Byte-wise XOR of two equally long arrays.
pub fn xor<const N: usize>(a: &[u8; N], b: &[u8; N]) -> [u8; N] {
    let mut out = [0u8; N];
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x ^ y;
    }
    out
}

fn latin1(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(KnxError::invalid_credentials)
}

/// PBKDF2-HMAC-SHA256 truncated to a 16-byte key.
fn pbkdf2_sha256(password: &[u8], salt: &[u8]) -> Key {
    let mut key = [0u8; 16];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Derive the user password hash used to authenticate a session.
pub fn derive_user_password(password: &str) -> Result<Key> {
    Ok(pbkdf2_sha256(&latin1(password)?, USER_PASSWORD_SALT))
}

/// Derive the device authentication code that signs session responses.
pub fn derive_device_authentication_password(password: &str) -> Result<Key> {
    Ok(pbkdf2_sha256(&latin1(password)?, DEVICE_AUTHENTICATION_SALT))
}

/// Fresh X25519 key pair for one session.
pub fn generate_key_pair() -> (StaticSecret, [u8; 32]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// Session key: first 16 bytes of SHA-256 over the ECDH shared secret.
pub fn session_key(secret: &StaticSecret, peer_public: &[u8; 32]) -> Key {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    let digest = Sha256::digest(shared.as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

#[cfg(test)]
pub(crate) fn hex<const N: usize>(text: &str) -> [u8; N] {
    let digits: Vec<u8> = text
        .split_whitespace()
        .flat_map(|chunk| {
            (0..chunk.len())
                .step_by(2)
                .map(move |i| u8::from_str_radix(&chunk[i..i + 2], 16).unwrap())
        })
        .collect();
    digits.try_into().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTING_KEY: Key = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const ROUTING_PAYLOAD: &str = "06 10 05 30 00 11 29 00 bc d0 11 59 0a de 01 00 81";
    const ROUTING_CIPHERTEXT: &str = "b7 ee 7e 8a 1c 2f 7b ba be c7 75 fd 6e 10 d0 bc 4b";

    #[test]
    fn test_cbc_mac_routing_indication() {
        let payload: [u8; 17] = hex(ROUTING_PAYLOAD);
        let mac = cbc_mac(
            &ROUTING_KEY,
            &hex::<8>("06 10 09 50 00 37 00 00"),
            &payload,
            &hex("c0 c1 c2 c3 c4 c5 00 fa 12 34 56 78 af fe 00 11"),
        );
        assert_eq!(mac, hex::<16>("bd 0a 29 4b 95 25 54 b2 35 39 20 4c 22 71 d2 6b"));
    }

    #[test]
    fn test_cbc_mac_session_response() {
        let key = derive_device_authentication_password("trustme").unwrap();
        let additional: [u8; 40] = hex(
            "06 10 09 52 00 38 00 01 b7 52 be 24 64 59 26 0f \
             6b 0c 48 01 fb d5 a6 75 99 f8 3b 40 57 b3 ef 1e \
             79 e4 69 ac 17 23 4e 15",
        );
        assert_eq!(
            cbc_mac(&key, &additional, &[], &[0; 16]),
            hex::<16>("da 3d c6 af 79 89 6a a6 ee 75 73 d6 99 50 c2 83")
        );
    }

    #[test]
    fn test_ctr_encrypt_and_decrypt() {
        let counter_0 = hex("c0 c1 c2 c3 c4 c5 00 fa 12 34 56 78 af fe ff 00");
        let mac_cbc = hex("bd 0a 29 4b 95 25 54 b2 35 39 20 4c 22 71 d2 6b");
        let payload: [u8; 17] = hex(ROUTING_PAYLOAD);

        let (encrypted, mac) = ctr(&ROUTING_KEY, &counter_0, &mac_cbc, &payload);
        assert_eq!(encrypted, hex::<17>(ROUTING_CIPHERTEXT));
        assert_eq!(mac, hex::<16>("72 12 a0 3a aa e4 9d a8 56 89 77 4c 1d 2b 4d a4"));

        let (decrypted, mac_tr) = ctr(&ROUTING_KEY, &counter_0, &mac, &encrypted);
        assert_eq!(decrypted, payload);
        assert_eq!(mac_tr, mac_cbc);
    }

    #[test]
    fn test_password_derivation() {
        assert_eq!(
            derive_device_authentication_password("trustme").unwrap(),
            hex::<16>("e1 58 e4 01 20 47 bd 6c c4 1a af bc 5c 04 c1 fc")
        );
        assert_eq!(
            derive_user_password("secret").unwrap(),
            hex::<16>("03 fc ed b6 66 60 25 1e c8 1a 1a 71 69 01 69 6a")
        );
        assert!(derive_user_password("\u{20AC}uro").is_err());
    }

    #[test]
    fn test_key_pairs_differ() {
        let (secret_a, public_a) = generate_key_pair();
        let (secret_b, public_b) = generate_key_pair();
        assert_ne!(public_a, public_b);
        assert_eq!(session_key(&secret_a, &public_b), session_key(&secret_b, &public_a));
    }

    #[test]
    fn test_macs_equal() {
        assert!(macs_equal(&[1, 2, 3], &[1, 2, 3]));
        assert!(!macs_equal(&[1, 2, 3], &[1, 2, 4]));
        assert!(!macs_equal(&[1, 2], &[1, 2, 3]));
    }
}

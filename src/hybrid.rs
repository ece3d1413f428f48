//! Hybrid encryption: a fresh grid-cipher session key per logical message,
//! protected by the recipient's RSA public key.
//!
//! One policy for the whole system: the grid cipher protects every payload,
//! text and binary alike.

use rand::Rng;

use crate::error::ChatError;
use crate::gridcipher::GridCipher;
use crate::rsa::{self, PrivateKey, PublicKey};
use crate::SESSION_KEY_LEN;

/// Printable alphabet session keys are drawn from. Deliberately excludes
/// NUL so a recovered key never ends in the cipher's padding byte.
const SESSION_KEY_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Generate a fresh 32-character session key. Never reused across logical
/// messages and never persisted.
pub fn generate_session_key() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_KEY_LEN)
        .map(|_| SESSION_KEY_ALPHABET[rng.gen_range(0..SESSION_KEY_ALPHABET.len())] as char)
        .collect()
}

/// Encrypt raw bytes for `recipient`.
///
/// Returns the grid-cipher ciphertext and the base64 of the RSA-encrypted
/// session key.
pub fn encrypt_bytes(data: &[u8], recipient: &PublicKey) -> (Vec<u8>, String) {
    let session_key = generate_session_key();
    let cipher = GridCipher::new(&session_key);

    let ciphertext = cipher.encrypt(data);
    let protected_key = rsa::encrypt(session_key.as_bytes(), recipient);

    (ciphertext, base64::encode(protected_key))
}

/// Encrypt a text message for `recipient`. Both halves of the result are
/// base64 strings ready to drop into a packet.
pub fn encrypt_text(plaintext: &str, recipient: &PublicKey) -> (String, String) {
    let (ciphertext, protected_key) = encrypt_bytes(plaintext.as_bytes(), recipient);
    (base64::encode(ciphertext), protected_key)
}

/// Decrypt raw bytes with the caller's own private key.
///
/// The output may carry one trailing zero byte from the cipher's
/// even-length padding; callers that know the original length (file
/// transfers do, via the packet metadata) should truncate to it.
pub fn decrypt_bytes(
    data: &[u8],
    encrypted_key: &str,
    key: &PrivateKey,
) -> Result<Vec<u8>, ChatError> {
    let session_key = recover_session_key(encrypted_key, key)?;
    Ok(GridCipher::new(&session_key).decrypt(data))
}

/// Decrypt a text message with the caller's own private key.
pub fn decrypt_text(
    content: &str,
    encrypted_key: &str,
    key: &PrivateKey,
) -> Result<String, ChatError> {
    let raw = base64::decode(content)
        .map_err(|e| ChatError::Crypto(format!("bad ciphertext encoding: {}", e)))?;
    let mut plaintext = decrypt_bytes(&raw, encrypted_key, key)?;

    // An odd-length message picks up one padding zero; text never contains
    // NUL, so dropping it is safe.
    if plaintext.last() == Some(&0) {
        plaintext.pop();
    }

    String::from_utf8(plaintext)
        .map_err(|_| ChatError::Crypto("plaintext is not valid UTF-8".to_string()))
}

fn recover_session_key(encrypted_key: &str, key: &PrivateKey) -> Result<String, ChatError> {
    let raw = base64::decode(encrypted_key)
        .map_err(|e| ChatError::Crypto(format!("bad session key encoding: {}", e)))?;
    let decrypted = rsa::decrypt(&raw, key);

    String::from_utf8(decrypted)
        .map_err(|_| ChatError::Crypto("recovered session key is not printable".to_string()))
}

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::primes::generate_prime;

/// Fixed public exponent, the usual choice.
const PUBLIC_EXPONENT: u32 = 65537;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub e: BigUint,
    pub n: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKey {
    pub d: BigUint,
    pub n: BigUint,
}

/// One identity's key pair. Created once per client connection (and once
/// per relay process) and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct RsaKeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// Generate a key pair with a modulus of `bits` bits.
///
/// Two independent primes of half the width are multiplied into `n`;
/// the private exponent is the inverse of 65537 modulo `(p-1)(q-1)`.
pub fn generate_keypair(bits: u64) -> RsaKeyPair {
    let p = generate_prime(bits / 2);
    let q = generate_prime(bits / 2);

    let n = &p * &q;
    let phi = (&p - 1u32) * (&q - 1u32);

    let e = BigUint::from(PUBLIC_EXPONENT);
    let d = mod_inverse(&e, &phi);

    RsaKeyPair {
        public: PublicKey { e, n: n.clone() },
        private: PrivateKey { d, n },
    }
}

/// Raw (unpadded) encryption of a short byte buffer.
///
/// The buffer is read as a little-endian unsigned integer `m`, which must
/// be smaller than the modulus. Callers only ever pass session keys or
/// identifiers, which are far below the modulus width; anything larger is
/// silently corrupted because there is no integrity check to catch it.
pub fn encrypt(data: &[u8], key: &PublicKey) -> Vec<u8> {
    let m = BigUint::from_bytes_le(data);
    m.modpow(&key.e, &key.n).to_bytes_le()
}

/// Inverse of [`encrypt`].
pub fn decrypt(data: &[u8], key: &PrivateKey) -> Vec<u8> {
    let c = BigUint::from_bytes_le(data);
    c.modpow(&key.d, &key.n).to_bytes_le()
}

/// Iterative extended Euclid, with the negative case folded back into
/// `[0, modulus)`.
fn mod_inverse(value: &BigUint, modulus: &BigUint) -> BigUint {
    let m0 = BigInt::from(modulus.clone());
    let mut a = BigInt::from(value.clone());
    let mut m = m0.clone();
    let mut x0 = BigInt::zero();
    let mut x1 = BigInt::one();

    if m0.is_one() {
        return BigUint::zero();
    }

    while a > BigInt::one() {
        let q = &a / &m;

        let t = m.clone();
        m = &a % &m;
        a = t;

        let t = x0.clone();
        x0 = &x1 - &q * &x0;
        x1 = t;
    }

    if x1 < BigInt::zero() {
        x1 += &m0;
    }

    x1.to_biguint()
        .expect("inverse is non-negative after normalization")
}

// ---------------------------------------------------------------------------
// Wire encoding
// ---------------------------------------------------------------------------

/// Decimal-string form of a public key, as carried inside key-exchange
/// packets (base64 over this JSON).
#[derive(Serialize, Deserialize)]
struct WireKey {
    e: String,
    n: String,
}

impl PublicKey {
    /// Encode for a key-exchange packet: `base64(json({"e", "n"}))`.
    pub fn to_wire(&self) -> String {
        let json = serde_json::json!({
            "e": self.e.to_string(),
            "n": self.n.to_string(),
        });
        base64::encode(json.to_string())
    }

    /// Parse key material received in a key-exchange packet.
    pub fn from_wire(content: &str) -> Result<Self, ChatError> {
        let raw =
            base64::decode(content).map_err(|e| ChatError::KeyFormat(e.to_string()))?;
        let text =
            String::from_utf8(raw).map_err(|e| ChatError::KeyFormat(e.to_string()))?;
        let wire: WireKey =
            serde_json::from_str(&text).map_err(|e| ChatError::KeyFormat(e.to_string()))?;

        let e = wire
            .e
            .parse::<BigUint>()
            .map_err(|e| ChatError::KeyFormat(e.to_string()))?;
        let n = wire
            .n
            .parse::<BigUint>()
            .map_err(|e| ChatError::KeyFormat(e.to_string()))?;

        Ok(Self { e, n })
    }
}

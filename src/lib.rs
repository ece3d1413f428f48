pub mod client;
pub mod commands;
pub mod error;
pub mod gridcipher;
pub mod hybrid;
pub mod primes;
pub mod protocol;
pub mod relay;
pub mod rsa;

pub const RSA_KEY_BITS: u64 = 1024;
pub const MILLER_RABIN_ROUNDS: u32 = 20;
pub const SESSION_KEY_LEN: usize = 32;

// File payloads are encrypted first and the encrypted blob is sliced into
// chunks of this many bytes. The cipher inserts filler bytes, so chunk
// boundaries never line up with plaintext offsets.
pub const CHUNK_SIZE: usize = 4096;

// Sender identity reserved for the relay's own key-exchange packet.
pub const SERVER_SENDER_ID: &str = "SERVER";

pub const DEFAULT_PORT: u16 = 4933;

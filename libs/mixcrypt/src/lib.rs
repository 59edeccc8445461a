//! ElGamal encryption over a safe-prime group, plus the re-encryption mixnet
//! used to anonymize and decrypt votes at tally time.
//!
//! Votes are encrypted in the booth against the combined public key of every
//! authority assigned to a voting. At tally time each authority in turn
//! shuffles the ciphertexts and strips its own share of the key, so no single
//! authority can link a decrypted vote back to the voter who cast it.
//!
//! All big-number arithmetic is done with [`openssl::bn`].

mod bigint;
mod elgamal;
mod error;
mod mixnet;

pub use bigint::BigInt;
pub use elgamal::{combine_public_keys, Ciphertext, Group, KeyPair, PublicKey};
pub use error::{Error, Result};
pub use mixnet::{shuffle, Mixnet};

/// Default key size, in bits, for newly generated groups.
pub const DEFAULT_KEYBITS: u32 = 256;

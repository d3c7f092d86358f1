//! Static X25519 keypairs for the Noise handshake.
//!
//! Keys are managed via x25519-dalek for explicit control; snow drives the
//! handshake state machine using them. Private key material is zeroized on
//! drop and never exposed directly.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// A long-term static X25519 keypair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    /// Public key — this is the identity peers validate against.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes. The public key
    /// is derived deterministically.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage. Store securely.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub(crate) fn private(&self) -> &[u8; 32] {
        &self.private
    }
}

//! Peer identities and the registry that issues them.
//!
//! An identity is a random 128-bit token bound to the network address a
//! peer accepts connections on. Tokens are never reused while registered,
//! and blacklisted tokens (the distributor's own) are never issued.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock;

/// Random identity token. Serialized as a hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub [u8; 16]);

impl Token {
    /// Draw a token from `rng`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Token::from_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid token: {s}")))
    }
}

/// A peer's identity: token plus the address it accepts connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub token: Token,
    pub address: SocketAddr,
}

impl Identity {
    /// Create a fresh identity with a random token.
    pub fn generate(address: SocketAddr) -> Self {
        Self {
            token: Token::random(&mut rand::thread_rng()),
            address,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.token, self.address)
    }
}

/// Ordered set of identities, as carried in topology messages.
pub type IdentitySet = BTreeSet<Identity>;

#[derive(Debug, Default)]
struct RegistryState {
    by_address: HashMap<SocketAddr, Identity>,
    tokens: HashSet<Token>,
    blacklist: HashSet<Token>,
}

/// Issues identities to newly accepted peers.
///
/// All operations go through one lock, so connections handled on
/// different tasks can register concurrently.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    state: Mutex<RegistryState>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue an identity for `address`.
    ///
    /// Fails if the address is already registered.
    pub fn register(&self, address: SocketAddr) -> Result<Identity> {
        self.register_with(address, &mut rand::thread_rng())
    }

    /// Issue an identity for `address`, drawing tokens from `rng`.
    pub fn register_with<R: Rng + ?Sized>(&self, address: SocketAddr, rng: &mut R) -> Result<Identity> {
        let mut state = self.lock();
        if state.by_address.contains_key(&address) {
            return Err(Error::DuplicateAddress(address));
        }

        // Retry on collision; terminates with probability 1.
        let token = loop {
            let token = Token::random(rng);
            if !state.tokens.contains(&token) && !state.blacklist.contains(&token) {
                break token;
            }
        };

        let identity = Identity { token, address };
        state.tokens.insert(token);
        state.by_address.insert(address, identity);
        debug!(identity = %identity, "Registered identity");
        Ok(identity)
    }

    /// Remove an identity. Returns false if it was not registered.
    pub fn unregister(&self, identity: &Identity) -> bool {
        let mut state = self.lock();
        if state.by_address.get(&identity.address) != Some(identity) {
            return false;
        }
        state.by_address.remove(&identity.address);
        state.tokens.remove(&identity.token);
        debug!(identity = %identity, "Unregistered identity");
        true
    }

    /// Never issue this identity's token.
    pub fn blacklist(&self, identity: &Identity) {
        self.lock().blacklist.insert(identity.token);
    }

    pub fn lookup(&self, address: &SocketAddr) -> Option<Identity> {
        self.lock().by_address.get(address).copied()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.lock().by_address.get(&identity.address) == Some(identity)
    }

    pub fn len(&self) -> usize {
        self.lock().by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }
}

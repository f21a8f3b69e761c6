//! Relay registry
//!
//! Owns every [`PeerRelay`], keyed by remote player id, and maps event loop
//! tokens back to the relay whose local socket they belong to.

use std::collections::HashMap;
use std::time::Instant;

use mio::Token;

use super::PeerRelay;
use crate::PlayerId;

// ============================================================================
// Registry Structure
// ============================================================================

/// Relays by remote player id
pub struct RelayRegistry {
    relays: HashMap<PlayerId, PeerRelay>,

    /// Reverse map: socket token to remote player id
    tokens: HashMap<Token, PlayerId>,

    /// Next token handed to a new relay
    next_token: usize,
}

impl RelayRegistry {
    /// Create an empty registry handing out tokens from `first_token` upward
    pub fn new(first_token: Token) -> Self {
        RelayRegistry {
            relays: HashMap::new(),
            tokens: HashMap::new(),
            next_token: first_token.0,
        }
    }

    /// Reserve a token for a relay about to be created
    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Add a relay. An existing relay for the same player is closed and
    /// returned.
    pub fn insert(&mut self, relay: PeerRelay) -> Option<PeerRelay> {
        let remote_id = relay.remote_id();
        log::info!("Registering {} (token={:?})", relay, relay.token());

        self.tokens.insert(relay.token(), remote_id);
        let mut previous = self.relays.insert(remote_id, relay)?;

        log::warn!("Replacing existing {}", previous);
        self.tokens.remove(&previous.token());
        previous.close();
        Some(previous)
    }

    /// Close and remove the relay for `remote_id`
    pub fn remove(&mut self, remote_id: PlayerId) -> Option<PeerRelay> {
        let mut relay = self.relays.remove(&remote_id)?;
        self.tokens.remove(&relay.token());
        relay.close();
        log::info!("Unregistered {}", relay);
        Some(relay)
    }

    pub fn get(&self, remote_id: PlayerId) -> Option<&PeerRelay> {
        self.relays.get(&remote_id)
    }

    pub fn get_mut(&mut self, remote_id: PlayerId) -> Option<&mut PeerRelay> {
        self.relays.get_mut(&remote_id)
    }

    pub fn contains(&self, remote_id: PlayerId) -> bool {
        self.relays.contains_key(&remote_id)
    }

    /// Relay owning the local socket registered under `token`
    pub fn find_by_token(&mut self, token: Token) -> Option<&mut PeerRelay> {
        let remote_id = self.tokens.get(&token)?;
        self.relays.get_mut(remote_id)
    }

    /// Relays in ascending remote id order
    pub fn iter(&self) -> impl Iterator<Item = &PeerRelay> {
        let mut relays: Vec<&PeerRelay> = self.relays.values().collect();
        relays.sort_by_key(|r| r.remote_id());
        relays.into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRelay> {
        self.relays.values_mut()
    }

    /// Earliest watchdog deadline across all relays
    pub fn next_deadline(&self) -> Option<Instant> {
        self.relays.values().filter_map(PeerRelay::next_deadline).min()
    }

    /// Close and drop every relay
    pub fn close_all(&mut self) {
        for (_, mut relay) in self.relays.drain() {
            relay.close();
        }
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

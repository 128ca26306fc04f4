//! In-flight registry: which content hashes are being translated right now.
//! Each claim carries its own CancellationToken and a ticket. A job may only
//! release the entry whose ticket it holds, so a stale job can never clear
//! a newer claim for the same hash.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::cache::ContentHash;

#[derive(Debug)]
struct Claim {
    ticket: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct InFlightSet {
    claims: HashMap<ContentHash, Claim>,
    next_ticket: u64,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.claims.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Claim `hash`. Returns the ticket and the token the job must observe.
    /// Callers check [`contains`](Self::contains) first, in the same critical section.
    pub fn claim(&mut self, hash: ContentHash) -> (u64, CancellationToken) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let token = CancellationToken::new();
        if let Some(old) = self.claims.insert(
            hash,
            Claim {
                ticket,
                token: token.clone(),
            },
        ) {
            old.token.cancel();
        }
        (ticket, token)
    }

    /// Release after the job settled. False if the claim was cancelled or
    /// replaced in the meantime.
    pub fn release(&mut self, hash: &ContentHash, ticket: u64) -> bool {
        match self.claims.get(hash) {
            Some(claim) if claim.ticket == ticket => {
                self.claims.remove(hash);
                true
            }
            _ => false,
        }
    }

    /// Cancel and drop the claim for `hash`.
    pub fn cancel(&mut self, hash: &ContentHash) -> bool {
        match self.claims.remove(hash) {
            Some(claim) => {
                claim.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything. Returns the hashes that were in flight.
    pub fn cancel_all(&mut self) -> Vec<ContentHash> {
        self.claims
            .drain()
            .map(|(hash, claim)| {
                claim.token.cancel();
                hash
            })
            .collect()
    }
}

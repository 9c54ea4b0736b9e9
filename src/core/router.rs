//! # Sticky-mode worker selection.
//!
//! The router works on worker *slots* (`0..workers`), not on worker ids: a
//! respawned worker takes over its predecessor's slot, so clients keep landing on
//! the same slot across restarts.
//!
//! - [`RoutingPolicy::PeerHash`]: rendezvous hashing of the peer IP. Every
//!   (peer, slot) pair gets a score; slots are tried from the highest score down.
//!   The same peer always gets the same order, and a slot leaving the live set
//!   only moves the peers that were mapped to it.
//! - [`RoutingPolicy::RoundRobin`]: rotate through the live slots.
//!
//! The returned order doubles as the failover order when a handoff fails.

use std::net::IpAddr;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RoutingPolicy {
    #[default]
    RoundRobin,
    /// Peer affinity; `seed` lets operators reshuffle the mapping.
    PeerHash { seed: u64 },
}

pub(crate) struct Router {
    policy: RoutingPolicy,
    cursor: usize,
}

impl Router {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy, cursor: 0 }
    }

    /// Preference order over `slots`; the first entry is the pick.
    pub fn order(&mut self, peer: IpAddr, slots: &[usize]) -> Vec<usize> {
        if slots.is_empty() {
            return Vec::new();
        }
        match self.policy {
            RoutingPolicy::RoundRobin => {
                let start = self.cursor % slots.len();
                self.cursor = self.cursor.wrapping_add(1);
                slots[start..].iter().chain(&slots[..start]).copied().collect()
            }
            RoutingPolicy::PeerHash { seed } => {
                let mut scored: Vec<(u64, usize)> =
                    slots.iter().map(|&s| (score(seed, peer, s), s)).collect();
                scored.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                scored.into_iter().map(|(_, s)| s).collect()
            }
        }
    }
}

fn score(seed: u64, peer: IpAddr, slot: usize) -> u64 {
    let mut h = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            h ^= u64::from(*b);
            h = h.wrapping_mul(FNV_PRIME);
        }
    };
    feed(&seed.to_le_bytes());
    match peer {
        IpAddr::V4(v4) => feed(&v4.octets()),
        IpAddr::V6(v6) => feed(&v6.octets()),
    }
    feed(&(slot as u64).to_le_bytes());
    h
}

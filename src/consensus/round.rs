use serde::{Deserialize, Serialize};

use crate::types::{Header, Peer};

/// Fixed proposer ordering plus the index of the most recent proposer.
///
/// Slots are `interval` milliseconds long and repeat every `interval * len`.
/// After a block from peer `i` at time `t`, peer `i + k` owns the instants
/// `t + k * interval (mod cycle)`; the same peer owns `t + cycle`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub peers: Vec<Peer>,
    pub current_index: i64,
}

impl Round {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            peers,
            current_index: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn index_of(&self, address: &str) -> Option<usize> {
        self.peers.iter().position(|peer| peer.account == address)
    }

    pub fn peer(&self, address: &str) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.account == address)
    }

    /// Clockwise slot count from `from` to `to`.
    pub fn distance(&self, from: &str, to: &str) -> Option<u64> {
        let from = self.index_of(from)?;
        let to = self.index_of(to)?;
        let len = self.len();
        Some(((to + len - from) % len) as u64)
    }

    pub fn update_index(&mut self, miner: &str) {
        self.current_index = self.index_of(miner).map_or(-1, |index| index as i64);
    }

    /// Whether `candidate` may propose the successor of `last` at `candidate_time`.
    pub fn is_eligible(&self, last: &Header, candidate: &str, candidate_time: u64, interval: u64) -> bool {
        let Some(index) = self.index_of(candidate) else {
            return false;
        };
        if last.height == 0 {
            return index == 0;
        }
        if candidate_time <= last.timestamp || interval == 0 {
            return false;
        }
        let Some(distance) = self.distance(&last.coinbase, candidate) else {
            return false;
        };
        let cycle = interval * self.len() as u64;
        (candidate_time - last.timestamp) % cycle == distance * interval
    }

    /// Earliest instant at or after `not_before` at which `me` may propose on
    /// top of `last`. At genesis peer 0 may propose immediately.
    pub fn next_slot(&self, last: &Header, me: &str, not_before: u64, interval: u64) -> Option<u64> {
        let index = self.index_of(me)?;
        if last.height == 0 {
            return (index == 0).then_some(not_before);
        }
        if interval == 0 {
            return None;
        }
        let distance = self.distance(&last.coinbase, me)?;
        let cycle = interval * self.len() as u64;
        let offset = if distance == 0 { cycle } else { distance * interval };
        let first = last.timestamp + offset;
        if first >= not_before {
            return Some(first);
        }
        let cycles = (not_before - first).div_ceil(cycle);
        Some(first + cycles * cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: u64 = 3_000;

    fn peer(n: u8) -> Peer {
        Peer {
            account: format!("{n:02x}").repeat(32),
            address: "127.0.0.1".into(),
            port: 19950 + n as u16,
            weight: 1,
        }
    }

    fn round(n: u8) -> Round {
        Round::new((0..n).map(peer).collect())
    }

    fn last(height: u64, miner: &Peer, timestamp: u64) -> Header {
        let mut header = Header::genesis("00".repeat(32), "00".repeat(32));
        header.height = height;
        header.coinbase = miner.account.clone();
        header.timestamp = timestamp;
        header
    }

    #[test]
    fn distance_wraps_clockwise() {
        let round = round(4);
        assert_eq!(round.distance(&peer(1).account, &peer(3).account), Some(2));
        assert_eq!(round.distance(&peer(3).account, &peer(1).account), Some(2));
        assert_eq!(round.distance(&peer(2).account, &peer(2).account), Some(0));
        assert_eq!(round.distance(&peer(2).account, &"ff".repeat(32)), None);
    }

    #[test]
    fn exactly_one_peer_per_slot_over_a_full_cycle() {
        for size in 1..=5u8 {
            let round = round(size);
            for miner in 0..size {
                let last = last(10, &peer(miner), 1_000_000);
                let cycle = INTERVAL * size as u64;
                let offsets = (1..=2 * cycle / INTERVAL)
                    .flat_map(|k| [k * INTERVAL - 1, k * INTERVAL, k * INTERVAL + 1, k * INTERVAL + INTERVAL / 2]);
                for offset in offsets {
                    let time = last.timestamp + offset;
                    let eligible: Vec<_> = round
                        .peers
                        .iter()
                        .filter(|candidate| round.is_eligible(&last, &candidate.account, time, INTERVAL))
                        .collect();
                    if offset % INTERVAL == 0 {
                        assert_eq!(eligible.len(), 1, "size {size} miner {miner} offset {offset}");
                        let slot = (offset / INTERVAL) % size as u64;
                        let expected = (miner as u64 + slot) % size as u64;
                        assert_eq!(eligible[0], &peer(expected as u8));
                    } else {
                        assert!(eligible.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn only_first_peer_proposes_on_genesis() {
        let round = round(3);
        let genesis = Header::genesis("00".repeat(32), "00".repeat(32));
        assert!(round.is_eligible(&genesis, &peer(0).account, 12_345, INTERVAL));
        assert!(!round.is_eligible(&genesis, &peer(1).account, 3_000, INTERVAL));
        assert_eq!(round.next_slot(&genesis, &peer(0).account, 77, INTERVAL), Some(77));
        assert_eq!(round.next_slot(&genesis, &peer(2).account, 77, INTERVAL), None);
    }

    #[test]
    fn next_slot_lands_on_an_eligible_instant() {
        let round = round(3);
        let last = last(5, &peer(1), 60_000);
        for me in 0..3 {
            for not_before in [0, 60_001, 63_000, 70_000, 200_000] {
                let slot = round
                    .next_slot(&last, &peer(me).account, not_before, INTERVAL)
                    .expect("slot");
                assert!(slot >= not_before);
                assert!(round.is_eligible(&last, &peer(me).account, slot, INTERVAL));
                assert!(slot - not_before.max(last.timestamp) <= 3 * INTERVAL);
            }
        }
        assert_eq!(round.next_slot(&last, &peer(2).account, 0, INTERVAL), Some(63_000));
        assert_eq!(round.next_slot(&last, &peer(1).account, 0, INTERVAL), Some(69_000));
    }

    #[test]
    fn update_index_tracks_last_miner() {
        let mut round = round(3);
        assert_eq!(round.current_index, -1);
        round.update_index(&peer(2).account);
        assert_eq!(round.current_index, 2);
    }
}

use crate::types::{Address, unix_now};
use std::time::Duration;

/// Proof-of-Authority rotation: the producer for a height is
/// `authorities[height % len]`. No voting, no leader election; a block from
/// any other signer is simply invalid.
#[derive(Clone, Debug)]
pub struct Poa {
    authorities: Vec<Address>,
    block_time: Duration,
}

impl Poa {
    pub fn new(authorities: Vec<Address>, block_time: Duration) -> Self {
        debug_assert!(!authorities.is_empty());
        Poa {
            authorities,
            block_time,
        }
    }

    pub fn authorities(&self) -> &[Address] {
        &self.authorities
    }

    pub fn slot_producer(&self, height: u64) -> Address {
        self.authorities[(height % self.authorities.len() as u64) as usize]
    }

    pub fn can_produce(&self, next_height: u64, addr: &Address) -> bool {
        self.slot_producer(next_height) == *addr
    }

    /// Pacing: a slot opens `block_time` after the parent's timestamp.
    pub fn should_produce(&self, parent_timestamp: i64) -> bool {
        unix_now() >= parent_timestamp + self.block_time.as_secs() as i64
    }

    pub fn block_time(&self) -> Duration {
        self.block_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes)
    }

    #[test]
    fn rotation_is_modular() {
        let poa = Poa::new(vec![addr(1), addr(2), addr(3)], Duration::from_secs(5));
        assert_eq!(poa.slot_producer(0), addr(1));
        assert_eq!(poa.slot_producer(1), addr(2));
        assert_eq!(poa.slot_producer(2), addr(3));
        assert_eq!(poa.slot_producer(3), addr(1));
        assert_eq!(poa.slot_producer(301), addr(2));
    }

    #[test]
    fn can_produce_only_in_own_slot() {
        let poa = Poa::new(vec![addr(1), addr(2)], Duration::from_secs(5));
        assert!(poa.can_produce(0, &addr(1)));
        assert!(!poa.can_produce(0, &addr(2)));
        assert!(poa.can_produce(1, &addr(2)));
    }

    #[test]
    fn single_authority_owns_every_slot() {
        let poa = Poa::new(vec![addr(9)], Duration::from_secs(1));
        for height in 0..10 {
            assert!(poa.can_produce(height, &addr(9)));
        }
    }

    #[test]
    fn pacing_respects_block_time() {
        let poa = Poa::new(vec![addr(1)], Duration::from_secs(5));
        // parent far in the past: slot is open
        assert!(poa.should_produce(unix_now() - 60));
        // parent in the future: slot is closed
        assert!(!poa.should_produce(unix_now() + 60));
    }
}

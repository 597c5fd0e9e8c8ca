//! Address Book
//!
//! Remembers the last tick each placed address was seen in gossip, so that
//! addresses of departed peers can be reaped from the class groups.

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct AddressBook {
    last_seen: HashMap<IpAddr, u64>,
    generation: u64,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new tick; returns its generation number
    pub fn advance(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn touch(&mut self, addr: IpAddr) {
        self.last_seen.insert(addr, self.generation);
    }

    /// Forget and return every address unseen for at least `max_age` ticks
    pub fn reap(&mut self, max_age: u64) -> Vec<IpAddr> {
        let generation = self.generation;
        let mut stale: Vec<IpAddr> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| generation.saturating_sub(**seen) >= max_age)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &stale {
            self.last_seen.remove(addr);
        }

        stale.sort();
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_reap_after_absence() {
        let mut book = AddressBook::new();
        book.advance();
        book.touch(ip("1.1.1.1"));
        book.touch(ip("2.2.2.2"));

        book.advance();
        book.touch(ip("1.1.1.1"));
        assert!(book.reap(2).is_empty());

        book.advance();
        book.touch(ip("1.1.1.1"));
        assert_eq!(book.reap(2), vec![ip("2.2.2.2")]);
        assert_eq!(book.last_seen.len(), 1);
    }

    #[test]
    fn test_reap_forgets() {
        let mut book = AddressBook::new();
        book.advance();
        book.touch(ip("3.3.3.3"));
        book.advance();
        assert_eq!(book.reap(1).len(), 1);
        assert!(book.reap(1).is_empty());
        assert!(book.last_seen.is_empty());
    }
}

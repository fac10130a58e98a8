//! Bounded address pool.
//!
//! Addresses are `{prefix}.{block}.{host}`. Allocation walks hosts within a
//! block, then moves to the next block, wrapping to the first block once the
//! range is exhausted. Ports are derived from the linear index of the address,
//! so the address alone determines the port.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use super::error::{IsolationError, IsolationResult};

/// Static description of the address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub prefix: [u8; 2],
    pub block_start: u8,
    pub block_end: u8,
    pub host_start: u8,
    pub host_end: u8,
    pub base_port: u16,
}

impl AddressRange {
    /// Parse a `"10.89"` style prefix.
    pub fn parse_prefix(prefix: &str) -> IsolationResult<[u8; 2]> {
        let mut parts = prefix.trim().split('.');
        let mut octet = || -> IsolationResult<u8> {
            parts
                .next()
                .and_then(|p| p.parse::<u8>().ok())
                .ok_or_else(|| {
                    IsolationError::InvalidConfig(format!(
                        "subnet prefix '{}' must be two octets, e.g. 10.89",
                        prefix
                    ))
                })
        };
        let first = octet()?;
        let second = octet()?;
        if parts.next().is_some() {
            return Err(IsolationError::InvalidConfig(format!(
                "subnet prefix '{}' must be two octets, e.g. 10.89",
                prefix
            )));
        }
        Ok([first, second])
    }

    fn hosts_per_block(&self) -> usize {
        usize::from(self.host_end - self.host_start) + 1
    }

    fn blocks(&self) -> usize {
        usize::from(self.block_end - self.block_start) + 1
    }

    pub fn capacity(&self) -> usize {
        self.blocks() * self.hosts_per_block()
    }

    fn validate(&self) -> IsolationResult<()> {
        if self.block_start > self.block_end {
            return Err(IsolationError::InvalidConfig(
                "block_start must not exceed block_end".to_string(),
            ));
        }
        if self.host_start == 0 || self.host_end == 255 || self.host_start > self.host_end {
            return Err(IsolationError::InvalidConfig(
                "host range must lie within 1..=254".to_string(),
            ));
        }
        let last_port = usize::from(self.base_port) + self.capacity() - 1;
        if self.base_port == 0 || last_port > usize::from(u16::MAX) {
            return Err(IsolationError::InvalidConfig(format!(
                "port range {}..={} does not fit in 1..=65535",
                self.base_port, last_port
            )));
        }
        Ok(())
    }

    fn index_of(&self, address: Ipv4Addr) -> Option<usize> {
        let [a, b, block, host] = address.octets();
        if [a, b] != self.prefix
            || !(self.block_start..=self.block_end).contains(&block)
            || !(self.host_start..=self.host_end).contains(&host)
        {
            return None;
        }
        Some(
            usize::from(block - self.block_start) * self.hosts_per_block()
                + usize::from(host - self.host_start),
        )
    }

    fn lease_at(&self, index: usize) -> Lease {
        let per_block = self.hosts_per_block();
        // Both offsets are bounded by validate(), so the casts cannot truncate.
        let block = self.block_start + (index / per_block) as u8;
        let host = self.host_start + (index % per_block) as u8;
        Lease {
            address: Ipv4Addr::new(self.prefix[0], self.prefix[1], block, host),
            port: self.base_port + index as u16,
        }
    }
}

/// An address/port pair handed out by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub port: u16,
}

/// Mutable pool state. Callers serialize access.
#[derive(Debug)]
pub struct AddressPool {
    range: AddressRange,
    cursor: usize,
    in_use: HashSet<usize>,
}

impl AddressPool {
    pub fn new(range: AddressRange) -> IsolationResult<Self> {
        range.validate()?;
        Ok(Self {
            range,
            cursor: 0,
            in_use: HashSet::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.range.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Take the next free address at or after the cursor, wrapping once.
    pub fn acquire(&mut self) -> Option<Lease> {
        let capacity = self.capacity();
        let start = self.cursor % capacity;
        let index = (0..capacity)
            .map(|offset| (start + offset) % capacity)
            .find(|index| !self.in_use.contains(index))?;

        self.in_use.insert(index);
        self.cursor = index + 1;
        Some(self.range.lease_at(index))
    }

    /// Claim a specific address (used when recovering live runtimes).
    ///
    /// Returns `None` if the address is outside the range or already held.
    pub fn reserve(&mut self, address: Ipv4Addr) -> Option<Lease> {
        let index = self.range.index_of(address)?;
        if !self.in_use.insert(index) {
            return None;
        }
        if index + 1 > self.cursor {
            self.cursor = index + 1;
        }
        Some(self.range.lease_at(index))
    }

    /// Return an address to the pool.
    pub fn free(&mut self, address: Ipv4Addr) -> bool {
        self.range
            .index_of(address)
            .is_some_and(|index| self.in_use.remove(&index))
    }

    pub fn port_for(&self, address: Ipv4Addr) -> Option<u16> {
        self.range
            .index_of(address)
            .map(|index| self.range.lease_at(index).port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_range() -> AddressRange {
        AddressRange {
            prefix: [10, 89],
            block_start: 0,
            block_end: 1,
            host_start: 2,
            host_end: 4,
            base_port: 40000,
        }
    }

    #[test]
    fn allocates_within_block_then_advances() {
        let mut pool = AddressPool::new(small_range()).unwrap();
        let leases: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();

        assert_eq!(leases[0].address, Ipv4Addr::new(10, 89, 0, 2));
        assert_eq!(leases[2].address, Ipv4Addr::new(10, 89, 0, 4));
        assert_eq!(leases[3].address, Ipv4Addr::new(10, 89, 1, 2));
        assert_eq!(leases[3].port, 40003);
    }

    #[test]
    fn exhaustion_leaves_pool_intact() {
        let mut pool = AddressPool::new(small_range()).unwrap();
        let leases: Vec<_> = (0..6).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 6);

        assert!(pool.free(leases[1].address));
        let again = pool.acquire().unwrap();
        assert_eq!(again, leases[1]);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn wraps_around_after_last_block() {
        let mut pool = AddressPool::new(small_range()).unwrap();
        let first = pool.acquire().unwrap();
        for _ in 0..5 {
            pool.acquire().unwrap();
        }
        pool.free(first.address);
        assert_eq!(pool.acquire().unwrap(), first);
    }

    #[test]
    fn cursor_is_monotonic_after_free() {
        let mut pool = AddressPool::new(small_range()).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.free(a.address);
        let c = pool.acquire().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn reserve_rejects_duplicates_and_foreign_addresses() {
        let mut pool = AddressPool::new(small_range()).unwrap();
        let addr = Ipv4Addr::new(10, 89, 1, 3);
        assert_eq!(pool.reserve(addr).unwrap().port, 40004);
        assert!(pool.reserve(addr).is_none());
        assert!(pool.reserve(Ipv4Addr::new(10, 90, 0, 2)).is_none());
        assert!(pool.reserve(Ipv4Addr::new(10, 89, 0, 1)).is_none());

        // Next acquisition continues after the reserved address.
        assert_eq!(pool.acquire().unwrap().address, Ipv4Addr::new(10, 89, 1, 4));
    }

    #[test]
    fn rejects_port_overflow() {
        let range = AddressRange {
            base_port: 65500,
            ..small_range()
        };
        assert!(AddressPool::new(range).is_ok());

        let range = AddressRange {
            block_end: 200,
            base_port: 65000,
            ..small_range()
        };
        assert!(matches!(
            AddressPool::new(range),
            Err(IsolationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn parses_prefix() {
        assert_eq!(AddressRange::parse_prefix("10.89").unwrap(), [10, 89]);
        assert!(AddressRange::parse_prefix("10").is_err());
        assert!(AddressRange::parse_prefix("10.89.1").is_err());
        assert!(AddressRange::parse_prefix("10.300").is_err());
    }
}

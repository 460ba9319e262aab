//! Tenant subnet allocator
//!
//! Hands out /24 blocks from a fixed /16 (`10.<base>.0.0/16`), restricted to
//! an inclusive third-octet window. Operates on a snapshot of the subnets
//! already in use, so it holds no state of its own.

use crate::config::PoolConfig;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Prefix length of every tenant subnet
pub const TENANT_PREFIX_LEN: u8 = 24;

/// First-fit allocator over the configured subnet pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetAllocator {
    base_octet: u8,
    min_octet: u8,
    max_octet: u8,
}

impl SubnetAllocator {
    /// Create an allocator for `10.<base_octet>.<min_octet..=max_octet>.0/24`
    pub fn new(base_octet: u8, min_octet: u8, max_octet: u8) -> Result<Self> {
        if min_octet > max_octet {
            return Err(Error::Config(format!(
                "subnet pool lower bound {} is above upper bound {}",
                min_octet, max_octet
            )));
        }
        Ok(Self {
            base_octet,
            min_octet,
            max_octet,
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(config.base_octet, config.min_octet, config.max_octet)
    }

    /// The /16 the pool lives in
    pub fn base_network(&self) -> Ipv4Net {
        Ipv4Net::new_assert(Ipv4Addr::new(10, self.base_octet, 0, 0), 16)
    }

    /// Number of tenant subnets the pool can hold
    pub fn capacity(&self) -> usize {
        usize::from(self.max_octet - self.min_octet) + 1
    }

    /// The /24 for a given third octet
    pub fn block(&self, octet: u8) -> Ipv4Net {
        Ipv4Net::new_assert(
            Ipv4Addr::new(10, self.base_octet, octet, 0),
            TENANT_PREFIX_LEN,
        )
    }

    /// Every block of the pool, lowest first
    pub fn blocks(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        (self.min_octet..=self.max_octet).map(move |octet| self.block(octet))
    }

    /// Whether `cidr` is one of the pool's blocks
    pub fn contains(&self, cidr: &Ipv4Net) -> bool {
        let octets = cidr.network().octets();
        cidr.prefix_len() == TENANT_PREFIX_LEN
            && octets[0] == 10
            && octets[1] == self.base_octet
            && octets[3] == 0
            && (self.min_octet..=self.max_octet).contains(&octets[2])
    }

    /// Pick the lowest free block
    ///
    /// Returns `SubnetPoolExhausted` when every block is in `used`.
    pub fn allocate(&self, used: &BTreeSet<Ipv4Net>) -> Result<Ipv4Net> {
        self.blocks()
            .find(|block| !used.contains(block))
            .ok_or(Error::SubnetPoolExhausted {
                base_octet: self.base_octet,
                min_octet: self.min_octet,
                max_octet: self.max_octet,
            })
    }

    /// Number of free blocks given the subnets in use
    pub fn available_count(&self, used: &BTreeSet<Ipv4Net>) -> usize {
        self.blocks().filter(|block| !used.contains(block)).count()
    }
}

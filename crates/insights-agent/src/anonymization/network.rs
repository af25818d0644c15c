// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid IPv4 network {0:?}")]
pub struct InvalidNetwork(pub String);

/// IPv4 network in CIDR form. The address is always the network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Network {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Network {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, InvalidNetwork> {
        if prefix > 32 {
            return Err(InvalidNetwork(format!("{addr}/{prefix}")));
        }
        let mask = prefix_to_mask(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_to_mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_to_mask(self.prefix) == u32::from(self.network)
    }
}

impl FromStr for Ipv4Network {
    type Err = InvalidNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| InvalidNetwork(s.to_string()))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| InvalidNetwork(s.to_string()))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| InvalidNetwork(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn prefix_to_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Returns the address following `ip` within the network described by `mask`.
///
/// When the increment leaves the network the result wraps back to the network address and the
/// second value is `true`.
pub fn get_next_ip(ip: Ipv4Addr, mask: Ipv4Addr) -> (Ipv4Addr, bool) {
    let ip = u32::from(ip);
    let mask = u32::from(mask);
    let next = ip.wrapping_add(1);
    if next & mask != ip & mask {
        return (Ipv4Addr::from(ip & mask), true);
    }
    (Ipv4Addr::from(next), false)
}

#[derive(Debug, Clone)]
struct Subnet {
    network: Ipv4Network,
    last_ip: Ipv4Addr,
}

/// Subnets with their cursors plus the table of already issued translations.
#[derive(Debug, Default)]
pub(crate) struct NetworkTranslator {
    subnets: Vec<Subnet>,
    translation_table: HashMap<Ipv4Addr, Ipv4Addr>,
}

impl NetworkTranslator {
    /// Builds the translator. Networks are ordered from the widest to the narrowest; equal
    /// prefixes keep their input order.
    pub(crate) fn new(mut networks: Vec<Ipv4Network>) -> Self {
        let mut seen = Vec::with_capacity(networks.len());
        networks.retain(|n| {
            if seen.contains(n) {
                false
            } else {
                seen.push(*n);
                true
            }
        });
        networks.sort_by_key(Ipv4Network::prefix);
        Self {
            subnets: networks
                .into_iter()
                .map(|network| Subnet {
                    network,
                    last_ip: network.network(),
                })
                .collect(),
            translation_table: HashMap::new(),
        }
    }

    pub(crate) fn networks(&self) -> Vec<Ipv4Network> {
        self.subnets.iter().map(|s| s.network).collect()
    }

    /// Maps an address to its synthetic counterpart. Addresses outside every known subnet map
    /// to `0.0.0.0` and are not remembered.
    pub(crate) fn translate(&mut self, ip: Ipv4Addr) -> Ipv4Addr {
        if let Some(translated) = self.translation_table.get(&ip) {
            return *translated;
        }
        // most specific subnet wins
        let index = self
            .subnets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.network.contains(ip))
            .max_by_key(|(i, s)| (s.network.prefix(), usize::MAX - i))
            .map(|(i, _)| i);
        match index {
            Some(index) => self.translate_in(index, ip),
            None => Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Issues the next address of the subnet at `index` for `ip`, without checking that the
    /// subnet contains it.
    pub(crate) fn translate_in(&mut self, index: usize, ip: Ipv4Addr) -> Ipv4Addr {
        let Some(subnet) = self.subnets.get_mut(index) else {
            return Ipv4Addr::UNSPECIFIED;
        };
        if ip == subnet.network.network() {
            return ip;
        }
        let (next, _overflow) = get_next_ip(subnet.last_ip, subnet.network.mask());
        subnet.last_ip = next;
        self.translation_table.insert(ip, next);
        next
    }

    pub(crate) fn table_len(&self) -> usize {
        self.translation_table.len()
    }

    pub(crate) fn table_snapshot(&self) -> BTreeMap<String, String> {
        self.translation_table
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub(crate) fn reset(&mut self) {
        self.translation_table.clear();
        for subnet in &mut self.subnets {
            subnet.last_ip = subnet.network.network();
        }
    }
}

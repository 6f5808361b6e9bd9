use crate::error::{PoolError, PoolResult};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address family as the kernel sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Kernel address-family constant (AF_INET / AF_INET6)
    pub fn kernel_af(self) -> u8 {
        match self {
            AddressFamily::V4 => 2,
            AddressFamily::V6 => 10,
        }
    }

    pub fn from_kernel_af(af: u8) -> Option<Self> {
        match af {
            2 => Some(AddressFamily::V4),
            10 => Some(AddressFamily::V6),
            _ => None,
        }
    }

    pub fn byte_len(self) -> usize {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }

    pub fn bit_width(self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }
}

/// Wire-ready form of a textual address: big-endian raw bytes plus the
/// numeric prefix length if the input carried a CIDR suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAddress {
    pub family: AddressFamily,
    pub bytes: Vec<u8>,
    pub prefix_len: Option<u8>,
}

impl EncodedAddress {
    /// Canonical textual form without the CIDR suffix. IPv6 renders fully
    /// expanded (zero-padded groups) so that re-encoding is stable and the
    /// random generator's output matches.
    pub fn canonical(&self) -> String {
        render_canonical(self.family, &self.bytes)
    }

    /// Canonical form with the `/prefix` suffix appended.
    /// Requires a prefix length.
    pub fn cidr(&self) -> PoolResult<String> {
        let prefix = self
            .prefix_len
            .ok_or_else(|| PoolError::MissingSubnetMask(self.canonical()))?;
        Ok(format!("{}/{}", self.canonical(), prefix))
    }

    /// Key used to correlate kernel address-change notifications with
    /// in-flight add operations. Requires a prefix length.
    pub fn key(&self) -> PoolResult<String> {
        let prefix = self
            .prefix_len
            .ok_or_else(|| PoolError::MissingSubnetMask(self.canonical()))?;
        Ok(address_key(&self.bytes, prefix))
    }
}

/// Lower-case hex of the raw bytes plus the prefix length, e.g.
/// `fe800000...0001/64`. Shared by the codec and the notification dispatch.
pub fn address_key(bytes: &[u8], prefix_len: u8) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 4);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out.push('/');
    out.push_str(&prefix_len.to_string());
    out
}

/// Parse a textual address with an optional `/n` CIDR suffix into its
/// wire-ready byte form. Classification is strict: anything that is neither
/// an IPv4 nor an IPv6 literal fails with `InvalidAddress`.
pub fn encode(text: &str) -> PoolResult<EncodedAddress> {
    let (addr_part, prefix_part) = match text.rsplit_once('/') {
        Some((addr, suffix)) => (addr, Some(suffix)),
        None => (text, None),
    };

    let prefix_len = match prefix_part {
        Some(suffix) => Some(
            suffix
                .parse::<u8>()
                .map_err(|_| PoolError::InvalidAddress(text.to_string()))?,
        ),
        None => None,
    };

    if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
        if let Some(p) = prefix_len {
            if p > 32 {
                return Err(PoolError::InvalidAddress(text.to_string()));
            }
        }
        return Ok(EncodedAddress {
            family: AddressFamily::V4,
            bytes: v4.octets().to_vec(),
            prefix_len,
        });
    }
    if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
        if let Some(p) = prefix_len {
            if p > 128 {
                return Err(PoolError::InvalidAddress(text.to_string()));
            }
        }
        return Ok(EncodedAddress {
            family: AddressFamily::V6,
            bytes: v6.octets().to_vec(),
            prefix_len,
        });
    }
    Err(PoolError::InvalidAddress(text.to_string()))
}

/// Render raw address bytes canonically for the given family.
pub fn render_canonical(family: AddressFamily, bytes: &[u8]) -> String {
    match family {
        AddressFamily::V4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ipv4Addr::from(octets).to_string()
        }
        AddressFamily::V6 => {
            let groups: Vec<String> = bytes
                .chunks(2)
                .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
                .collect();
            groups.join(":")
        }
    }
}

use crate::codec::{self, AddressFamily};
use crate::error::{PoolError, PoolResult};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::{Arc, Mutex};

type RandomBytesFn = dyn FnMut(&mut [u8]) + Send;

/// Uniform sampler of addresses inside a CIDR prefix.
///
/// The prefix bits are copied verbatim, everything after them is drawn from
/// the random-byte source. The byte straddling the prefix boundary is merged
/// bit-wise: high `prefix_len % 8` bits from the prefix, low bits random.
///
/// `addresses()` hands out independent, restartable, infinite iterators which
/// all draw from the same underlying random-byte source.
pub struct RandomAddressGenerator {
    family: AddressFamily,
    prefix_len: u8,
    prefix_whole: Vec<u8>,
    boundary_masked: u8,
    suffix_mask: u8,
    random_len: usize,
    random_bytes: Arc<Mutex<Box<RandomBytesFn>>>,
}

impl RandomAddressGenerator {
    /// Build a generator over `cidr` using the OS random number generator.
    /// Fails with `MissingSubnetMask` if `cidr` carries no prefix length.
    pub fn new(cidr: &str) -> PoolResult<Self> {
        Self::with_random_bytes(cidr, |buf: &mut [u8]| OsRng.fill_bytes(buf))
    }

    /// Same as [`new`](Self::new) but with an injectable random-byte source.
    /// The source is called exactly once per generated address, with a buffer
    /// of `address bytes − whole prefix bytes` length.
    pub fn with_random_bytes<F>(cidr: &str, random_bytes: F) -> PoolResult<Self>
    where
        F: FnMut(&mut [u8]) + Send + 'static,
    {
        let encoded = codec::encode(cidr)?;
        let prefix_len = encoded
            .prefix_len
            .ok_or_else(|| PoolError::MissingSubnetMask(cidr.to_string()))?;
        let total_bytes = encoded.family.byte_len();

        if prefix_len == encoded.family.bit_width() {
            // Full-width prefix: nothing to randomize, output is constant.
            return Ok(Self {
                family: encoded.family,
                prefix_len,
                prefix_whole: encoded.bytes,
                boundary_masked: 0,
                suffix_mask: 0,
                random_len: 0,
                random_bytes: Arc::new(Mutex::new(Box::new(random_bytes))),
            });
        }

        let boundary_idx = (prefix_len / 8) as usize;
        let remaining_bits = prefix_len % 8;
        // high `remaining_bits` bits belong to the prefix, the rest is random
        let prefix_mask: u8 = if remaining_bits == 0 {
            0
        } else {
            0xff << (8 - remaining_bits)
        };

        Ok(Self {
            family: encoded.family,
            prefix_len,
            prefix_whole: encoded.bytes[..boundary_idx].to_vec(),
            boundary_masked: encoded.bytes[boundary_idx] & prefix_mask,
            suffix_mask: !prefix_mask,
            random_len: total_bytes - boundary_idx,
            random_bytes: Arc::new(Mutex::new(Box::new(random_bytes))),
        })
    }

    /// A fresh infinite iterator of CIDR-suffixed address strings.
    pub fn addresses(&self) -> RandomSubnetAddresses {
        RandomSubnetAddresses {
            family: self.family,
            prefix_len: self.prefix_len,
            prefix_whole: self.prefix_whole.clone(),
            boundary_masked: self.boundary_masked,
            suffix_mask: self.suffix_mask,
            random_len: self.random_len,
            random_bytes: Arc::clone(&self.random_bytes),
        }
    }
}

/// Infinite lazy sequence of random addresses within one subnet.
pub struct RandomSubnetAddresses {
    family: AddressFamily,
    prefix_len: u8,
    prefix_whole: Vec<u8>,
    boundary_masked: u8,
    suffix_mask: u8,
    random_len: usize,
    random_bytes: Arc<Mutex<Box<RandomBytesFn>>>,
}

impl Iterator for RandomSubnetAddresses {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut address_bytes = self.prefix_whole.clone();
        if self.random_len > 0 {
            let mut buf = vec![0u8; self.random_len];
            {
                let mut fill = self
                    .random_bytes
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                fill(&mut buf);
            }
            // first random byte intersects with the last prefix byte
            buf[0] = self.boundary_masked | (buf[0] & self.suffix_mask);
            address_bytes.extend_from_slice(&buf);
        }
        Some(format!(
            "{}/{}",
            codec::render_canonical(self.family, &address_bytes),
            self.prefix_len
        ))
    }
}

//! Pooled rotation of OS-level local IP addresses for outbound connections.
//!
//! The pool assigns addresses to a network interface via netlink, waits for
//! duplicate address detection to clear them, hands them out to callers and
//! reclaims idle ones. Candidate addresses come from any address source, e.g.
//! the bundled random-within-subnet generator:
//!
//! ```no_run
//! use localaddr_agent::{InterfaceSpec, IpPool, PoolConfig, RandomAddressGenerator};
//! use std::time::Duration;
//!
//! # async fn run() -> localaddr_agent::PoolResult<()> {
//! let generator = RandomAddressGenerator::new("fe80:1234::/64")?;
//! let pool = IpPool::open(
//!     generator.addresses(),
//!     InterfaceSpec::Name("eth0".to_string()),
//!     PoolConfig::default(),
//! )
//! .await?;
//!
//! let addr = pool.acquire(Duration::from_secs(10)).await?;
//! // ... bind an outbound socket to addr.canonical ...
//! pool.release(&addr);
//! pool.drain_and_close().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod codec;
pub mod error;
pub mod netlink;
pub mod pool;
pub mod random;
pub mod source;
pub mod tracker;
pub mod transport;

pub use agent::{AddressLease, LocalAddrAgent};
pub use codec::{AddressFamily, EncodedAddress};
pub use error::{PoolError, PoolResult};
pub use netlink::NetlinkTransport;
pub use pool::{InterfaceSpec, IpPool, PoolAddress, PoolConfig, PoolCounts, ReusePolicy};
pub use random::RandomAddressGenerator;
pub use source::AddressSource;
pub use transport::{AddressChange, AddressTransport, InterfaceAddress};

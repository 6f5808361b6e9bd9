use crate::codec::AddressFamily;
use crate::error::{PoolError, PoolResult};
use crate::pool::{InterfaceSpec, IpPool, PoolAddress, PoolConfig, ReusePolicy};
use crate::random::RandomAddressGenerator;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

const DEFAULT_INTERFACE: &str = "eth0";
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection adapter that binds outbound TCP sockets to addresses acquired
/// from an [`IpPool`], so each connection can originate from a different
/// local address. TLS is layered above by the caller.
pub struct LocalAddrAgent {
    pool: IpPool,
    acquire_timeout: Duration,
}

impl LocalAddrAgent {
    pub fn new(pool: IpPool, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    /// Build an agent from environment variables, or `None` when
    /// `LOCALADDR_RANGE` is unset/empty.
    ///
    /// - `LOCALADDR_RANGE`: CIDR range to draw random source addresses from
    /// - `LOCALADDR_INTERFACE`: interface to assign them on (default: eth0)
    ///
    /// No signal handlers are installed; the caller owns shutdown and should
    /// call [`shutdown`](Self::shutdown) on exit.
    pub async fn from_env() -> PoolResult<Option<Self>> {
        let range = match std::env::var("LOCALADDR_RANGE") {
            Ok(range) if !range.is_empty() => range,
            _ => return Ok(None),
        };
        let iface = std::env::var("LOCALADDR_INTERFACE")
            .unwrap_or_else(|_| DEFAULT_INTERFACE.to_string());

        tracing::debug!(
            "assigning random addresses from {} to {} for outbound connections",
            range,
            iface
        );
        let generator = RandomAddressGenerator::new(&range)?;
        let pool = IpPool::open(
            generator.addresses(),
            InterfaceSpec::Name(iface),
            PoolConfig::default(),
        )
        .await?;
        Ok(Some(Self::new(pool, DEFAULT_ACQUIRE_TIMEOUT)))
    }

    /// Open a TCP connection to `remote`, bound to an acquired local address.
    /// The returned lease settles the address (release or destroy, per the
    /// pool's reuse policy) when closed.
    pub async fn connect(&self, remote: SocketAddr) -> PoolResult<(TcpStream, AddressLease)> {
        let addr = self.pool.acquire(self.acquire_timeout).await?;
        match self.bind_and_connect(&addr, remote).await {
            Ok(stream) => {
                let lease = AddressLease {
                    pool: self.pool.clone(),
                    addr: Some(addr),
                };
                Ok((stream, lease))
            }
            Err(e) => {
                // settle the borrow before surfacing the connect failure
                match self.pool.reuse_policy() {
                    ReusePolicy::Release => self.pool.release(&addr),
                    ReusePolicy::Destroy => {
                        if let Err(destroy_err) = self.pool.destroy(&addr).await {
                            tracing::warn!(
                                "failed to destroy {} after connect error: {}",
                                addr.canonical,
                                destroy_err
                            );
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn bind_and_connect(
        &self,
        local: &PoolAddress,
        remote: SocketAddr,
    ) -> PoolResult<TcpStream> {
        let local_ip = local_ip(local);
        let socket = match (local.family(), remote) {
            (AddressFamily::V4, SocketAddr::V4(_)) => TcpSocket::new_v4()?,
            (AddressFamily::V6, SocketAddr::V6(_)) => TcpSocket::new_v6()?,
            _ => {
                return Err(PoolError::InvalidAddress(format!(
                    "local address {} does not match remote {} family",
                    local.canonical, remote
                )))
            }
        };
        socket.bind(SocketAddr::new(local_ip, 0))?;
        let stream = socket.connect(remote).await?;
        Ok(stream)
    }

    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    /// Drain and close the underlying pool. Idempotent.
    pub async fn shutdown(&self) {
        self.pool.drain_and_close().await;
    }
}

/// Borrow of one pool address for the lifetime of a connection.
///
/// `close()` settles the address explicitly. If the lease is dropped instead,
/// the address is released back to the pool best-effort (a `Destroy` policy
/// needs the async `close()` to take effect; on drop it degrades to release).
pub struct AddressLease {
    pool: IpPool,
    addr: Option<PoolAddress>,
}

impl AddressLease {
    /// The leased address, until the lease has been settled.
    pub fn address(&self) -> Option<&PoolAddress> {
        self.addr.as_ref()
    }

    /// Settle the lease per the pool's reuse policy.
    pub async fn close(&mut self) -> PoolResult<()> {
        let Some(addr) = self.addr.take() else {
            return Ok(());
        };
        match self.pool.reuse_policy() {
            ReusePolicy::Release => {
                self.pool.release(&addr);
                Ok(())
            }
            ReusePolicy::Destroy => self.pool.destroy(&addr).await,
        }
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        if let Some(addr) = self.addr.take() {
            tracing::warn!(
                "address lease for {} dropped without close(), releasing",
                addr.canonical
            );
            self.pool.release(&addr);
        }
    }
}

fn local_ip(addr: &PoolAddress) -> IpAddr {
    match addr.family() {
        AddressFamily::V4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&addr.encoded.bytes);
            IpAddr::V4(octets.into())
        }
        AddressFamily::V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr.encoded.bytes);
            IpAddr::V6(octets.into())
        }
    }
}

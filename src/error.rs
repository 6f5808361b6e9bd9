use std::fmt;

/// Error type for all address pool, codec and transport operations.
#[derive(Debug)]
pub enum PoolError {
    /// Input could not be parsed as an IPv4/IPv6 address (with optional CIDR suffix)
    InvalidAddress(String),
    /// A CIDR prefix length was required but absent
    MissingSubnetMask(String),
    /// The candidate address source has no more addresses to hand out
    SourceExhausted,
    /// The address is already assigned to the interface
    AlreadyExists(String),
    /// The kernel never reported the address as non-tentative in time
    TentativeTimeout(String),
    /// No pool address became available within the acquire timeout
    AcquireTimeout,
    /// The address is not tracked by the pool
    UnknownAddress(String),
    /// Resource not found (interface, address, ...)
    NotFound(String),
    /// The pool has been drained and closed
    PoolClosed,
    /// Input validation failed
    Validation(String),
    /// Netlink operation failed
    Netlink(rtnetlink::Error),
    /// Generic transport failure
    Transport(String),
    /// System I/O error
    Io(std::io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidAddress(addr) => {
                write!(f, "invalid/unsupported address: {}", addr)
            }
            PoolError::MissingSubnetMask(addr) => {
                write!(f, "address must carry a subnet mask: {}", addr)
            }
            PoolError::SourceExhausted => {
                write!(f, "address source ended, cannot assign a new address")
            }
            PoolError::AlreadyExists(addr) => write!(f, "address already exists: {}", addr),
            PoolError::TentativeTimeout(addr) => {
                write!(f, "timeout waiting for address to leave tentative state: {}", addr)
            }
            PoolError::AcquireTimeout => write!(f, "timeout acquiring an address from the pool"),
            PoolError::UnknownAddress(addr) => {
                write!(f, "address doesn't seem to be in the pool: {}", addr)
            }
            PoolError::NotFound(what) => write!(f, "not found: {}", what),
            PoolError::PoolClosed => write!(f, "pool has been closed"),
            PoolError::Validation(msg) => write!(f, "validation error: {}", msg),
            PoolError::Netlink(e) => write!(f, "netlink error: {}", e),
            PoolError::Transport(msg) => write!(f, "transport error: {}", msg),
            PoolError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<rtnetlink::Error> for PoolError {
    fn from(e: rtnetlink::Error) -> Self {
        PoolError::Netlink(e)
    }
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(e)
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

use crate::codec::{AddressFamily, EncodedAddress};
use crate::error::PoolResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One address as reported by an address dump.
#[derive(Debug, Clone)]
pub struct InterfaceAddress {
    pub index: u32,
    /// Interface label, where the kernel reports one (IPv4 addresses mostly)
    pub label: Option<String>,
    pub family: AddressFamily,
    pub bytes: Vec<u8>,
    pub prefix_len: u8,
    pub tentative: bool,
}

/// One kernel address-change notification (RTM_NEWADDR / RTM_DELADDR).
#[derive(Debug, Clone)]
pub struct AddressChange {
    pub index: u32,
    pub family: AddressFamily,
    pub bytes: Vec<u8>,
    pub prefix_len: u8,
    pub tentative: bool,
}

/// Kernel network-configuration boundary: list, add and remove addresses on
/// an interface, and stream address-change notifications.
///
/// The production implementation is [`NetlinkTransport`](crate::netlink::NetlinkTransport);
/// tests substitute a scripted mock.
#[async_trait]
pub trait AddressTransport: Send + Sync + 'static {
    /// Dump all configured addresses on the host.
    async fn list_addresses(&self) -> PoolResult<Vec<InterfaceAddress>>;

    /// Assign an address to the interface. Not idempotent: assigning an
    /// already-present address fails with `AlreadyExists`.
    async fn add_address(&self, encoded: &EncodedAddress, iface_index: u32) -> PoolResult<()>;

    /// Unassign an address from the interface. Not idempotent: removing an
    /// absent address fails with `NotFound`.
    async fn remove_address(&self, encoded: &EncodedAddress, iface_index: u32) -> PoolResult<()>;

    /// Subscribe to address-change notifications. The subscription lasts
    /// until the receiver is dropped.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AddressChange>;
}

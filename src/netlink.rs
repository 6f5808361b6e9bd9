use crate::codec::{AddressFamily, EncodedAddress};
use crate::error::{PoolError, PoolResult};
use crate::transport::{AddressChange, AddressTransport, InterfaceAddress};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::constants::IFA_F_TENTATIVE;
use netlink_packet_route::{AddressMessage, RtnlMessage};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR};
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;

const TENTATIVE_FLAG: u32 = IFA_F_TENTATIVE as u32;

/// Persistent netlink transport wrapping rtnetlink for all address operations.
/// One instance per pool, reused across all add/remove/list round-trips.
///
/// The underlying socket joins the IPv4/IPv6 ifaddr multicast groups; a
/// forwarding task decodes RTM_NEWADDR/RTM_DELADDR into [`AddressChange`]s and
/// fans them out to every live subscriber.
pub struct NetlinkTransport {
    handle: rtnetlink::Handle,
    subscribers: std::sync::Arc<Mutex<Vec<mpsc::UnboundedSender<AddressChange>>>>,
    // Keep the connection and forwarding tasks alive
    _conn_task: tokio::task::JoinHandle<()>,
    _forward_task: tokio::task::JoinHandle<()>,
}

impl NetlinkTransport {
    /// Create a transport with a persistent connection, subscribed to
    /// address-change multicast groups.
    pub fn new() -> PoolResult<Self> {
        let (mut conn, handle, mut messages) = rtnetlink::new_connection()?;

        let groups = RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;
        let group_addr = SocketAddr::new(0, groups);
        conn.socket_mut().socket_mut().bind(&group_addr)?;

        let conn_task = tokio::spawn(conn);

        let subscribers: std::sync::Arc<Mutex<Vec<mpsc::UnboundedSender<AddressChange>>>> =
            std::sync::Arc::new(Mutex::new(Vec::new()));
        let fanout = std::sync::Arc::clone(&subscribers);
        let forward_task = tokio::spawn(async move {
            while let Some((message, _addr)) = messages.next().await {
                let msg = match message.payload {
                    NetlinkPayload::InnerMessage(RtnlMessage::NewAddress(msg))
                    | NetlinkPayload::InnerMessage(RtnlMessage::DelAddress(msg)) => msg,
                    _ => continue,
                };
                let Some(change) = decode_change(&msg) else {
                    continue;
                };
                tracing::trace!(
                    "address change on iface {}: {:02x?}/{} tentative={}",
                    change.index,
                    change.bytes,
                    change.prefix_len,
                    change.tentative
                );
                let mut subs = fanout.lock().unwrap_or_else(|p| p.into_inner());
                subs.retain(|tx| tx.send(change.clone()).is_ok());
            }
        });

        Ok(Self {
            handle,
            subscribers,
            _conn_task: conn_task,
            _forward_task: forward_task,
        })
    }
}

#[async_trait]
impl AddressTransport for NetlinkTransport {
    async fn list_addresses(&self) -> PoolResult<Vec<InterfaceAddress>> {
        let mut dump = self.handle.address().get().execute();
        let mut out = Vec::new();
        while let Some(msg) = dump.try_next().await.map_err(PoolError::Netlink)? {
            if let Some(addr) = decode_interface_address(&msg) {
                out.push(addr);
            }
        }
        Ok(out)
    }

    async fn add_address(&self, encoded: &EncodedAddress, iface_index: u32) -> PoolResult<()> {
        let prefix_len = encoded
            .prefix_len
            .ok_or_else(|| PoolError::MissingSubnetMask(encoded.canonical()))?;
        let ip = to_ip_addr(encoded);

        tracing::debug!("adding address {}/{} to iface {}", ip, prefix_len, iface_index);
        self.handle
            .address()
            .add(iface_index, ip, prefix_len)
            .execute()
            .await
            .map_err(|e| {
                if e.to_string().contains("File exists") {
                    PoolError::AlreadyExists(encoded.canonical())
                } else {
                    PoolError::Netlink(e)
                }
            })
    }

    async fn remove_address(&self, encoded: &EncodedAddress, iface_index: u32) -> PoolResult<()> {
        let prefix_len = encoded
            .prefix_len
            .ok_or_else(|| PoolError::MissingSubnetMask(encoded.canonical()))?;

        let mut msg = AddressMessage::default();
        msg.header.family = encoded.family.kernel_af();
        msg.header.prefix_len = prefix_len;
        msg.header.index = iface_index;
        msg.nlas.push(AddressNla::Address(encoded.bytes.clone()));
        if encoded.family == AddressFamily::V4 {
            // the kernel matches IPv4 deletions on IFA_LOCAL
            msg.nlas.push(AddressNla::Local(encoded.bytes.clone()));
        }

        tracing::debug!(
            "deleting address {}/{} from iface {}",
            encoded.canonical(),
            prefix_len,
            iface_index
        );
        match self.handle.address().del(msg).execute().await {
            Ok(()) => Ok(()),
            Err(e)
                if e.to_string().contains("Cannot assign requested address")
                    || e.to_string().contains("No such") =>
            {
                Err(PoolError::NotFound(encoded.canonical()))
            }
            Err(e) => Err(PoolError::Netlink(e)),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AddressChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }
}

fn to_ip_addr(encoded: &EncodedAddress) -> IpAddr {
    match encoded.family {
        AddressFamily::V4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&encoded.bytes);
            IpAddr::V4(octets.into())
        }
        AddressFamily::V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&encoded.bytes);
            IpAddr::V6(octets.into())
        }
    }
}

fn address_bytes(msg: &AddressMessage) -> Option<Vec<u8>> {
    let mut local = None;
    for nla in &msg.nlas {
        match nla {
            AddressNla::Address(bytes) => return Some(bytes.clone()),
            AddressNla::Local(bytes) => local = Some(bytes.clone()),
            _ => {}
        }
    }
    local
}

fn extended_flags(msg: &AddressMessage) -> u32 {
    // IFA_FLAGS supersedes the 8-bit header flags when present
    for nla in &msg.nlas {
        if let AddressNla::Flags(flags) = nla {
            return *flags;
        }
    }
    msg.header.flags as u32
}

fn decode_change(msg: &AddressMessage) -> Option<AddressChange> {
    let family = AddressFamily::from_kernel_af(msg.header.family)?;
    let bytes = address_bytes(msg)?;
    if bytes.len() != family.byte_len() {
        return None;
    }
    Some(AddressChange {
        index: msg.header.index,
        family,
        bytes,
        prefix_len: msg.header.prefix_len,
        tentative: extended_flags(msg) & TENTATIVE_FLAG != 0,
    })
}

fn decode_interface_address(msg: &AddressMessage) -> Option<InterfaceAddress> {
    let change = decode_change(msg)?;
    let label = msg.nlas.iter().find_map(|nla| match nla {
        AddressNla::Label(label) => Some(label.clone()),
        _ => None,
    });
    Some(InterfaceAddress {
        index: change.index,
        label,
        family: change.family,
        bytes: change.bytes,
        prefix_len: change.prefix_len,
        tentative: change.tentative,
    })
}

use crate::codec::{self, AddressFamily, EncodedAddress};
use crate::error::{PoolError, PoolResult};
use crate::netlink::NetlinkTransport;
use crate::source::AddressSource;
use crate::tracker::TentativeTracker;
use crate::transport::AddressTransport;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

/// What happens to an address when its connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Return the address to the available set, keeping it assigned to the
    /// interface.
    Release,
    /// Unassign the address from the interface.
    Destroy,
}

/// Pool configuration.
///
/// `min_addresses` is not pre-warmed: addresses are assigned lazily on first
/// demand, but once that many exist the eviction timer never reclaims below
/// it. `max_addresses` bounds the total assigned; at the bound, `acquire`
/// blocks instead of assigning more.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Adopt an address that is already assigned to the interface instead of
    /// failing the create
    pub use_existing_addresses: bool,
    /// How long to wait for duplicate address detection to clear a freshly
    /// added address
    pub address_assign_timeout: Duration,
    /// Per-address timeout for the netlink remove round-trip
    pub address_remove_timeout: Duration,
    pub min_addresses: usize,
    pub max_addresses: usize,
    /// Available (non-borrowed) addresses idle longer than this are evicted
    pub address_max_idle_time: Duration,
    /// Eviction timer period
    pub remove_addresses_every: Duration,
    /// Policy applied by connection adapters when a socket closes
    pub reuse_policy: ReusePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            use_existing_addresses: true,
            address_assign_timeout: Duration::from_secs(5),
            address_remove_timeout: Duration::from_secs(1),
            min_addresses: 10,
            max_addresses: 50,
            address_max_idle_time: Duration::from_secs(10 * 60),
            remove_addresses_every: Duration::from_secs(10),
            reuse_policy: ReusePolicy::Release,
        }
    }
}

/// The interface to assign addresses on: an OS ifindex, or an interface name
/// resolved by scanning configured addresses for a matching label (first
/// match wins).
#[derive(Debug, Clone)]
pub enum InterfaceSpec {
    Index(u32),
    Name(String),
}

/// One address currently assigned to the interface and tracked by the pool.
#[derive(Debug, Clone)]
pub struct PoolAddress {
    pub canonical: String,
    pub encoded: EncodedAddress,
}

impl PoolAddress {
    pub fn family(&self) -> AddressFamily {
        self.encoded.family
    }
}

/// Snapshot of the pool's bookkeeping counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub available: usize,
    pub borrowed: usize,
    pub pending_create: usize,
    pub pending_destroy: usize,
}

struct IdleEntry {
    addr: PoolAddress,
    idle_since: Instant,
}

#[derive(Default)]
struct State {
    /// Released/created addresses, oldest-idle at the front
    available: VecDeque<IdleEntry>,
    /// Borrowed addresses keyed by canonical form
    borrowed: HashMap<String, PoolAddress>,
    pending_create: usize,
}

struct Shared {
    cfg: PoolConfig,
    iface_index: u32,
    transport: Arc<dyn AddressTransport>,
    tracker: TentativeTracker,
    source: tokio::sync::Mutex<Box<dyn AddressSource>>,
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
    pending_destroy: AtomicUsize,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Bounded pool of OS-level local addresses assigned to one interface.
///
/// Acquired addresses are borrowed until released or destroyed; releasing
/// keeps the address assigned for reuse, destroying unassigns it. New
/// addresses are pulled from the address source one candidate per create,
/// netlink-added and held back until duplicate address detection clears them.
pub struct IpPool {
    shared: Arc<Shared>,
}

impl Clone for IpPool {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl IpPool {
    /// Create a pool over an explicit transport. Resolves the interface once,
    /// subscribes to address-change notifications and starts the eviction
    /// timer. No addresses are assigned until the first `acquire`.
    pub async fn new<S: AddressSource>(
        source: S,
        iface: InterfaceSpec,
        cfg: PoolConfig,
        transport: Arc<dyn AddressTransport>,
    ) -> PoolResult<IpPool> {
        if cfg.max_addresses == 0 || cfg.min_addresses > cfg.max_addresses {
            return Err(PoolError::Validation(format!(
                "invalid capacity bounds: min={} max={}",
                cfg.min_addresses, cfg.max_addresses
            )));
        }

        let iface_index = resolve_interface(transport.as_ref(), &iface).await?;
        let tracker = TentativeTracker::new(iface_index);
        let dispatch = tracker.spawn_dispatch(transport.subscribe());

        let shared = Arc::new(Shared {
            cfg,
            iface_index,
            transport,
            tracker,
            source: tokio::sync::Mutex::new(Box::new(source)),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            pending_destroy: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let eviction = spawn_eviction_timer(&shared);
        {
            let mut tasks = lock(&shared.tasks);
            tasks.push(dispatch);
            tasks.push(eviction);
        }

        Ok(IpPool { shared })
    }

    /// Create a pool backed by a fresh [`NetlinkTransport`].
    pub async fn open<S: AddressSource>(
        source: S,
        iface: InterfaceSpec,
        cfg: PoolConfig,
    ) -> PoolResult<IpPool> {
        let transport = Arc::new(NetlinkTransport::new()?);
        Self::new(source, iface, cfg, transport).await
    }

    /// Borrow an available address. With none free and capacity to spare this
    /// assigns a new one; at `max_addresses` it blocks until an address is
    /// released or destroyed, failing with `AcquireTimeout` once `timeout`
    /// elapses. Create failures surface here, the failed candidate is
    /// discarded and never retried.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<PoolAddress> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(PoolError::PoolClosed);
            }

            enum Plan {
                Borrowed(PoolAddress),
                Create,
                Wait,
            }
            let plan = {
                let mut st = lock(&self.shared.state);
                if let Some(entry) = st.available.pop_front() {
                    st.borrowed
                        .insert(entry.addr.canonical.clone(), entry.addr.clone());
                    Plan::Borrowed(entry.addr)
                } else if st.available.len() + st.borrowed.len() + st.pending_create
                    < self.shared.cfg.max_addresses
                {
                    st.pending_create += 1;
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Borrowed(addr) => return Ok(addr),
                Plan::Create => {
                    // The create runs as its own task so bookkeeping completes
                    // even if this acquire future is dropped mid-flight; its
                    // result still surfaces to this caller.
                    let shared = Arc::clone(&self.shared);
                    let handle = tokio::spawn(async move { shared.create_one().await });
                    match handle.await {
                        Ok(Ok(())) => continue, // fresh address parked in the available set
                        Ok(Err(e)) => return Err(e),
                        Err(join_err) => {
                            return Err(PoolError::Transport(format!(
                                "create task failed: {}",
                                join_err
                            )))
                        }
                    }
                }
                Plan::Wait => {
                    let notified = self.shared.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // a close between the loop-top check and enable() has
                    // already fired its wakeup; don't sleep through it
                    if self.shared.closed.load(Ordering::SeqCst) {
                        return Err(PoolError::PoolClosed);
                    }
                    if Instant::now() >= deadline {
                        return Err(PoolError::AcquireTimeout);
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(PoolError::AcquireTimeout);
                        }
                    }
                }
            }
        }
    }

    /// Return a borrowed address to the available set without unassigning it
    /// from the interface. Unknown addresses are logged and ignored.
    pub fn release(&self, addr: &PoolAddress) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut st = lock(&self.shared.state);
        match st.borrowed.remove(&addr.canonical) {
            Some(tracked) => {
                st.available.push_back(IdleEntry {
                    addr: tracked,
                    idle_since: Instant::now(),
                });
                drop(st);
                self.shared.notify.notify_one();
            }
            None => {
                tracing::warn!("release of address not borrowed from this pool: {}", addr.canonical);
            }
        }
    }

    /// Remove an address from the pool and unassign it from the interface.
    /// "Already gone" at the OS level counts as success. Other transport
    /// failures are returned, but the address is dropped from the live table
    /// regardless so it cannot leak back into circulation.
    pub async fn destroy(&self, addr: &PoolAddress) -> PoolResult<()> {
        let tracked = {
            let mut st = lock(&self.shared.state);
            st.borrowed.remove(&addr.canonical).or_else(|| {
                st.available
                    .iter()
                    .position(|e| e.addr.canonical == addr.canonical)
                    .and_then(|i| st.available.remove(i))
                    .map(|e| e.addr)
            })
        };
        let Some(tracked) = tracked else {
            return Err(PoolError::UnknownAddress(addr.canonical.clone()));
        };
        self.shared.notify.notify_one();
        self.shared.remove_from_os(&tracked).await
    }

    /// Stop new acquisitions, best-effort unassign every tracked address,
    /// drop the notification subscription and cancel all timers. Idempotent.
    pub async fn drain_and_close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.shared.tasks).drain(..) {
            task.abort();
        }
        self.shared.notify.notify_waiters();

        let tracked: Vec<PoolAddress> = {
            let mut st = lock(&self.shared.state);
            let mut all: Vec<PoolAddress> =
                st.available.drain(..).map(|e| e.addr).collect();
            all.extend(st.borrowed.drain().map(|(_, a)| a));
            all
        };
        tracing::debug!("draining {} addresses from the pool", tracked.len());
        for addr in tracked {
            if let Err(e) = self.shared.remove_from_os(&addr).await {
                tracing::warn!("failed to remove {} while draining: {}", addr.canonical, e);
            }
        }
    }

    /// Current bookkeeping counters.
    pub fn counts(&self) -> PoolCounts {
        let st = lock(&self.shared.state);
        PoolCounts {
            available: st.available.len(),
            borrowed: st.borrowed.len(),
            pending_create: st.pending_create,
            pending_destroy: self.shared.pending_destroy.load(Ordering::SeqCst),
        }
    }

    /// The resolved OS interface index this pool assigns addresses on.
    pub fn interface_index(&self) -> u32 {
        self.shared.iface_index
    }

    /// The reuse policy connection adapters should apply on socket close.
    pub fn reuse_policy(&self) -> ReusePolicy {
        self.shared.cfg.reuse_policy
    }
}

impl Shared {
    /// Assign one fresh candidate and park it in the available set.
    /// Always settles the `pending_create` counter it was charged with.
    async fn create_one(&self) -> PoolResult<()> {
        let result = self.assign_next_candidate().await;
        let parked = {
            let mut st = lock(&self.state);
            st.pending_create -= 1;
            match result {
                Ok(addr) if !self.closed.load(Ordering::SeqCst) => {
                    st.available.push_back(IdleEntry {
                        addr,
                        idle_since: Instant::now(),
                    });
                    Ok(None)
                }
                Ok(addr) => Ok(Some(addr)), // pool closed mid-create
                Err(e) => Err(e),
            }
        };
        self.notify.notify_one();
        match parked {
            Ok(None) => Ok(()),
            Ok(Some(orphan)) => {
                // the drain already ran; don't leave the address assigned
                if let Err(e) = self.remove_from_os(&orphan).await {
                    tracing::warn!(
                        "failed to remove {} created during close: {}",
                        orphan.canonical,
                        e
                    );
                }
                Err(PoolError::PoolClosed)
            }
            Err(e) => Err(e),
        }
    }

    /// Pull exactly one candidate, netlink-add it and wait for DAD clearance.
    async fn assign_next_candidate(&self) -> PoolResult<PoolAddress> {
        let candidate = {
            let mut source = self.source.lock().await;
            source
                .next_candidate()
                .await
                .ok_or(PoolError::SourceExhausted)?
        };

        let encoded = codec::encode(&candidate)?;
        let key = encoded.key()?;
        let canonical = encoded.canonical();

        {
            // the address table must never hold duplicate keys
            let st = lock(&self.state);
            if st.borrowed.contains_key(&canonical)
                || st.available.iter().any(|e| e.addr.canonical == canonical)
            {
                return Err(PoolError::AlreadyExists(canonical));
            }
        }

        // register before the add so the clearance notification cannot be missed
        let waiter = self.tracker.register(key)?;
        match self
            .transport
            .add_address(&encoded, self.iface_index)
            .await
        {
            Ok(()) => {
                waiter
                    .wait(self.cfg.address_assign_timeout, &canonical)
                    .await?;
            }
            Err(PoolError::AlreadyExists(_)) if self.cfg.use_existing_addresses => {
                tracing::debug!("adopting already-assigned address {}", canonical);
                drop(waiter);
            }
            Err(e) => return Err(e),
        }

        Ok(PoolAddress { canonical, encoded })
    }

    /// Unassign an address, treating "already gone" as success. The caller
    /// has already removed it from the live table.
    async fn remove_from_os(&self, addr: &PoolAddress) -> PoolResult<()> {
        self.pending_destroy.fetch_add(1, Ordering::SeqCst);
        let result = tokio::time::timeout(
            self.cfg.address_remove_timeout,
            self.transport.remove_address(&addr.encoded, self.iface_index),
        )
        .await;
        self.pending_destroy.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(PoolError::NotFound(_))) => Ok(()), // already unassigned
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::Transport(format!(
                "timed out removing address {}",
                addr.canonical
            ))),
        }
    }

    /// Destroy available addresses idle beyond the configured threshold,
    /// never shrinking the pool below `min_addresses`.
    async fn evict_idle(&self) {
        let victims = {
            let mut st = lock(&self.state);
            let mut victims = Vec::new();
            while let Some(front) = st.available.front() {
                if st.available.len() + st.borrowed.len() <= self.cfg.min_addresses {
                    break;
                }
                if front.idle_since.elapsed() < self.cfg.address_max_idle_time {
                    break;
                }
                if let Some(entry) = st.available.pop_front() {
                    victims.push(entry.addr);
                }
            }
            victims
        };
        for addr in victims {
            tracing::debug!("evicting idle address {}", addr.canonical);
            if let Err(e) = self.remove_from_os(&addr).await {
                tracing::warn!("failed to remove idle address {}: {}", addr.canonical, e);
            }
            self.notify.notify_one();
        }
    }
}

fn spawn_eviction_timer(shared: &Arc<Shared>) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let period = shared.cfg.remove_addresses_every;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            shared.evict_idle().await;
        }
    })
}

async fn resolve_interface(
    transport: &dyn AddressTransport,
    iface: &InterfaceSpec,
) -> PoolResult<u32> {
    match iface {
        InterfaceSpec::Index(index) => Ok(*index),
        InterfaceSpec::Name(name) => {
            // no dedicated lookup on the transport; scan address labels,
            // first match wins
            for addr in transport.list_addresses().await? {
                if addr.label.as_deref() == Some(name.as_str()) {
                    return Ok(addr.index);
                }
            }
            Err(PoolError::NotFound(format!("interface \"{}\"", name)))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

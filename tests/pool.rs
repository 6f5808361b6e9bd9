//! Address lifecycle pool tests against a scripted in-memory transport.

use async_trait::async_trait;
use localaddr_agent::{
    codec, AddressChange, AddressTransport, EncodedAddress, InterfaceAddress, InterfaceSpec,
    IpPool, LocalAddrAgent, PoolConfig, PoolError, PoolResult, ReusePolicy,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const IFACE: u32 = 7;

#[derive(Default)]
struct MockState {
    assigned: HashSet<String>,
    adds: Vec<String>,
    removes: Vec<String>,
    subscribers: Vec<mpsc::UnboundedSender<AddressChange>>,
}

/// In-memory stand-in for the netlink transport. Assignments live in a set
/// keyed like the tracker keys addresses; on add it can emit the
/// non-tentative notification the kernel would send once DAD clears.
struct MockTransport {
    state: Mutex<MockState>,
    emit_clearance: bool,
    listed: Vec<InterfaceAddress>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            emit_clearance: true,
            listed: Vec::new(),
        })
    }

    fn without_clearance() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            emit_clearance: false,
            listed: Vec::new(),
        })
    }

    fn with_listed(listed: Vec<InterfaceAddress>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            emit_clearance: true,
            listed,
        })
    }

    fn preassign(&self, cidr: &str) {
        let encoded = codec::encode(cidr).unwrap();
        self.state
            .lock()
            .unwrap()
            .assigned
            .insert(encoded.key().unwrap());
    }

    fn adds(&self) -> Vec<String> {
        self.state.lock().unwrap().adds.clone()
    }

    fn removes(&self) -> Vec<String> {
        self.state.lock().unwrap().removes.clone()
    }
}

#[async_trait]
impl AddressTransport for MockTransport {
    async fn list_addresses(&self) -> PoolResult<Vec<InterfaceAddress>> {
        Ok(self.listed.clone())
    }

    async fn add_address(&self, encoded: &EncodedAddress, iface_index: u32) -> PoolResult<()> {
        assert_eq!(iface_index, IFACE);
        let key = encoded.key().unwrap();
        let mut state = self.state.lock().unwrap();
        if !state.assigned.insert(key) {
            return Err(PoolError::AlreadyExists(encoded.canonical()));
        }
        state.adds.push(encoded.canonical());
        if self.emit_clearance {
            let change = AddressChange {
                index: IFACE,
                family: encoded.family,
                bytes: encoded.bytes.clone(),
                prefix_len: encoded.prefix_len.unwrap(),
                tentative: false,
            };
            state.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        }
        Ok(())
    }

    async fn remove_address(&self, encoded: &EncodedAddress, iface_index: u32) -> PoolResult<()> {
        assert_eq!(iface_index, IFACE);
        let key = encoded.key().unwrap();
        let mut state = self.state.lock().unwrap();
        if !state.assigned.remove(&key) {
            return Err(PoolError::NotFound(encoded.canonical()));
        }
        state.removes.push(encoded.canonical());
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AddressChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }
}

fn fast_config() -> PoolConfig {
    PoolConfig {
        use_existing_addresses: true,
        address_assign_timeout: Duration::from_millis(200),
        address_remove_timeout: Duration::from_millis(200),
        min_addresses: 0,
        max_addresses: 5,
        // long enough that eviction never interferes unless a test wants it
        address_max_idle_time: Duration::from_secs(3600),
        remove_addresses_every: Duration::from_secs(3600),
        reuse_policy: ReusePolicy::Release,
    }
}

fn numbered_source(n: usize) -> impl Iterator<Item = String> + Send + 'static {
    (0..n).map(|i| format!("fe80::aa:{:x}/64", i))
}

async fn pool_with(
    transport: Arc<MockTransport>,
    source: impl Iterator<Item = String> + Send + 'static,
    cfg: PoolConfig,
) -> IpPool {
    IpPool::new(source, InterfaceSpec::Index(IFACE), cfg, transport)
        .await
        .unwrap()
}

#[tokio::test]
async fn assigns_lazily_on_first_acquire() {
    let transport = MockTransport::new();
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), fast_config()).await;

    assert!(transport.adds().is_empty());
    let addr = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(transport.adds().len(), 1);

    let counts = pool.counts();
    assert_eq!(counts.borrowed, 1);
    assert_eq!(counts.available, 0);
    assert_eq!(counts.pending_create, 0);
    assert_eq!(addr.canonical, "fe80:0000:0000:0000:0000:0000:00aa:0000");
}

#[tokio::test]
async fn release_makes_the_same_address_reusable() {
    let transport = MockTransport::new();
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), fast_config()).await;

    let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.release(&first);
    let second = pool.acquire(Duration::from_secs(1)).await.unwrap();

    assert_eq!(first.canonical, second.canonical);
    assert_eq!(transport.adds().len(), 1, "no second netlink add expected");
}

#[tokio::test]
async fn acquire_times_out_at_capacity() {
    let transport = MockTransport::new();
    let cfg = PoolConfig {
        max_addresses: 1,
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), cfg).await;

    let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout));

    let counts = pool.counts();
    assert!(counts.available + counts.borrowed <= 1);
}

#[tokio::test]
async fn release_unblocks_a_waiting_acquire() {
    let transport = MockTransport::new();
    let cfg = PoolConfig {
        max_addresses: 1,
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), cfg).await;

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let releaser = pool.clone();
    let held_clone = held.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        releaser.release(&held_clone);
    });

    let reacquired = pool.acquire(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reacquired.canonical, held.canonical);
}

#[tokio::test]
async fn destroy_removes_from_pool_and_os() {
    let transport = MockTransport::new();
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), fast_config()).await;

    let addr = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.destroy(&addr).await.unwrap();

    assert_eq!(transport.removes(), vec![addr.canonical.clone()]);
    let counts = pool.counts();
    assert_eq!(counts.available + counts.borrowed, 0);

    // a fresh acquire pulls the next candidate, not the destroyed address
    let next = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_ne!(next.canonical, addr.canonical);
}

#[tokio::test]
async fn destroy_of_untracked_address_fails() {
    let transport = MockTransport::new();
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), fast_config()).await;

    let addr = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.destroy(&addr).await.unwrap();
    let err = pool.destroy(&addr).await.unwrap_err();
    assert!(matches!(err, PoolError::UnknownAddress(_)));
}

#[tokio::test]
async fn adopts_existing_address_when_configured() {
    let transport = MockTransport::new();
    transport.preassign("fe80::aa:0/64");
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), fast_config()).await;

    // the add fails with EEXIST, adoption turns that into success
    let addr = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(addr.canonical, "fe80:0000:0000:0000:0000:0000:00aa:0000");
    assert!(transport.adds().is_empty());
}

#[tokio::test]
async fn already_exists_fails_create_without_adoption() {
    let transport = MockTransport::new();
    transport.preassign("fe80::aa:0/64");
    let cfg = PoolConfig {
        use_existing_addresses: false,
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), cfg).await;

    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::AlreadyExists(_)));

    // no phantom table entry is left behind
    let counts = pool.counts();
    assert_eq!(counts.available + counts.borrowed + counts.pending_create, 0);
}

#[tokio::test]
async fn missing_clearance_fails_with_tentative_timeout() {
    let transport = MockTransport::without_clearance();
    // the same candidate twice: the retry proves the pending entry was freed
    let source = vec!["fe80::bb:1/64".to_string(), "fe80::bb:1/64".to_string()].into_iter();
    let pool = pool_with(Arc::clone(&transport), source, fast_config()).await;

    let err = pool.acquire(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, PoolError::TentativeTimeout(_)));
    let counts = pool.counts();
    assert_eq!(counts.available + counts.borrowed + counts.pending_create, 0);

    // second attempt re-registers the same address key and, since the first
    // add stuck, adopts the already-assigned address
    let addr = pool.acquire(Duration::from_secs(2)).await.unwrap();
    assert_eq!(addr.canonical, "fe80:0000:0000:0000:0000:0000:00bb:0001");
}

#[tokio::test]
async fn exhausted_source_surfaces_through_acquire() {
    let transport = MockTransport::new();
    let pool = pool_with(Arc::clone(&transport), numbered_source(1), fast_config()).await;

    let _first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::SourceExhausted));
}

#[tokio::test]
async fn drain_and_close_is_idempotent() {
    let transport = MockTransport::new();
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), fast_config()).await;

    let _borrowed = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let released = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.release(&released);

    pool.drain_and_close().await;
    assert_eq!(transport.removes().len(), 2, "both addresses unassigned");
    let counts = pool.counts();
    assert_eq!(counts.available + counts.borrowed, 0);

    pool.drain_and_close().await;
    assert_eq!(transport.removes().len(), 2, "second drain must be a no-op");

    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::PoolClosed));
}

#[tokio::test]
async fn drain_unblocks_a_waiting_acquire_with_pool_closed() {
    let transport = MockTransport::new();
    let cfg = PoolConfig {
        max_addresses: 1,
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), cfg).await;

    let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        // deadline far out: only the shutdown wakeup can end this wait early
        tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.drain_and_close().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::PoolClosed));
}

#[tokio::test]
async fn eviction_reclaims_idle_addresses_down_to_min() {
    let transport = MockTransport::new();
    let cfg = PoolConfig {
        min_addresses: 1,
        max_addresses: 5,
        address_max_idle_time: Duration::from_millis(50),
        remove_addresses_every: Duration::from_millis(25),
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), numbered_source(10), cfg).await;

    let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let c = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.release(&a);
    pool.release(&b);
    pool.release(&c);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let counts = pool.counts();
    assert_eq!(counts.available, 1, "eviction must stop at min_addresses");
    assert_eq!(transport.removes().len(), 2);
}

#[tokio::test]
async fn capacity_bound_holds_under_concurrent_acquires() {
    let transport = MockTransport::new();
    let cfg = PoolConfig {
        max_addresses: 4,
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), numbered_source(50), cfg).await;

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let addr = pool.acquire(Duration::from_secs(5)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            pool.release(&addr);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let counts = pool.counts();
    assert!(counts.available + counts.borrowed <= 4);
    assert!(transport.adds().len() <= 4);
}

#[tokio::test]
async fn agent_binds_connections_to_pool_addresses() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();

    let transport = MockTransport::new();
    // loopback is bindable without an actual netlink assignment
    let source = vec!["127.0.0.1/8".to_string()].into_iter();
    let pool = pool_with(transport, source, fast_config()).await;
    let agent = LocalAddrAgent::new(pool.clone(), Duration::from_secs(1));

    let (stream, mut lease) = agent.connect(remote).await.unwrap();
    assert_eq!(stream.local_addr().unwrap().ip().to_string(), "127.0.0.1");
    assert_eq!(lease.address().unwrap().canonical, "127.0.0.1");

    lease.close().await.unwrap();
    let counts = pool.counts();
    assert_eq!(counts.available, 1, "release policy returns the address");
    assert_eq!(counts.borrowed, 0);
}

#[tokio::test]
async fn agent_destroy_policy_unassigns_on_close() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();

    let transport = MockTransport::new();
    let source = vec!["127.0.0.1/8".to_string()].into_iter();
    let cfg = PoolConfig {
        reuse_policy: ReusePolicy::Destroy,
        ..fast_config()
    };
    let pool = pool_with(Arc::clone(&transport), source, cfg).await;
    let agent = LocalAddrAgent::new(pool.clone(), Duration::from_secs(1));

    let (_stream, mut lease) = agent.connect(remote).await.unwrap();
    lease.close().await.unwrap();

    let counts = pool.counts();
    assert_eq!(counts.available + counts.borrowed, 0);
    assert_eq!(transport.removes(), vec!["127.0.0.1".to_string()]);
}

#[tokio::test]
async fn resolves_interface_index_from_label() {
    let eth0 = codec::encode("10.0.0.1/24").unwrap();
    let listed = vec![
        InterfaceAddress {
            index: 2,
            label: Some("lo".to_string()),
            family: codec::AddressFamily::V4,
            bytes: vec![127, 0, 0, 1],
            prefix_len: 8,
            tentative: false,
        },
        InterfaceAddress {
            index: IFACE,
            label: Some("eth0".to_string()),
            family: eth0.family,
            bytes: eth0.bytes.clone(),
            prefix_len: 24,
            tentative: false,
        },
    ];
    let transport = MockTransport::with_listed(listed);

    let pool = IpPool::new(
        numbered_source(10),
        InterfaceSpec::Name("eth0".to_string()),
        fast_config(),
        Arc::clone(&transport) as Arc<dyn AddressTransport>,
    )
    .await
    .unwrap();
    assert_eq!(pool.interface_index(), IFACE);

    let err = IpPool::new(
        numbered_source(10),
        InterfaceSpec::Name("wlan9".to_string()),
        fast_config(),
        transport,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, PoolError::NotFound(_)));
}

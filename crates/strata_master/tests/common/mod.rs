//! In-process multi-master harness.
//!
//! Masters share a loopback transport: address → uuid lookups stand in for
//! the identity RPC, and replicates are delivered straight into the target
//! master's consensus. A master is "up" for resolution purposes once its
//! address is registered, and reachable for replication once its consensus
//! is registered.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strata_consensus::consensus::Consensus;
use strata_consensus::ops::ReplicateMsg;
use strata_consensus::transport::Transport;
use strata_master::entries::{
    SysTablesEntry, SysTabletsEntry, TableInfo, TableState, TableVisitor, TabletInfo,
    TabletState, TabletVisitor,
};
use strata_master::options::MasterOptions;
use strata_master::sys_catalog::{MasterContext, SysCatalogTable};
use strata_tablet::{DataType, SchemaBuilder};
use strata_util::clock::HybridClock;
use strata_util::net::HostPort;
use strata_util::{Error, Result};

static LOGGING: std::sync::Once = std::sync::Once::new();

/// Wire tracing output through the test harness; `RUST_LOG` filters it.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct LoopbackTransport {
    addr_to_uuid: Mutex<HashMap<String, String>>,
    nodes: Mutex<HashMap<String, Arc<Consensus>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a master resolvable (its "process" is up).
    pub fn register_addr(&self, addr: &HostPort, uuid: &str) {
        self.addr_to_uuid
            .lock()
            .unwrap()
            .insert(addr.to_string(), uuid.to_string());
    }

    /// Make a master reachable for replication.
    pub fn register_node(&self, uuid: &str, consensus: Arc<Consensus>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(uuid.to_string(), consensus);
    }

    pub fn deregister_node(&self, uuid: &str) {
        self.nodes.lock().unwrap().remove(uuid);
    }
}

impl Transport for LoopbackTransport {
    fn resolve_peer_uuid(&self, addr: &HostPort) -> Result<String> {
        self.addr_to_uuid
            .lock()
            .unwrap()
            .get(&addr.to_string())
            .cloned()
            .ok_or_else(|| Error::ServiceUnavailable(format!("no master listening at {addr}")))
    }

    fn replicate(&self, peer_uuid: &str, _tablet_id: &str, msg: &ReplicateMsg) -> Result<()> {
        let target = self.nodes.lock().unwrap().get(peer_uuid).cloned();
        match target {
            Some(consensus) => consensus.receive_replicate(msg.clone()),
            None => Err(Error::ServiceUnavailable(format!(
                "master {peer_uuid} unreachable"
            ))),
        }
    }
}

pub struct MiniMaster {
    pub uuid: String,
    pub addr: HostPort,
    pub catalog: Arc<SysCatalogTable>,
}

pub fn master_addr(index: usize) -> HostPort {
    HostPort::new("127.0.0.1", 7051 + index as u16)
}

pub fn master_uuid(index: usize) -> String {
    format!("{:032x}", 0xabc0 + index)
}

pub fn master_context(
    fs_root: &Path,
    opts: MasterOptions,
    uuid: &str,
    transport: Arc<LoopbackTransport>,
) -> Arc<MasterContext> {
    Arc::new(MasterContext {
        opts,
        fs_root: fs_root.to_path_buf(),
        uuid: uuid.to_string(),
        clock: Arc::new(HybridClock::new()),
        transport: transport as Arc<dyn Transport>,
    })
}

/// Bring up one master: create or load its catalog, then make it reachable
/// for replication.
pub fn start_master(
    index: usize,
    fs_root: &Path,
    opts: MasterOptions,
    transport: &Arc<LoopbackTransport>,
    fresh: bool,
) -> MiniMaster {
    init_logging();
    let uuid = master_uuid(index);
    let ctx = master_context(fs_root, opts, &uuid, Arc::clone(transport));
    let catalog = SysCatalogTable::new(ctx).unwrap();
    if fresh {
        catalog.create_new().unwrap();
    } else {
        catalog.load().unwrap();
    }
    let consensus = catalog.tablet_peer().unwrap().consensus().unwrap();
    transport.register_node(&uuid, consensus);
    MiniMaster {
        uuid,
        addr: master_addr(index),
        catalog,
    }
}

/// Collects visited tables.
#[derive(Default)]
pub struct TableCollector {
    pub tables: Vec<(String, SysTablesEntry)>,
}

impl TableVisitor for TableCollector {
    fn visit_table(&mut self, table_id: &str, metadata: &SysTablesEntry) -> Result<()> {
        self.tables.push((table_id.to_string(), metadata.clone()));
        Ok(())
    }
}

/// Collects visited tablets.
#[derive(Default)]
pub struct TabletCollector {
    pub tablets: Vec<(String, String, SysTabletsEntry)>,
}

impl TabletVisitor for TabletCollector {
    fn visit_tablet(
        &mut self,
        table_id: &str,
        tablet_id: &str,
        metadata: &SysTabletsEntry,
    ) -> Result<()> {
        self.tablets
            .push((table_id.to_string(), tablet_id.to_string(), metadata.clone()));
        Ok(())
    }
}

pub fn collect_tables(catalog: &SysCatalogTable) -> Vec<(String, SysTablesEntry)> {
    let mut collector = TableCollector::default();
    catalog.visit_tables(&mut collector).unwrap();
    collector.tables
}

pub fn collect_tablets(catalog: &SysCatalogTable) -> Vec<(String, String, SysTabletsEntry)> {
    let mut collector = TabletCollector::default();
    catalog.visit_tablets(&mut collector).unwrap();
    collector.tablets
}

/// Replica apply is asynchronous; poll until a master has seen `count`
/// tables.
pub fn wait_for_table_count(catalog: &SysCatalogTable, count: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if collect_tables(catalog).len() == count {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "master did not reach {count} tables within {timeout:?}, has {}",
                collect_tables(catalog).len()
            );
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

pub fn table_info(table_id: &str, table_name: &str) -> TableInfo {
    let mut builder = SchemaBuilder::new();
    builder.add_key_column("id", DataType::String).unwrap();
    builder.add_column("payload", DataType::Bytes).unwrap();
    TableInfo {
        table_id: table_id.to_string(),
        metadata: SysTablesEntry {
            table_name: table_name.to_string(),
            schema: builder.build().unwrap(),
            state: TableState::Preparing,
            next_column_id: 3,
            version: 0,
        },
    }
}

pub fn tablet_info(tablet_id: &str, table_id: &str) -> TabletInfo {
    TabletInfo {
        tablet_id: tablet_id.to_string(),
        metadata: SysTabletsEntry {
            table_id: table_id.to_string(),
            start_key: Vec::new(),
            end_key: Vec::new(),
            quorum: strata_consensus::Quorum::local_quorum(0, "tserver-0"),
            state: TabletState::Preparing,
        },
    }
}

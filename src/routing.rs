//! Routing table coordination
//!
//! Provides:
//! - Logical table names resolved to stable kernel table ids
//! - Idempotent route insert/remove through `ip route`
//! - Tracking of every route this process installed, per table
//!
//! Each table has its own exclusive lock held across the kernel call, so
//! mutations of one table never interleave.

use crate::error::{BestEffort, Error, Result};
use crate::manifest::RoutingConfig;
use crate::shell::{render, CommandRunner, IP_CMD};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Logical routing table identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableName {
    /// Destinations reachable from LAN-side traffic
    LanRoutable,
    /// Destinations reachable from WAN-side traffic
    WanRoutable,
    /// Private default table of one WAN interface
    InterfaceDefault(String),
}

impl TableName {
    pub fn interface_default(interface: &str) -> Self {
        TableName::InterfaceDefault(interface.to_string())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableName::LanRoutable => write!(f, "lan_routable"),
            TableName::WanRoutable => write!(f, "wan_routable"),
            TableName::InterfaceDefault(name) => write!(f, "{}_default", name),
        }
    }
}

/// Address family of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "-4",
            AddressFamily::V6 => "-6",
        }
    }
}

/// One route installed by this system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub device: String,
    pub table: TableName,
    pub metric: Option<u32>,
}

impl Route {
    /// Create a directly connected route
    pub fn new(destination: IpNet, device: &str, table: TableName) -> Self {
        Self {
            destination,
            gateway: None,
            device: device.to_string(),
            table,
            metric: None,
        }
    }

    /// Route through a next hop
    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.destination)
    }

    /// Build `ip route` arguments for an action (`add` or `del`)
    fn to_args(&self, action: &str, table_id: u32) -> Vec<String> {
        let mut args = vec![
            self.family().flag().to_string(),
            "route".to_string(),
            action.to_string(),
            self.destination.to_string(),
        ];
        if let Some(gw) = self.gateway {
            args.push("via".into());
            args.push(gw.to_string());
        }
        args.push("dev".into());
        args.push(self.device.clone());
        args.push("table".into());
        args.push(table_id.to_string());
        if let Some(metric) = self.metric {
            args.push("metric".into());
            args.push(metric.to_string());
        }
        args
    }
}

/// Logical name to kernel table id mapping
///
/// Fixed tables come from settings; `<ifname>_default` tables get the next
/// free id from the base on first lookup and keep it for the process lifetime.
#[derive(Debug)]
pub struct TableRegistry {
    lan_routable: u32,
    wan_routable: u32,
    next_default: Mutex<u32>,
    defaults: Mutex<BTreeMap<String, u32>>,
}

impl TableRegistry {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            lan_routable: config.lan_routable,
            wan_routable: config.wan_routable,
            next_default: Mutex::new(config.default_table_base),
            defaults: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve a logical table to its kernel id
    pub fn resolve(&self, table: &TableName) -> u32 {
        self.allocate(table).0
    }

    /// Resolve a table, reporting whether its id was allocated just now
    fn allocate(&self, table: &TableName) -> (u32, bool) {
        match table {
            TableName::LanRoutable => (self.lan_routable, false),
            TableName::WanRoutable => (self.wan_routable, false),
            TableName::InterfaceDefault(name) => {
                let mut defaults = lock(&self.defaults);
                if let Some(id) = defaults.get(name) {
                    return (*id, false);
                }
                let mut next = lock(&self.next_default);
                let id = *next;
                *next += 1;
                defaults.insert(name.clone(), id);
                (id, true)
            }
        }
    }

    /// Pin `<ifname>_default` to an id recorded by an earlier process
    pub fn seed(&self, interface: &str, id: u32) {
        let mut defaults = lock(&self.defaults);
        defaults.entry(interface.to_string()).or_insert(id);
        let mut next = lock(&self.next_default);
        if id >= *next {
            *next = id + 1;
        }
    }

    /// Every (name, id) pair known so far
    pub fn entries(&self) -> Vec<(String, u32)> {
        let mut entries = vec![
            (TableName::LanRoutable.to_string(), self.lan_routable),
            (TableName::WanRoutable.to_string(), self.wan_routable),
        ];
        for (name, id) in lock(&self.defaults).iter() {
            entries.push((TableName::interface_default(name).to_string(), *id));
        }
        entries
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type TableState = Arc<AsyncMutex<BTreeSet<Route>>>;

/// Owner of every route this system installs
pub struct RoutingCoordinator {
    runner: Arc<dyn CommandRunner>,
    registry: TableRegistry,
    tables: Mutex<HashMap<TableName, TableState>>,
    rt_tables: PathBuf,
    /// Serializes rewrites of the rt_tables file
    rt_tables_lock: AsyncMutex<()>,
}

impl RoutingCoordinator {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &RoutingConfig, rt_tables: &Path) -> Self {
        Self {
            runner,
            registry: TableRegistry::new(config),
            tables: Mutex::new(HashMap::new()),
            rt_tables: rt_tables.to_path_buf(),
            rt_tables_lock: AsyncMutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    fn table(&self, name: &TableName) -> TableState {
        lock(&self.tables)
            .entry(name.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(BTreeSet::new())))
            .clone()
    }

    /// Install a route; an already present route counts as success
    ///
    /// A newly allocated `<ifname>_default` id is written to rt_tables
    /// before the route goes in, so later processes resolve the same id.
    pub async fn add_route(&self, route: Route) -> BestEffort {
        let table = self.table(&route.table);
        let mut installed = table.lock().await;

        let (id, allocated) = self.registry.allocate(&route.table);
        if allocated {
            tracing::debug!(table = %route.table, id, "Allocated routing table");
            self.ensure_tables().await.log("routing table registration");
        }
        let args = route.to_args("add", id);
        let outcome: Result<()> = match self.runner.run(IP_CMD, &args).await {
            Ok(r) if r.success() || r.stderr.contains("File exists") => Ok(()),
            Ok(r) => Err(Error::KernelOperation {
                command: render(IP_CMD, &args),
                exit_code: r.exit_code,
                output: r.combined_output(),
            }),
            Err(e) => Err(e),
        };

        if outcome.is_ok() {
            tracing::debug!(
                destination = %route.destination,
                device = %route.device,
                table = %route.table,
                "Route installed"
            );
            installed.insert(route);
        }
        outcome.into()
    }

    /// Remove a route; an already absent route counts as success
    pub async fn remove_route(&self, route: &Route) -> BestEffort {
        let table = self.table(&route.table);
        let mut installed = table.lock().await;
        self.remove_locked(&mut installed, route).await
    }

    async fn remove_locked(&self, installed: &mut BTreeSet<Route>, route: &Route) -> BestEffort {
        let id = self.registry.resolve(&route.table);
        let args = route.to_args("del", id);
        let outcome: Result<()> = match self.runner.run(IP_CMD, &args).await {
            Ok(r) if r.success() || r.stderr.contains("No such process") => Ok(()),
            Ok(r) => Err(Error::KernelOperation {
                command: render(IP_CMD, &args),
                exit_code: r.exit_code,
                output: r.combined_output(),
            }),
            Err(e) => Err(e),
        };

        if outcome.is_ok() {
            installed.remove(route);
        }
        outcome.into()
    }

    /// Remove every route this system installed for `device`, in any table
    ///
    /// Returns the number of routes removed.
    pub async fn remove_device_routes(&self, device: &str) -> usize {
        let tables: Vec<TableState> = lock(&self.tables).values().cloned().collect();
        let mut removed = 0;

        for table in tables {
            let mut installed = table.lock().await;
            let routes: Vec<Route> = installed
                .iter()
                .filter(|r| r.device == device)
                .cloned()
                .collect();
            for route in routes {
                let outcome = self.remove_locked(&mut installed, &route).await;
                if outcome.is_done() {
                    removed += 1;
                } else {
                    outcome.log("route removal");
                }
            }
        }

        removed
    }

    /// Remove every route this system installed in `table`
    pub async fn flush_table(&self, name: &TableName) -> usize {
        let table = self.table(name);
        let mut installed = table.lock().await;
        let routes: Vec<Route> = installed.iter().cloned().collect();
        let mut removed = 0;
        for route in routes {
            let outcome = self.remove_locked(&mut installed, &route).await;
            if outcome.is_done() {
                removed += 1;
            } else {
                outcome.log("route removal");
            }
        }
        removed
    }

    /// Routes currently installed in a table by this system
    #[cfg(test)]
    pub async fn installed(&self, name: &TableName) -> Vec<Route> {
        let table = self.table(name);
        let installed = table.lock().await;
        installed.iter().cloned().collect()
    }

    /// Seed per-interface table ids from the rt_tables file
    ///
    /// Keeps `<ifname>_default` ids stable across restarts.
    pub async fn load_tables(&self) -> Result<usize> {
        let content = match tokio::fs::read_to_string(&self.rt_tables).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut seeded = 0;
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            if let Ok(id) = id.parse::<u32>()
                && let Some(interface) = name.strip_suffix("_default")
                && !interface.is_empty()
            {
                self.registry.seed(interface, id);
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Register known table names in the iproute2 rt_tables file
    ///
    /// Lets `ip route show table lan_routable` work for operators.
    pub async fn ensure_tables(&self) -> BestEffort {
        let _file = self.rt_tables_lock.lock().await;
        let existing = match tokio::fs::read_to_string(&self.rt_tables).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return BestEffort::Ignored(e.into()),
        };

        let known: BTreeSet<&str> = existing
            .lines()
            .filter_map(|l| l.split_whitespace().nth(1))
            .collect();

        let mut additions = String::new();
        for (name, id) in self.registry.entries() {
            if !known.contains(name.as_str()) {
                additions.push_str(&format!("{}\t{}\n", id, name));
            }
        }
        if additions.is_empty() {
            return BestEffort::Done;
        }

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&additions);
        tokio::fs::write(&self.rt_tables, content)
            .await
            .map_err(Error::from)
            .into()
    }
}

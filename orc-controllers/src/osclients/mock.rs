//! An in-memory OpenStack
//!
//! [`MockCloud`] keeps every resource in memory and answers like the real services where the
//! controllers care:
//!
//! - unknown IDs are 404s,
//! - deleting a network with subnets, or a load balancer with pools, is a 409,
//! - any change to a pool, or a new pool, while its load balancer is not `ACTIVE` is a 409.
//!
//! Every call is counted by operation name (`create_network`, `list_pools`, ...) and can be
//! made to fail once with [`MockCloud::fail_next`]. A clone made with
//! [`MockCloud::with_cancel`] fails every call with [`CloudError::Cancelled`] once its token is
//! cancelled.
use super::*;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

trait Record: Clone + Send + 'static {
    const KIND: &'static str;
    fn set_id(&mut self, id: String);
}

macro_rules! record {
    ($($ty:ty => $kind:literal),* $(,)?) => {
        $(impl Record for $ty {
            const KIND: &'static str = $kind;

            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        })*
    };
}

record!(
    Network => "network",
    Subnet => "subnet",
    FloatingIp => "floatingip",
    LoadBalancer => "loadbalancer",
    Pool => "pool",
    Image => "image",
    Server => "server",
);

#[derive(Default)]
struct State {
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    floating_ips: BTreeMap<String, FloatingIp>,
    load_balancers: BTreeMap<String, LoadBalancer>,
    pools: BTreeMap<String, Pool>,
    images: BTreeMap<String, Image>,
    servers: BTreeMap<String, Server>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<CloudError>>,
    create_pending: bool,
}

type Table<T> = fn(&mut State) -> &mut BTreeMap<String, T>;

fn not_found(kind: &str, id: &str) -> CloudError {
    CloudError::not_found(format!("{kind} {id} could not be found"))
}

fn matches<T: PartialEq + ?Sized>(wanted: Option<&T>, have: &T) -> bool {
    wanted.is_none_or(|w| w == have)
}

fn has_tags(tags: &[String], wanted: &[String]) -> bool {
    wanted.iter().all(|t| tags.contains(t))
}

/// An in-memory cloud implementing every client trait
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<Mutex<State>>,
    cancel: Option<CancellationToken>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the same cloud whose calls fail once `cancel` is cancelled
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            state: self.state.clone(),
            cancel: Some(cancel),
        }
    }

    /// How many times `op` was called
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or_default()
    }

    /// How many calls of any operation were made
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Fail the next call of `op` with `err`; queued errors are returned in order
    pub fn fail_next(&self, op: &'static str, err: CloudError) {
        self.state.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Leave new load balancers, pools, servers and images in their provisioning state
    ///
    /// They stay there until moved on with one of the `set_*_status` methods.
    pub fn create_pending(&self, pending: bool) {
        self.state.lock().create_pending = pending;
    }

    pub fn set_load_balancer_status(&self, id: &str, status: &str) {
        if let Some(lb) = self.state.lock().load_balancers.get_mut(id) {
            lb.provisioning_status = status.into();
        }
    }

    pub fn set_pool_status(&self, id: &str, status: &str) {
        if let Some(pool) = self.state.lock().pools.get_mut(id) {
            pool.provisioning_status = status.into();
        }
    }

    pub fn set_server_status(&self, id: &str, status: &str) {
        if let Some(server) = self.state.lock().servers.get_mut(id) {
            server.status = status.into();
        }
    }

    pub fn set_image_status(&self, id: &str, status: &str) {
        if let Some(image) = self.state.lock().images.get_mut(id) {
            image.status = status.into();
        }
    }

    pub fn insert_network(&self, network: Network) -> String {
        self.insert(|s| &mut s.networks, network)
    }

    pub fn insert_subnet(&self, subnet: Subnet) -> String {
        self.insert(|s| &mut s.subnets, subnet)
    }

    pub fn insert_floating_ip(&self, fip: FloatingIp) -> String {
        self.insert(|s| &mut s.floating_ips, fip)
    }

    pub fn insert_load_balancer(&self, lb: LoadBalancer) -> String {
        self.insert(|s| &mut s.load_balancers, lb)
    }

    pub fn insert_image(&self, image: Image) -> String {
        self.insert(|s| &mut s.images, image)
    }

    pub fn network(&self, id: &str) -> Option<Network> {
        self.state.lock().networks.get(id).cloned()
    }

    pub fn networks(&self) -> Vec<Network> {
        self.state.lock().networks.values().cloned().collect()
    }

    pub fn subnet(&self, id: &str) -> Option<Subnet> {
        self.state.lock().subnets.get(id).cloned()
    }

    pub fn floating_ip(&self, id: &str) -> Option<FloatingIp> {
        self.state.lock().floating_ips.get(id).cloned()
    }

    pub fn load_balancer(&self, id: &str) -> Option<LoadBalancer> {
        self.state.lock().load_balancers.get(id).cloned()
    }

    pub fn pool(&self, id: &str) -> Option<Pool> {
        self.state.lock().pools.get(id).cloned()
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.state.lock().pools.values().cloned().collect()
    }

    pub fn image(&self, id: &str) -> Option<Image> {
        self.state.lock().images.get(id).cloned()
    }

    pub fn server(&self, id: &str) -> Option<Server> {
        self.state.lock().servers.get(id).cloned()
    }

    /// Delete a resource of any kind behind the controllers' back
    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock();
        state.networks.remove(id);
        state.subnets.remove(id);
        state.floating_ips.remove(id);
        state.load_balancers.remove(id);
        state.pools.remove(id);
        state.images.remove(id);
        state.servers.remove(id);
    }

    fn call(&self, op: &'static str) -> Result<(), CloudError> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(CloudError::Cancelled);
        }
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn insert<T: Record>(&self, table: Table<T>, mut item: T) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}-{:04}", T::KIND, state.next_id);
        item.set_id(id.clone());
        table(&mut *state).insert(id.clone(), item);
        id
    }

    fn create<T: Record>(&self, op: &'static str, table: Table<T>, item: T) -> Result<T, CloudError> {
        self.call(op)?;
        let id = self.insert(table, item);
        self.peek(table, &id)
    }

    fn peek<T: Record>(&self, table: Table<T>, id: &str) -> Result<T, CloudError> {
        table(&mut *self.state.lock())
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(T::KIND, id))
    }

    fn get<T: Record>(&self, op: &'static str, table: Table<T>, id: &str) -> Result<T, CloudError> {
        self.call(op)?;
        self.peek(table, id)
    }

    fn list<T: Record>(&self, op: &'static str, table: Table<T>, keep: impl Fn(&T) -> bool) -> ResourceStream<T> {
        if let Err(err) = self.call(op) {
            return stream::once(async move { Err(err) }).boxed();
        }
        let items = table(&mut *self.state.lock())
            .values()
            .filter(|item| keep(item))
            .cloned()
            .map(Ok)
            .collect::<Vec<_>>();
        stream::iter(items).boxed()
    }

    fn modify<T: Record>(
        &self,
        op: &'static str,
        table: Table<T>,
        id: &str,
        edit: impl FnOnce(&mut T),
    ) -> Result<T, CloudError> {
        self.call(op)?;
        let mut state = self.state.lock();
        let item = table(&mut *state).get_mut(id).ok_or_else(|| not_found(T::KIND, id))?;
        edit(item);
        Ok(item.clone())
    }

    fn delete<T: Record>(&self, op: &'static str, table: Table<T>, id: &str) -> Result<(), CloudError> {
        self.call(op)?;
        table(&mut *self.state.lock())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(T::KIND, id))
    }

    /// Octavia refuses changes under a load balancer which is not `ACTIVE`
    fn check_load_balancer_active(&self, id: &str) -> Result<(), CloudError> {
        let state = self.state.lock();
        let lb = state.load_balancers.get(id).ok_or_else(|| not_found("loadbalancer", id))?;
        if lb.provisioning_status != "ACTIVE" {
            return Err(CloudError::conflict(format!(
                "load balancer {id} is immutable and cannot be updated while {}",
                lb.provisioning_status
            )));
        }
        Ok(())
    }

    fn pool_parent(&self, id: &str) -> Result<String, CloudError> {
        self.state
            .lock()
            .pools
            .get(id)
            .map(|pool| pool.loadbalancer_id.clone())
            .ok_or_else(|| not_found("pool", id))
    }

    fn initial_status(&self, pending: &str, done: &str) -> String {
        let status = if self.state.lock().create_pending { pending } else { done };
        status.to_string()
    }
}

#[async_trait]
impl NetworkClient for MockCloud {
    async fn get_network(&self, id: &str) -> Result<Network, CloudError> {
        self.get("get_network", |s| &mut s.networks, id)
    }

    fn list_networks(&self, filter: &NetworkList) -> ResourceStream<Network> {
        let filter = filter.clone();
        self.list("list_networks", |s| &mut s.networks, move |n| {
            matches(filter.name.as_deref(), n.name.as_str())
                && matches(filter.description.as_deref(), n.description.as_str())
                && matches(filter.external.as_ref(), &n.external)
                && has_tags(&n.tags, &filter.tags)
        })
    }

    async fn create_network(&self, opts: &NetworkCreate) -> Result<Network, CloudError> {
        self.create("create_network", |s| &mut s.networks, Network {
            id: String::new(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            admin_state_up: opts.admin_state_up.unwrap_or(true),
            mtu: opts.mtu.unwrap_or(1500),
            shared: opts.shared.unwrap_or_default(),
            external: opts.external.unwrap_or_default(),
            status: "ACTIVE".into(),
            tags: Vec::new(),
        })
    }

    async fn update_network(&self, id: &str, opts: &NetworkUpdate) -> Result<Network, CloudError> {
        self.modify("update_network", |s| &mut s.networks, id, |n| {
            if let Some(name) = &opts.name {
                n.name = name.clone();
            }
            if let Some(description) = &opts.description {
                n.description = description.clone();
            }
            if let Some(up) = opts.admin_state_up {
                n.admin_state_up = up;
            }
            if let Some(mtu) = opts.mtu {
                n.mtu = mtu;
            }
            if let Some(shared) = opts.shared {
                n.shared = shared;
            }
        })
    }

    async fn delete_network(&self, id: &str) -> Result<(), CloudError> {
        let in_use = self.state.lock().subnets.values().any(|s| s.network_id == id);
        if in_use {
            self.call("delete_network")?;
            return Err(CloudError::conflict(format!("network {id} has subnets")));
        }
        self.delete("delete_network", |s| &mut s.networks, id)
    }

    async fn get_subnet(&self, id: &str) -> Result<Subnet, CloudError> {
        self.get("get_subnet", |s| &mut s.subnets, id)
    }

    fn list_subnets(&self, filter: &SubnetList) -> ResourceStream<Subnet> {
        let filter = filter.clone();
        self.list("list_subnets", |s| &mut s.subnets, move |s| {
            matches(filter.name.as_deref(), s.name.as_str())
                && matches(filter.description.as_deref(), s.description.as_str())
                && matches(filter.network_id.as_deref(), s.network_id.as_str())
                && matches(filter.cidr.as_deref(), s.cidr.as_str())
                && matches(filter.ip_version.as_ref(), &s.ip_version)
                && has_tags(&s.tags, &filter.tags)
        })
    }

    async fn create_subnet(&self, opts: &SubnetCreate) -> Result<Subnet, CloudError> {
        if self.network(&opts.network_id).is_none() {
            self.call("create_subnet")?;
            return Err(CloudError::not_found(format!("network {} could not be found", opts.network_id)));
        }
        self.create("create_subnet", |s| &mut s.subnets, Subnet {
            id: String::new(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            network_id: opts.network_id.clone(),
            cidr: opts.cidr.clone(),
            ip_version: opts.ip_version,
            gateway_ip: opts.gateway_ip.clone(),
            enable_dhcp: opts.enable_dhcp.unwrap_or(true),
            tags: Vec::new(),
        })
    }

    async fn update_subnet(&self, id: &str, opts: &SubnetUpdate) -> Result<Subnet, CloudError> {
        self.modify("update_subnet", |s| &mut s.subnets, id, |s| {
            if let Some(name) = &opts.name {
                s.name = name.clone();
            }
            if let Some(description) = &opts.description {
                s.description = description.clone();
            }
            if let Some(dhcp) = opts.enable_dhcp {
                s.enable_dhcp = dhcp;
            }
        })
    }

    async fn delete_subnet(&self, id: &str) -> Result<(), CloudError> {
        self.delete("delete_subnet", |s| &mut s.subnets, id)
    }

    async fn get_floating_ip(&self, id: &str) -> Result<FloatingIp, CloudError> {
        self.get("get_floating_ip", |s| &mut s.floating_ips, id)
    }

    fn list_floating_ips(&self, filter: &FloatingIpList) -> ResourceStream<FloatingIp> {
        let filter = filter.clone();
        self.list("list_floating_ips", |s| &mut s.floating_ips, move |f| {
            matches(filter.description.as_deref(), f.description.as_str())
                && matches(filter.floating_network_id.as_deref(), f.floating_network_id.as_str())
                && matches(filter.floating_ip_address.as_deref(), f.floating_ip_address.as_str())
                && has_tags(&f.tags, &filter.tags)
        })
    }

    async fn create_floating_ip(&self, opts: &FloatingIpCreate) -> Result<FloatingIp, CloudError> {
        let next = self.state.lock().floating_ips.len() + 10;
        self.create("create_floating_ip", |s| &mut s.floating_ips, FloatingIp {
            id: String::new(),
            description: opts.description.clone(),
            floating_network_id: opts.floating_network_id.clone(),
            floating_ip_address: opts
                .floating_ip_address
                .clone()
                .unwrap_or_else(|| format!("203.0.113.{next}")),
            port_id: None,
            status: "DOWN".into(),
            tags: Vec::new(),
        })
    }

    async fn update_floating_ip(&self, id: &str, opts: &FloatingIpUpdate) -> Result<FloatingIp, CloudError> {
        self.modify("update_floating_ip", |s| &mut s.floating_ips, id, |f| {
            if let Some(description) = &opts.description {
                f.description = description.clone();
            }
        })
    }

    async fn delete_floating_ip(&self, id: &str) -> Result<(), CloudError> {
        self.delete("delete_floating_ip", |s| &mut s.floating_ips, id)
    }

    async fn replace_tags(&self, resource_type: &str, id: &str, tags: &[String]) -> Result<Vec<String>, CloudError> {
        self.call("replace_tags")?;
        let mut state = self.state.lock();
        let target = match resource_type {
            "networks" => state.networks.get_mut(id).map(|n| &mut n.tags),
            "subnets" => state.subnets.get_mut(id).map(|s| &mut s.tags),
            "floatingips" => state.floating_ips.get_mut(id).map(|f| &mut f.tags),
            _ => return Err(CloudError::bad_request(format!("unknown resource type {resource_type}"))),
        };
        let target = target.ok_or_else(|| not_found(resource_type, id))?;
        *target = tags.to_vec();
        Ok(target.clone())
    }
}

#[async_trait]
impl LoadBalancerClient for MockCloud {
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, CloudError> {
        self.get("get_load_balancer", |s| &mut s.load_balancers, id)
    }

    fn list_load_balancers(&self, filter: &LoadBalancerList) -> ResourceStream<LoadBalancer> {
        let filter = filter.clone();
        self.list("list_load_balancers", |s| &mut s.load_balancers, move |lb| {
            matches(filter.name.as_deref(), lb.name.as_str())
                && matches(filter.description.as_deref(), lb.description.as_str())
                && has_tags(&lb.tags, &filter.tags)
        })
    }

    async fn create_load_balancer(&self, opts: &LoadBalancerCreate) -> Result<LoadBalancer, CloudError> {
        let provisioning_status = self.initial_status("PENDING_CREATE", "ACTIVE");
        self.create("create_load_balancer", |s| &mut s.load_balancers, LoadBalancer {
            id: String::new(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            vip_subnet_id: opts.vip_subnet_id.clone(),
            vip_address: opts.vip_address.clone().unwrap_or_else(|| "192.0.2.10".into()),
            provisioning_status,
            operating_status: "ONLINE".into(),
            tags: opts.tags.clone(),
        })
    }

    async fn update_load_balancer(&self, id: &str, opts: &LoadBalancerUpdate) -> Result<LoadBalancer, CloudError> {
        if let Err(err) = self.check_load_balancer_active(id) {
            self.call("update_load_balancer")?;
            return Err(err);
        }
        self.modify("update_load_balancer", |s| &mut s.load_balancers, id, |lb| {
            if let Some(name) = &opts.name {
                lb.name = name.clone();
            }
            if let Some(description) = &opts.description {
                lb.description = description.clone();
            }
            if let Some(tags) = &opts.tags {
                lb.tags = tags.clone();
            }
        })
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError> {
        let has_pools = self.state.lock().pools.values().any(|p| p.loadbalancer_id == id);
        if has_pools {
            self.call("delete_load_balancer")?;
            return Err(CloudError::conflict(format!("load balancer {id} has pools")));
        }
        self.delete("delete_load_balancer", |s| &mut s.load_balancers, id)
    }

    async fn get_pool(&self, id: &str) -> Result<Pool, CloudError> {
        self.get("get_pool", |s| &mut s.pools, id)
    }

    fn list_pools(&self, filter: &PoolList) -> ResourceStream<Pool> {
        let filter = filter.clone();
        self.list("list_pools", |s| &mut s.pools, move |p| {
            matches(filter.name.as_deref(), p.name.as_str())
                && matches(filter.loadbalancer_id.as_deref(), p.loadbalancer_id.as_str())
                && matches(filter.protocol.as_deref(), p.protocol.as_str())
                && has_tags(&p.tags, &filter.tags)
        })
    }

    async fn create_pool(&self, opts: &PoolCreate) -> Result<Pool, CloudError> {
        if let Err(err) = self.check_load_balancer_active(&opts.loadbalancer_id) {
            self.call("create_pool")?;
            return Err(err);
        }
        let provisioning_status = self.initial_status("PENDING_CREATE", "ACTIVE");
        self.create("create_pool", |s| &mut s.pools, Pool {
            id: String::new(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            loadbalancer_id: opts.loadbalancer_id.clone(),
            protocol: opts.protocol.clone(),
            lb_algorithm: opts.lb_algorithm.clone(),
            provisioning_status,
            tags: opts.tags.clone(),
        })
    }

    async fn update_pool(&self, id: &str, opts: &PoolUpdate) -> Result<Pool, CloudError> {
        let parent = self.pool_parent(id)?;
        if let Err(err) = self.check_load_balancer_active(&parent) {
            self.call("update_pool")?;
            return Err(err);
        }
        self.modify("update_pool", |s| &mut s.pools, id, |p| {
            if let Some(name) = &opts.name {
                p.name = name.clone();
            }
            if let Some(description) = &opts.description {
                p.description = description.clone();
            }
            if let Some(algorithm) = &opts.lb_algorithm {
                p.lb_algorithm = algorithm.clone();
            }
            if let Some(tags) = &opts.tags {
                p.tags = tags.clone();
            }
        })
    }

    async fn delete_pool(&self, id: &str) -> Result<(), CloudError> {
        if let Ok(parent) = self.pool_parent(id) {
            if let Err(err) = self.check_load_balancer_active(&parent) {
                self.call("delete_pool")?;
                return Err(err);
            }
        }
        self.delete("delete_pool", |s| &mut s.pools, id)
    }
}

#[async_trait]
impl ImageClient for MockCloud {
    async fn get_image(&self, id: &str) -> Result<Image, CloudError> {
        self.get("get_image", |s| &mut s.images, id)
    }

    fn list_images(&self, filter: &ImageList) -> ResourceStream<Image> {
        let filter = filter.clone();
        self.list("list_images", |s| &mut s.images, move |i| {
            matches(filter.name.as_deref(), i.name.as_str()) && has_tags(&i.tags, &filter.tags)
        })
    }

    async fn create_image(&self, opts: &ImageCreate) -> Result<Image, CloudError> {
        let status = self.initial_status("queued", "active");
        self.create("create_image", |s| &mut s.images, Image {
            id: String::new(),
            name: opts.name.clone(),
            status,
            visibility: opts.visibility.clone().unwrap_or_else(|| "private".into()),
            disk_format: opts.disk_format.clone(),
            container_format: opts.container_format.clone(),
            min_disk_gb: opts.min_disk_gb.unwrap_or_default(),
            protected: opts.protected.unwrap_or_default(),
            tags: opts.tags.clone(),
        })
    }

    async fn update_image(&self, id: &str, opts: &ImageUpdate) -> Result<Image, CloudError> {
        self.modify("update_image", |s| &mut s.images, id, |i| {
            if let Some(name) = &opts.name {
                i.name = name.clone();
            }
            if let Some(protected) = opts.protected {
                i.protected = protected;
            }
            if let Some(tags) = &opts.tags {
                i.tags = tags.clone();
            }
        })
    }

    async fn delete_image(&self, id: &str) -> Result<(), CloudError> {
        let protected = self.state.lock().images.get(id).is_some_and(|i| i.protected);
        if protected {
            self.call("delete_image")?;
            return Err(CloudError::Http {
                status: 403,
                message: format!("image {id} is protected"),
            });
        }
        self.delete("delete_image", |s| &mut s.images, id)
    }
}

#[async_trait]
impl ComputeClient for MockCloud {
    async fn get_server(&self, id: &str) -> Result<Server, CloudError> {
        self.get("get_server", |s| &mut s.servers, id)
    }

    fn list_servers(&self, filter: &ServerList) -> ResourceStream<Server> {
        let filter = filter.clone();
        self.list("list_servers", |s| &mut s.servers, move |srv| {
            matches(filter.name.as_deref(), srv.name.as_str()) && has_tags(&srv.tags, &filter.tags)
        })
    }

    async fn create_server(&self, opts: &ServerCreate) -> Result<Server, CloudError> {
        if self.image(&opts.image_id).is_none() {
            self.call("create_server")?;
            return Err(CloudError::bad_request(format!("image {} not found", opts.image_id)));
        }
        let status = self.initial_status("BUILD", "ACTIVE");
        self.create("create_server", |s| &mut s.servers, Server {
            id: String::new(),
            name: opts.name.clone(),
            image_id: opts.image_id.clone(),
            flavor_name: opts.flavor_name.clone(),
            status,
            tags: opts.tags.clone(),
        })
    }

    async fn update_server(&self, id: &str, opts: &ServerUpdate) -> Result<Server, CloudError> {
        self.modify("update_server", |s| &mut s.servers, id, |srv| {
            if let Some(name) = &opts.name {
                srv.name = name.clone();
            }
        })
    }

    async fn delete_server(&self, id: &str) -> Result<(), CloudError> {
        self.delete("delete_server", |s| &mut s.servers, id)
    }

    async fn replace_server_tags(&self, id: &str, tags: &[String]) -> Result<Vec<String>, CloudError> {
        self.modify("replace_server_tags", |s| &mut s.servers, id, |srv| srv.tags = tags.to_vec())
            .map(|srv| srv.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn lists_apply_every_filter() {
        let cloud = MockCloud::new();
        cloud.insert_network(Network {
            name: "a".into(),
            tags: vec!["x".into(), "y".into()],
            ..Network::default()
        });
        cloud.insert_network(Network {
            name: "a".into(),
            ..Network::default()
        });

        let by_name = NetworkList {
            name: Some("a".into()),
            ..NetworkList::default()
        };
        let found: Vec<Network> = cloud.list_networks(&by_name).try_collect().await.unwrap();
        assert_eq!(found.len(), 2);

        let by_tag = NetworkList {
            tags: vec!["y".into()],
            ..by_name
        };
        let found: Vec<Network> = cloud.list_networks(&by_tag).try_collect().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(cloud.calls("list_networks"), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_returned_once() {
        let cloud = MockCloud::new();
        cloud.fail_next("get_network", CloudError::Transport("reset".into()));
        let id = cloud.insert_network(Network::default());
        assert_eq!(
            cloud.get_network(&id).await.unwrap_err(),
            CloudError::Transport("reset".into())
        );
        assert!(cloud.get_network(&id).await.is_ok());
        assert!(cloud.get_network("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn pools_conflict_while_their_load_balancer_is_busy() {
        let cloud = MockCloud::new();
        let lb = cloud.insert_load_balancer(LoadBalancer {
            provisioning_status: "PENDING_UPDATE".into(),
            ..LoadBalancer::default()
        });
        let opts = PoolCreate {
            loadbalancer_id: lb.clone(),
            ..PoolCreate::default()
        };
        assert!(cloud.create_pool(&opts).await.unwrap_err().is_conflict());
        cloud.set_load_balancer_status(&lb, "ACTIVE");
        assert!(cloud.create_pool(&opts).await.is_ok());
        assert_eq!(cloud.calls("create_pool"), 2);
    }

    #[tokio::test]
    async fn cancelled_handles_fail_every_call() {
        let cloud = MockCloud::new();
        let cancel = CancellationToken::new();
        let handle = cloud.with_cancel(cancel.clone());
        let id = cloud.insert_network(Network::default());
        assert!(handle.get_network(&id).await.is_ok());
        cancel.cancel();
        assert_eq!(handle.get_network(&id).await.unwrap_err(), CloudError::Cancelled);
        assert!(cloud.get_network(&id).await.is_ok());
    }
}

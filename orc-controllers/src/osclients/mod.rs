//! The OpenStack API surface used by the controllers
//!
//! Each service is a trait over plain request and response types, so that the actuators do not
//! depend on a particular SDK or wire format. [`mock::MockCloud`] implements every service in
//! memory.
use async_trait::async_trait;
use orc_core::CloudError;
use orc_runtime::ResourceStream;
use std::sync::Arc;

pub mod mock;

/// A Neutron network
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub description: String,
    pub admin_state_up: bool,
    pub mtu: i32,
    pub shared: bool,
    pub external: bool,
    pub status: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkCreate {
    pub name: String,
    pub description: String,
    pub admin_state_up: Option<bool>,
    pub mtu: Option<i32>,
    pub shared: Option<bool>,
    pub external: Option<bool>,
}

/// Fields to change on a network; `None` leaves a field alone
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub admin_state_up: Option<bool>,
    pub mtu: Option<i32>,
    pub shared: Option<bool>,
}

/// Server-side filters for listing networks; every populated field must match
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkList {
    pub name: Option<String>,
    pub description: Option<String>,
    pub external: Option<bool>,
    /// Networks carrying all of these tags
    pub tags: Vec<String>,
}

/// A Neutron subnet
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subnet {
    pub id: String,
    pub name: String,
    pub description: String,
    pub network_id: String,
    pub cidr: String,
    pub ip_version: i32,
    pub gateway_ip: Option<String>,
    pub enable_dhcp: bool,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubnetCreate {
    pub name: String,
    pub description: String,
    pub network_id: String,
    pub cidr: String,
    pub ip_version: i32,
    pub gateway_ip: Option<String>,
    pub enable_dhcp: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubnetUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enable_dhcp: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubnetList {
    pub name: Option<String>,
    pub description: Option<String>,
    pub network_id: Option<String>,
    pub cidr: Option<String>,
    pub ip_version: Option<i32>,
    pub tags: Vec<String>,
}

/// A Neutron floating IP
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FloatingIp {
    pub id: String,
    pub description: String,
    pub floating_network_id: String,
    pub floating_ip_address: String,
    pub port_id: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FloatingIpCreate {
    pub description: String,
    pub floating_network_id: String,
    pub floating_ip_address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FloatingIpUpdate {
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FloatingIpList {
    pub description: Option<String>,
    pub floating_network_id: Option<String>,
    pub floating_ip_address: Option<String>,
    pub tags: Vec<String>,
}

/// An Octavia load balancer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancer {
    pub id: String,
    pub name: String,
    pub description: String,
    pub vip_subnet_id: String,
    pub vip_address: String,
    pub provisioning_status: String,
    pub operating_status: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerCreate {
    pub name: String,
    pub description: String,
    pub vip_subnet_id: String,
    pub vip_address: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerList {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// An Octavia pool
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub description: String,
    pub loadbalancer_id: String,
    pub protocol: String,
    pub lb_algorithm: String,
    pub provisioning_status: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolCreate {
    pub name: String,
    pub description: String,
    pub loadbalancer_id: String,
    pub protocol: String,
    pub lb_algorithm: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub lb_algorithm: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolList {
    pub name: Option<String>,
    pub loadbalancer_id: Option<String>,
    pub protocol: Option<String>,
    pub tags: Vec<String>,
}

/// A Glance image
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: String,
    pub visibility: String,
    pub disk_format: String,
    pub container_format: String,
    pub min_disk_gb: i32,
    pub protected: bool,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageCreate {
    pub name: String,
    pub visibility: Option<String>,
    pub disk_format: String,
    pub container_format: String,
    pub min_disk_gb: Option<i32>,
    pub protected: Option<bool>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageUpdate {
    pub name: Option<String>,
    pub protected: Option<bool>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageList {
    pub name: Option<String>,
    pub tags: Vec<String>,
}

/// A Nova server
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub flavor_name: String,
    pub status: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerCreate {
    pub name: String,
    pub image_id: String,
    pub flavor_name: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerUpdate {
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerList {
    pub name: Option<String>,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn get_network(&self, id: &str) -> Result<Network, CloudError>;
    fn list_networks(&self, filter: &NetworkList) -> ResourceStream<Network>;
    async fn create_network(&self, opts: &NetworkCreate) -> Result<Network, CloudError>;
    async fn update_network(&self, id: &str, opts: &NetworkUpdate) -> Result<Network, CloudError>;
    async fn delete_network(&self, id: &str) -> Result<(), CloudError>;

    async fn get_subnet(&self, id: &str) -> Result<Subnet, CloudError>;
    fn list_subnets(&self, filter: &SubnetList) -> ResourceStream<Subnet>;
    async fn create_subnet(&self, opts: &SubnetCreate) -> Result<Subnet, CloudError>;
    async fn update_subnet(&self, id: &str, opts: &SubnetUpdate) -> Result<Subnet, CloudError>;
    async fn delete_subnet(&self, id: &str) -> Result<(), CloudError>;

    async fn get_floating_ip(&self, id: &str) -> Result<FloatingIp, CloudError>;
    fn list_floating_ips(&self, filter: &FloatingIpList) -> ResourceStream<FloatingIp>;
    async fn create_floating_ip(&self, opts: &FloatingIpCreate) -> Result<FloatingIp, CloudError>;
    async fn update_floating_ip(&self, id: &str, opts: &FloatingIpUpdate) -> Result<FloatingIp, CloudError>;
    async fn delete_floating_ip(&self, id: &str) -> Result<(), CloudError>;

    /// Replace the whole tag set of a Neutron resource
    ///
    /// `resource_type` is the collection name, e.g. `networks`.
    async fn replace_tags(&self, resource_type: &str, id: &str, tags: &[String]) -> Result<Vec<String>, CloudError>;
}

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, CloudError>;
    fn list_load_balancers(&self, filter: &LoadBalancerList) -> ResourceStream<LoadBalancer>;
    async fn create_load_balancer(&self, opts: &LoadBalancerCreate) -> Result<LoadBalancer, CloudError>;
    async fn update_load_balancer(&self, id: &str, opts: &LoadBalancerUpdate) -> Result<LoadBalancer, CloudError>;
    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError>;

    async fn get_pool(&self, id: &str) -> Result<Pool, CloudError>;
    fn list_pools(&self, filter: &PoolList) -> ResourceStream<Pool>;
    async fn create_pool(&self, opts: &PoolCreate) -> Result<Pool, CloudError>;
    async fn update_pool(&self, id: &str, opts: &PoolUpdate) -> Result<Pool, CloudError>;
    async fn delete_pool(&self, id: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn get_image(&self, id: &str) -> Result<Image, CloudError>;
    fn list_images(&self, filter: &ImageList) -> ResourceStream<Image>;
    async fn create_image(&self, opts: &ImageCreate) -> Result<Image, CloudError>;
    async fn update_image(&self, id: &str, opts: &ImageUpdate) -> Result<Image, CloudError>;
    async fn delete_image(&self, id: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn get_server(&self, id: &str) -> Result<Server, CloudError>;
    fn list_servers(&self, filter: &ServerList) -> ResourceStream<Server>;
    async fn create_server(&self, opts: &ServerCreate) -> Result<Server, CloudError>;
    async fn update_server(&self, id: &str, opts: &ServerUpdate) -> Result<Server, CloudError>;
    async fn delete_server(&self, id: &str) -> Result<(), CloudError>;
    async fn replace_server_tags(&self, id: &str, tags: &[String]) -> Result<Vec<String>, CloudError>;
}

/// The clients of one reconcile pass, all authenticated against the same cloud profile
#[derive(Clone)]
pub struct Clients {
    pub networking: Arc<dyn NetworkClient>,
    pub load_balancer: Arc<dyn LoadBalancerClient>,
    pub image: Arc<dyn ImageClient>,
    pub compute: Arc<dyn ComputeClient>,
}

impl Clients {
    /// Serve every service from one implementation
    pub fn from_cloud<T>(cloud: T) -> Self
    where
        T: NetworkClient + LoadBalancerClient + ImageClient + ComputeClient + 'static,
    {
        let cloud = Arc::new(cloud);
        Self {
            networking: cloud.clone(),
            load_balancer: cloud.clone(),
            image: cloud.clone(),
            compute: cloud,
        }
    }
}

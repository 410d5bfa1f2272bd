//! Port-mapper registration of the cluster service.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// Service type under which the cluster listener registers.
pub const CLUSTER_SERVICE_TYPE: &str = "CLUSTER";

/// One registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    /// `"tcp"` or `"ssl"`.
    pub protocol: String,
    pub service_type: String,
    pub port: u16,
    /// Carries `hostname` and `hostaddr` for the cluster service.
    pub metadata: BTreeMap<String, String>,
}

/// Cluster-wide discovery of service ports.
///
/// Used as `Arc<dyn PortMapper>`.
pub trait PortMapper: Send + Sync {
    fn add_service(
        &self,
        name: &str,
        protocol: &str,
        service_type: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    );

    fn remove_service(&self, name: &str);

    fn lookup(&self, name: &str) -> Option<ServiceEntry>;
}

/// Process-local [`PortMapper`].
#[derive(Debug, Default)]
pub struct InMemoryPortMapper {
    services: DashMap<String, ServiceEntry>,
}

impl InMemoryPortMapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl PortMapper for InMemoryPortMapper {
    fn add_service(
        &self,
        name: &str,
        protocol: &str,
        service_type: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) {
        self.services.insert(
            name.to_string(),
            ServiceEntry {
                name: name.to_string(),
                protocol: protocol.to_string(),
                service_type: service_type.to_string(),
                port,
                metadata,
            },
        );
    }

    fn remove_service(&self, name: &str) {
        self.services.remove(name);
    }

    fn lookup(&self, name: &str) -> Option<ServiceEntry> {
        self.services.get(name).map(|e| e.value().clone())
    }
}

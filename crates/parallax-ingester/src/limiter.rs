//! Per-tenant admission policy.
//!
//! The limiter answers two questions at push time: may this tenant create
//! another live trace, and how many bytes may a trace or request carry. The
//! live-trace limit is configured ring-wide and divided by the number of
//! healthy peers, so each instance admits only its share.

use std::sync::Arc;

use crate::config::LimitsConfig;

/// Source of the healthy-peer count, implemented by the distribution ring.
pub trait RingCount: Send + Sync {
    /// Number of healthy ingester instances in the ring.
    fn healthy_instance_count(&self) -> usize;
}

/// A fixed peer count, for single-node deployments and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticRingCount(pub usize);

impl RingCount for StaticRingCount {
    fn healthy_instance_count(&self) -> usize {
        self.0
    }
}

/// Stateless admission decider for all tenants of one instance.
pub struct Limiter {
    limits: LimitsConfig,
    ring: Arc<dyn RingCount>,
}

impl Limiter {
    /// Create a limiter over the given limits and ring view.
    pub fn new(limits: LimitsConfig, ring: Arc<dyn RingCount>) -> Self {
        Self { limits, ring }
    }

    /// The local live-trace limit for a tenant: the ring-wide limit divided
    /// across healthy peers, rounded up. Zero means unlimited.
    pub fn local_max_traces(&self, tenant: &str) -> usize {
        let global = self.limits.for_tenant(tenant).max_local_traces_per_user;
        if global == 0 {
            return 0;
        }
        let peers = self.ring.healthy_instance_count().max(1);
        global.div_ceil(peers)
    }

    /// The per-trace byte limit for a tenant. Zero means unlimited.
    pub fn max_bytes_per_trace(&self, tenant: &str) -> usize {
        self.limits.for_tenant(tenant).max_bytes_per_trace
    }

    /// The per-request byte limit for a tenant. Zero means unlimited.
    pub fn max_bytes_per_request(&self, tenant: &str) -> usize {
        self.limits.for_tenant(tenant).max_bytes_per_request
    }
}

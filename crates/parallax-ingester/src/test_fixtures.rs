//! Composable test fixtures.
//!
//! Provides ready-wired instances and ingesters over temp directories and
//! in-memory object storage, plus request builders mirroring what the
//! distributor sends.

use std::sync::Arc;
use std::time::Duration;

use object_store::memory::InMemory;
use object_store::ObjectStore;
use rstest::fixture;
use tempfile::TempDir;

use parallax_model::test_util::{make_span, make_trace, valid_trace_id};
use parallax_model::{DataEncoding, SegmentCodec};

use crate::config::{IngesterConfig, LimitsConfig};
use crate::ingester::Ingester;
use crate::instance::{PushRequest, TenantInstance};
use crate::limiter::{Limiter, StaticRingCount};
use crate::wal::{Encoding, Wal};

/// Tenant used throughout the tests.
pub const TEST_TENANT: &str = "test-tenant";

const TEST_SLACK: Duration = Duration::from_secs(120);

/// Limits with everything unlimited, the default for most tests.
#[fixture]
pub fn unlimited() -> LimitsConfig {
    LimitsConfig {
        max_local_traces_per_user: 0,
        max_bytes_per_trace: 0,
        max_bytes_per_request: 0,
        overrides: Default::default(),
    }
}

/// A tenant instance wired over temp directories.
pub struct TestInstance {
    pub instance: TenantInstance,
    pub codec: SegmentCodec,
    pub wal: Arc<Wal>,
    pub wal_dir: TempDir,
    pub blocks_dir: TempDir,
}

/// An instance with the given limits and a single healthy peer.
pub async fn instance_with_limits(limits: LimitsConfig) -> TestInstance {
    let wal_dir = tempfile::tempdir().expect("failed to create wal dir");
    let blocks_dir = tempfile::tempdir().expect("failed to create blocks dir");

    let wal = Arc::new(
        Wal::new(
            wal_dir.path(),
            Encoding::None,
            DataEncoding::V1,
            TEST_SLACK,
        )
        .await
        .expect("failed to open wal"),
    );
    let limiter = Arc::new(Limiter::new(limits, Arc::new(StaticRingCount(1))));

    let instance = TenantInstance::new(
        TEST_TENANT,
        limiter,
        wal.clone(),
        blocks_dir.path().to_path_buf(),
        Vec::new(),
        Vec::new(),
    )
    .await
    .expect("failed to create instance");

    TestInstance {
        instance,
        codec: SegmentCodec::new(DataEncoding::V1),
        wal,
        wal_dir,
        blocks_dir,
    }
}

/// An instance with everything unlimited.
pub async fn default_instance() -> TestInstance {
    instance_with_limits(unlimited()).await
}

/// An ingester wired over temp directories and in-memory object storage.
pub struct TestIngester {
    pub ingester: Arc<Ingester>,
    pub store: Arc<dyn ObjectStore>,
    pub wal_dir: TempDir,
    pub blocks_dir: TempDir,
}

/// Build an ingester over the given directories, so restarts can be
/// simulated by building a second ingester over the same paths.
pub async fn ingester_over(
    wal_dir: TempDir,
    blocks_dir: TempDir,
    limits: LimitsConfig,
) -> TestIngester {
    let config = IngesterConfig {
        wal: crate::config::WalConfig {
            path: wal_dir.path().to_path_buf(),
            blocks_path: blocks_dir.path().to_path_buf(),
            ingestion_slack_secs: TEST_SLACK.as_secs(),
        },
        limits,
        ..Default::default()
    };

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let ingester = Arc::new(
        Ingester::new(config, Arc::new(StaticRingCount(1)), store.clone())
            .await
            .expect("failed to create ingester"),
    );

    TestIngester {
        ingester,
        store,
        wal_dir,
        blocks_dir,
    }
}

/// An ingester with everything unlimited over fresh temp directories.
pub async fn default_ingester() -> TestIngester {
    let wal_dir = tempfile::tempdir().expect("failed to create wal dir");
    let blocks_dir = tempfile::tempdir().expect("failed to create blocks dir");
    ingester_over(wal_dir, blocks_dir, unlimited()).await
}

/// A one-trace push request of ten spans. An empty prefix gets a random
/// trace ID. Returns the ID alongside the request.
pub fn make_request(trace_id_prefix: &[u8]) -> (Vec<u8>, PushRequest) {
    let id = valid_trace_id(trace_id_prefix);
    let codec = SegmentCodec::new(DataEncoding::V1);
    let trace = make_trace(10, &id);
    let (start, end) = trace.span_range_secs().unwrap_or_default();
    let segment = codec.prepare_for_write(&trace, start, end);
    (id.clone(), PushRequest::new(vec![id], vec![segment]))
}

/// A one-trace request whose payload size is close to (at or slightly
/// above) `target` bytes, grown a span at a time.
pub fn request_with_byte_limit(target: usize, trace_id_prefix: &[u8]) -> (Vec<u8>, PushRequest) {
    let id = valid_trace_id(trace_id_prefix);
    let codec = SegmentCodec::new(DataEncoding::V1);

    let mut trace = make_trace(1, &id);
    while codec.prepare_for_write(&trace, 0, 0).len() < target {
        trace.batches[0].scope_spans[0].spans.push(make_span(&id));
    }

    let (start, end) = trace.span_range_secs().unwrap_or_default();
    let segment = codec.prepare_for_write(&trace, start, end);
    (id.clone(), PushRequest::new(vec![id], vec![segment]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn unlimited_is_unlimited(unlimited: LimitsConfig) {
        assert_eq!(unlimited.max_local_traces_per_user, 0);
        assert_eq!(unlimited.max_bytes_per_trace, 0);
        assert_eq!(unlimited.max_bytes_per_request, 0);
    }

    #[test]
    fn make_request_is_well_formed() {
        let (id, request) = make_request(&[]);
        assert_eq!(id.len(), 16);
        assert_eq!(request.ids.len(), 1);
        assert_eq!(request.traces.len(), 1);
        assert_eq!(request.ids[0], id);
    }

    #[test]
    fn byte_limit_requests_land_near_target() {
        for target in [300, 900, 1500] {
            let (_, request) = request_with_byte_limit(target, &[]);
            let size = request.byte_size();
            assert!(size >= target, "request of {size} bytes under {target}");
            assert!(
                size < target + 200,
                "request of {size} bytes far over {target}"
            );
        }
    }

    #[tokio::test]
    async fn instance_fixture_is_wired() {
        let env = default_instance().await;
        assert_eq!(env.instance.tenant_id(), TEST_TENANT);
        assert_eq!(env.instance.trace_count(), 0);
        assert!(env.wal_dir.path().exists());
    }
}

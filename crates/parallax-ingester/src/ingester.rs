//! The ingester host: owns per-tenant instances, the backend object store,
//! and the background loops that drive the block lifecycle.
//!
//! The host's sweep loop periodically cuts idle live traces, cuts head
//! blocks that are over age or size, rebuilds completing blocks, flushes
//! complete blocks to the backend with retry, and clears what has aged out.
//! Background failures are logged and retried on the next sweep; they never
//! take the process down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use parallax_model::{DataEncoding, Trace};

use crate::block::CompleteBlock;
use crate::config::IngesterConfig;
use crate::instance::{PushRequest, TenantInstance};
use crate::limiter::{Limiter, RingCount};
use crate::metrics;
use crate::wal::{AppendBlock, Encoding, Wal};
use crate::IngestError;

/// Calculate exponential backoff delay for retry attempts.
///
/// The delay doubles with each attempt, capped at `max_delay`.
fn backoff_delay(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let delay = initial_delay.saturating_mul(multiplier.min(u64::from(u32::MAX)) as u32);
    delay.min(max_delay)
}

/// The host process's view of the ingestion engine: many tenant instances,
/// one WAL directory, one backend store.
pub struct Ingester {
    config: IngesterConfig,
    limiter: Arc<Limiter>,
    wal: Arc<Wal>,
    store: Arc<dyn ObjectStore>,
    instances: DashMap<String, Arc<TenantInstance>>,
    /// Serialises instance creation so two pushes for a new tenant cannot
    /// race two head blocks into existence.
    create_lock: Mutex<()>,
}

impl Ingester {
    /// Create an ingester over the configured directories and the given
    /// ring view and backend store.
    pub async fn new(
        config: IngesterConfig,
        ring: Arc<dyn RingCount>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, IngestError> {
        let wal = Arc::new(
            Wal::new(
                config.wal.path.clone(),
                Encoding::None,
                DataEncoding::V1,
                config.wal.ingestion_slack(),
            )
            .await?,
        );
        tokio::fs::create_dir_all(&config.wal.blocks_path).await?;
        let limiter = Arc::new(Limiter::new(config.limits.clone(), ring));

        Ok(Self {
            config,
            limiter,
            wal,
            store,
            instances: DashMap::new(),
            create_lock: Mutex::new(()),
        })
    }

    /// Replay on-disk state from a previous run.
    ///
    /// WAL files become completing blocks and local block directories are
    /// reopened as complete (unflushed) blocks; tenant instances are created
    /// for whatever is found, and the normal sweep machinery drains it all.
    /// Returns the number of blocks recovered.
    pub async fn replay(&self) -> Result<usize, IngestError> {
        let replayed = self
            .wal
            .replay_all(self.config.lifecycle.max_block_duration())
            .await?;

        let mut completing: HashMap<String, Vec<Arc<AppendBlock>>> = HashMap::new();
        for block in replayed {
            completing
                .entry(block.tenant)
                .or_default()
                .push(Arc::new(block.block));
        }

        let mut complete: HashMap<String, Vec<Arc<CompleteBlock>>> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.config.wal.blocks_path).await?;
        while let Some(tenant_entry) = entries.next_entry().await? {
            if !tenant_entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(tenant) = tenant_entry.file_name().into_string() else {
                continue;
            };

            let mut block_dirs = tokio::fs::read_dir(tenant_entry.path()).await?;
            while let Some(block_entry) = block_dirs.next_entry().await? {
                if !block_entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = block_entry.path();
                if path.extension().is_some_and(|e| e == "corrupt") {
                    continue;
                }
                match CompleteBlock::open(&path).await {
                    Ok(block) => {
                        complete.entry(tenant.clone()).or_default().push(Arc::new(block));
                    }
                    Err(e) => {
                        let quarantined = path.with_extension("corrupt");
                        tracing::error!(
                            dir = %path.display(),
                            error = %e,
                            "quarantining unreadable block directory"
                        );
                        tokio::fs::rename(&path, &quarantined).await?;
                    }
                }
            }
        }

        let mut recovered = 0usize;
        let tenants: std::collections::HashSet<String> = completing
            .keys()
            .chain(complete.keys())
            .cloned()
            .collect();
        for tenant in tenants {
            let completing = completing.remove(&tenant).unwrap_or_default();
            let complete = complete.remove(&tenant).unwrap_or_default();
            recovered += completing.len() + complete.len();

            tracing::info!(
                tenant = %tenant,
                completing = completing.len(),
                complete = complete.len(),
                "recovered blocks for tenant"
            );
            let instance = Arc::new(
                TenantInstance::new(
                    &tenant,
                    self.limiter.clone(),
                    self.wal.clone(),
                    self.config.wal.blocks_path.clone(),
                    completing,
                    complete,
                )
                .await?,
            );
            self.instances.insert(tenant, instance);
        }

        Ok(recovered)
    }

    /// Get or create the instance for a tenant.
    pub async fn instance(&self, tenant: &str) -> Result<Arc<TenantInstance>, IngestError> {
        if let Some(instance) = self.instances.get(tenant) {
            return Ok(instance.value().clone());
        }

        let _guard = self.create_lock.lock().await;
        if let Some(instance) = self.instances.get(tenant) {
            return Ok(instance.value().clone());
        }

        let instance = Arc::new(
            TenantInstance::new(
                tenant,
                self.limiter.clone(),
                self.wal.clone(),
                self.config.wal.blocks_path.clone(),
                Vec::new(),
                Vec::new(),
            )
            .await?,
        );
        self.instances.insert(tenant.to_owned(), instance.clone());
        tracing::info!(tenant = %tenant, "created tenant instance");
        Ok(instance)
    }

    /// The instance for a tenant, if one exists.
    pub fn get_instance(&self, tenant: &str) -> Option<Arc<TenantInstance>> {
        self.instances.get(tenant).map(|i| i.value().clone())
    }

    /// Tenants with an instance.
    pub fn tenants(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    /// Push a bulk request for a tenant, creating its instance on demand.
    pub async fn push_bytes_request(
        &self,
        cancel: &CancellationToken,
        tenant: &str,
        request: PushRequest,
    ) -> Result<(), IngestError> {
        let instance = self.instance(tenant).await?;
        instance.push_bytes_request(cancel, request).await
    }

    /// Find a trace for a tenant across all in-flight states.
    pub async fn find_trace_by_id(
        &self,
        cancel: &CancellationToken,
        tenant: &str,
        trace_id: &[u8],
    ) -> Result<Option<Trace>, IngestError> {
        match self.get_instance(tenant) {
            Some(instance) => instance.find_trace_by_id(cancel, trace_id).await,
            None => Ok(None),
        }
    }

    /// Upload a complete block to the backend store.
    pub async fn write_block(&self, block: &CompleteBlock) -> Result<(), IngestError> {
        let meta = block.meta();
        let prefix = format!("tenants/{}/{}", meta.tenant_id, meta.block_id);

        let data = block.read_data().await?;
        self.store
            .put(&StorePath::from(format!("{prefix}/data")), data.into())
            .await?;
        let index = block.read_index().await?;
        self.store
            .put(&StorePath::from(format!("{prefix}/index")), index.into())
            .await?;
        let meta_bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| IngestError::JsonEncode { source: e })?;
        self.store
            .put(&StorePath::from(format!("{prefix}/meta.json")), meta_bytes.into())
            .await?;

        Ok(())
    }

    /// One sweep for one instance: cut idle traces, cut the head block if
    /// ready, then run maintenance. Errors are logged, not returned; the
    /// next sweep retries.
    pub async fn sweep_instance(&self, instance: &Arc<TenantInstance>, immediate: bool) {
        let lifecycle = &self.config.lifecycle;
        let (cutoff, max_lifetime, max_bytes) = if immediate {
            (Duration::ZERO, Duration::ZERO, 0)
        } else {
            (
                lifecycle.max_trace_idle(),
                lifecycle.max_block_duration(),
                lifecycle.max_block_bytes,
            )
        };

        if let Err(e) = instance.cut_complete_traces(cutoff, immediate).await {
            tracing::error!(
                tenant = %instance.tenant_id(),
                error = %e,
                "failed to cut complete traces"
            );
        }
        if let Err(e) = instance
            .cut_block_if_ready(max_lifetime, max_bytes, immediate)
            .await
        {
            tracing::error!(
                tenant = %instance.tenant_id(),
                error = %e,
                "failed to cut head block"
            );
        }

        self.maintain_instance(instance).await;
    }

    /// Drive the block lifecycle forward for one instance: complete every
    /// completing block, flush unflushed complete blocks, clear aged-out
    /// flushed blocks.
    pub async fn maintain_instance(&self, instance: &Arc<TenantInstance>) {
        let tenant = instance.tenant_id().to_owned();

        for block_id in instance.completing_block_ids().await {
            match instance.complete_block(block_id).await {
                Ok(()) => {
                    if let Err(e) = instance.clear_completing_block(block_id).await {
                        tracing::warn!(
                            tenant = %tenant,
                            block = %block_id,
                            error = %e,
                            "failed to clear completing block"
                        );
                    }
                }
                Err(e) => {
                    // The completing block stays in place for retry.
                    tracing::error!(
                        tenant = %tenant,
                        block = %block_id,
                        error = %e,
                        "block build failed, will retry"
                    );
                }
            }
        }

        for block in instance.blocks_to_flush().await {
            if self.flush_with_retry(&block).await {
                block.mark_flushed();
                metrics::inc_blocks_flushed(&tenant);
            }
        }

        if let Err(e) = instance
            .clear_flushed_blocks(self.config.lifecycle.complete_block_timeout())
            .await
        {
            tracing::error!(
                tenant = %tenant,
                error = %e,
                "failed to clear flushed blocks"
            );
        }
    }

    /// Write one block to the backend, retrying with exponential backoff.
    /// Returns whether the write succeeded; a failed block is retried on
    /// the next sweep and never cleared locally.
    async fn flush_with_retry(&self, block: &CompleteBlock) -> bool {
        let lifecycle = &self.config.lifecycle;
        let initial = Duration::from_millis(lifecycle.flush_initial_delay_ms);
        let max = Duration::from_millis(lifecycle.flush_max_delay_ms);

        for attempt in 0..=lifecycle.flush_max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, initial, max);
                tracing::warn!(
                    tenant = %block.meta().tenant_id,
                    block = %block.block_id(),
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    "retrying block flush after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.write_block(block).await {
                Ok(()) => {
                    tracing::info!(
                        tenant = %block.meta().tenant_id,
                        block = %block.block_id(),
                        attempts = attempt + 1,
                        "flushed block to backend"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::error!(
                        tenant = %block.meta().tenant_id,
                        block = %block.block_id(),
                        attempt = attempt,
                        error = %e,
                        "backend write failed"
                    );
                }
            }
        }
        false
    }

    /// Cut and flush everything: the graceful-shutdown path.
    pub async fn flush_all(&self) {
        let instances: Vec<_> = self.instances.iter().map(|e| e.value().clone()).collect();
        for instance in instances {
            self.sweep_instance(&instance, true).await;
        }
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        self.config.lifecycle.sweep_interval()
    }
}

/// Handle for controlling the background sweep task.
pub struct IngesterHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<()>,
}

impl IngesterHandle {
    /// Signal the sweep task to stop and wait for it to complete.
    ///
    /// Triggers one final cut-and-flush of everything before returning.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join_handle.await;
    }

    /// Abort the sweep task immediately without flushing.
    pub fn abort(self) {
        self.join_handle.abort();
    }
}

/// Start the background sweep loop for an ingester.
///
/// Every sweep interval, each tenant instance has its idle traces cut, its
/// head block cut when over age or size, completing blocks rebuilt,
/// complete blocks flushed, and aged-out blocks cleared. On shutdown a
/// final immediate sweep flushes everything.
pub fn start_background_sweep(ingester: Arc<Ingester>) -> IngesterHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let interval = ingester.sweep_interval();

    let join_handle = tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "starting ingester sweep loop"
        );

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let instances: Vec<_> =
                        ingester.instances.iter().map(|e| e.value().clone()).collect();
                    for instance in instances {
                        ingester.sweep_instance(&instance, false).await;
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("shutdown signal received, flushing all tenants");
                    ingester.flush_all().await;
                    break;
                }
            }
        }

        tracing::info!("ingester sweep loop stopped");
    });

    IngesterHandle {
        shutdown_tx: Some(shutdown_tx),
        join_handle,
    }
}

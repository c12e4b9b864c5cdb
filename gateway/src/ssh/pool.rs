use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::SshTarget;
use crate::ssh::{connect, SshClient, SshError};
use crate::vault::Vault;

/// Dials new connections; swapped for a fake in pool tests.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn SshClient>, SshError>;
}

struct RusshFactory {
    vault: Arc<dyn Vault>,
}

#[async_trait]
impl ClientFactory for RusshFactory {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn SshClient>, SshError> {
        Ok(Arc::new(connect(target, self.vault.as_ref()).await?))
    }
}

struct IdleEntry {
    client: Arc<dyn SshClient>,
    idle_since: Instant,
}

struct EndpointPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry>>,
    idle_timeout: Duration,
}

/// A checked-out client. The semaphore permit rides along so the
/// per-endpoint bound holds for exactly as long as the client is in use;
/// dropping without `put` releases the slot and discards the connection.
pub struct PooledClient {
    pub client: Arc<dyn SshClient>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient").finish_non_exhaustive()
    }
}

/// Connection pool keyed by endpoint name.
pub struct SshPool {
    factory: Arc<dyn ClientFactory>,
    endpoints: Mutex<HashMap<String, Arc<EndpointPool>>>,
}

impl SshPool {
    pub fn new(vault: Arc<dyn Vault>) -> Self {
        Self::with_factory(Arc::new(RusshFactory { vault }))
    }

    pub fn with_factory(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Check out a live client: reuse an idle one, dial a fresh one while
    /// below the endpoint's connection cap, or wait for a slot until
    /// `deadline` elapses.
    pub async fn get(
        &self,
        endpoint: &str,
        target: &SshTarget,
        deadline: Duration,
    ) -> Result<PooledClient, SshError> {
        let pool = self.endpoint_pool(endpoint, target);

        let permit = tokio::time::timeout(deadline, pool.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| SshError::MaxConns)?
            .map_err(|_| SshError::MaxConns)?;

        // Reuse idle entries newest-first; dead ones are closed and skipped.
        loop {
            let candidate = pool.idle.lock().pop();
            match candidate {
                None => break,
                Some(entry) => {
                    if entry.client.is_alive().await {
                        return Ok(PooledClient {
                            client: entry.client,
                            _permit: permit,
                        });
                    }
                    debug!(endpoint, "discarding dead pooled connection");
                    entry.client.close().await;
                }
            }
        }

        let client = self.factory.connect(target).await?;
        Ok(PooledClient {
            client,
            _permit: permit,
        })
    }

    /// Return a client to the pool. Dead clients are discarded; the permit
    /// is released either way when `pooled` drops.
    pub async fn put(&self, endpoint: &str, pooled: PooledClient) {
        let alive = pooled.client.is_alive().await;
        if !alive {
            debug!(endpoint, "dropping dead connection instead of pooling");
            pooled.client.close().await;
            return;
        }
        if let Some(pool) = self.endpoints.lock().get(endpoint).cloned() {
            pool.idle.lock().push(IdleEntry {
                client: pooled.client.clone(),
                idle_since: Instant::now(),
            });
        }
    }

    /// Close idle entries that outlived their endpoint's idle timeout.
    pub async fn cleanup_idle(&self) {
        self.cleanup_idle_at(Instant::now()).await;
    }

    async fn cleanup_idle_at(&self, now: Instant) {
        let pools: Vec<Arc<EndpointPool>> = self.endpoints.lock().values().cloned().collect();
        for pool in pools {
            let expired: Vec<IdleEntry> = {
                let mut idle = pool.idle.lock();
                let (keep, expired): (Vec<_>, Vec<_>) = idle.drain(..).partition(|entry| {
                    now.duration_since(entry.idle_since) < pool.idle_timeout
                });
                *idle = keep;
                expired
            };
            for entry in expired {
                entry.client.close().await;
            }
        }
    }

    fn endpoint_pool(&self, endpoint: &str, target: &SshTarget) -> Arc<EndpointPool> {
        let mut endpoints = self.endpoints.lock();
        endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointPool {
                    semaphore: Arc::new(Semaphore::new(target.max_conns)),
                    idle: Mutex::new(Vec::new()),
                    idle_timeout: target.idle_timeout,
                })
            })
            .clone()
    }
}

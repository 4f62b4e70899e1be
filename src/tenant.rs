//! Bounds how many operations run concurrently per tenant.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    config::TenantConfig,
    error::{Error, Result},
};

/// Hands out one permit per tenant operation, at most `max_sessions` at a time for each
/// tenant. Waiting longer than the configured timeout is a server error.
#[derive(Debug, Clone)]
pub struct TenantSessionCoordinator {
    config: TenantConfig,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

/// Held for the duration of a tenant operation. Dropping it releases the slot.
#[derive(Debug)]
pub struct TenantSessionGuard {
    tenant_id: String,
    _permit: OwnedSemaphorePermit,
}

impl TenantSessionGuard {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl TenantSessionCoordinator {
    pub fn new(config: TenantConfig) -> Self {
        Self {
            config,
            semaphores: Default::default(),
        }
    }

    pub async fn acquire(&self, tenant_id: &str) -> Result<TenantSessionGuard> {
        if self.config.max_sessions == 0 {
            return Err(Error::server("tenant max_sessions must be at least 1"));
        }
        let semaphore = self
            .semaphores
            .lock()
            .await
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_sessions)))
            .clone();

        let timeout = Duration::from_millis(self.config.session_acquire_timeout_ms);
        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::server("tenant semaphore was closed")),
            Err(_) => {
                warn!(tenant = tenant_id, "timed out waiting for a tenant session");
                return Err(Error::server(format!(
                    "timed out after {}ms waiting for a session of tenant '{tenant_id}'",
                    self.config.session_acquire_timeout_ms
                )));
            }
        };
        debug!(tenant = tenant_id, "acquired tenant session");
        Ok(TenantSessionGuard {
            tenant_id: tenant_id.to_string(),
            _permit: permit,
        })
    }

    /// Permits currently free for `tenant_id`.
    pub async fn available(&self, tenant_id: &str) -> usize {
        self.semaphores
            .lock()
            .await
            .get(tenant_id)
            .map(|s| s.available_permits())
            .unwrap_or(self.config.max_sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(max_sessions: usize) -> TenantSessionCoordinator {
        TenantSessionCoordinator::new(TenantConfig {
            max_sessions,
            session_acquire_timeout_ms: 50,
        })
    }

    #[tokio::test]
    async fn guard_drop_releases() {
        let coordinator = coordinator(1);
        let guard = coordinator.acquire("acme").await.unwrap();
        assert_eq!(guard.tenant_id(), "acme");
        assert_eq!(coordinator.available("acme").await, 0);

        let err = coordinator.acquire("acme").await.unwrap_err();
        assert!(err.is_server());

        // Other tenants are not affected.
        let _other = coordinator.acquire("globex").await.unwrap();

        drop(guard);
        assert_eq!(coordinator.available("acme").await, 1);
        coordinator.acquire("acme").await.unwrap();
    }

    #[tokio::test]
    async fn waiters_get_released_slots() {
        let coordinator = TenantSessionCoordinator::new(TenantConfig {
            max_sessions: 1,
            session_acquire_timeout_ms: 2_000,
        });
        let guard = coordinator.acquire("acme").await.unwrap();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.acquire("acme").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
    }
}

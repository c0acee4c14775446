//! Hypervisor session supervisor
//!
//! Owns the single transport to the hypervisor daemon. Holding the guard
//! returned by [`Session::acquire`] is the exclusive right to issue RPCs; a
//! stale transport is discarded and replaced before the guard is handed out.

use crate::hypervisor::{Connector, Hypervisor};
use kvmdeck_common::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Exclusive access to the live transport. The guard owns its share of the
/// slot, so futures holding it stay `Send + 'static`.
pub type Transport = OwnedMappedMutexGuard<Option<Box<dyn Hypervisor>>, Box<dyn Hypervisor>>;

#[derive(Clone)]
pub struct Session {
    connector: Arc<dyn Connector>,
    slot: Arc<Mutex<Option<Box<dyn Hypervisor>>>>,
    connect_timeout: Duration,
    connects: Arc<AtomicU64>,
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            slot: Arc::new(Mutex::new(None)),
            connect_timeout,
            connects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for exclusive access, checking and if needed re-establishing the
    /// transport first. A failed reconnect is returned, never retried.
    pub async fn acquire(&self) -> Result<Transport> {
        let mut slot = self.slot.clone().lock_owned().await;

        let alive = match slot.as_ref() {
            Some(transport) => match timeout(self.connect_timeout, transport.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Hypervisor liveness check failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!("Hypervisor liveness check timed out");
                    false
                }
            },
            None => false,
        };

        if !alive {
            if let Some(stale) = slot.take() {
                debug!("Discarding stale hypervisor transport");
                stale.close().await;
            }
            let fresh = self.connect().await?;
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Hypervisor session established (connection #{})", n);
            *slot = Some(fresh);
        }

        OwnedMutexGuard::try_map(slot, |s| s.as_mut())
            .map_err(|_| Error::Connectivity("hypervisor transport unavailable".to_string()))
    }

    async fn connect(&self) -> Result<Box<dyn Hypervisor>> {
        match timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) if e.kind() == ErrorKind::Connectivity => Err(e),
            Ok(Err(e)) => Err(Error::Connectivity(format!("reconnect failed: {}", e))),
            Err(_) => Err(Error::Connectivity(format!(
                "reconnect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Number of transports established so far
    pub fn connection_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Release the transport at process shutdown
    pub async fn close(&self) {
        if let Some(transport) = self.slot.lock().await.take() {
            transport.close().await;
            info!("Hypervisor session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHypervisor;
    use kvmdeck_common::ErrorKind;

    #[tokio::test]
    async fn test_first_acquire_connects() {
        let fake = FakeHypervisor::new();
        let session = fake.session();
        assert_eq!(session.connection_count(), 0);

        session.acquire().await.unwrap().ping().await.unwrap();
        session.acquire().await.unwrap();
        assert_eq!(session.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_transport_is_replaced() {
        let fake = FakeHypervisor::new();
        let session = fake.session();
        session.acquire().await.unwrap();

        fake.break_connections();
        let transport = session.acquire().await.unwrap();
        transport.ping().await.unwrap();
        drop(transport);

        assert_eq!(session.connection_count(), 2);
        assert_eq!(fake.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_connectivity_error() {
        let fake = FakeHypervisor::new();
        let session = fake.session();
        session.acquire().await.unwrap();

        fake.break_connections();
        fake.refuse_connections(true);
        let err = session.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Connectivity);

        fake.refuse_connections(false);
        assert!(session.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_guard_moves_into_spawned_tasks() {
        let session = FakeHypervisor::new().session();
        let handle = tokio::spawn(async move {
            let hv = session.acquire().await?;
            hv.ping().await?;
            hv.hostname().await
        });
        assert_eq!(handle.await.unwrap().unwrap(), "fakehost");
    }

    #[tokio::test]
    async fn test_callers_are_serialized() {
        let fake = FakeHypervisor::new();
        let session = fake.session();

        let mut handles = Vec::new();
        for i in 0..8 {
            let session = session.clone();
            let fake = fake.clone();
            handles.push(tokio::spawn(async move {
                let _transport = session.acquire().await.unwrap();
                fake.enter();
                tokio::time::sleep(Duration::from_millis(5)).await;
                fake.leave();
                i
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(fake.max_concurrency(), 1);
    }
}

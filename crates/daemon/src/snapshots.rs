//! Snapshot operations and the revert-to-new-instance transaction

use crate::clone::Cloner;
use crate::saga::Saga;
use crate::session::Session;
use kvmdeck_common::definition::{parse_snapshot, snapshot_document};
use kvmdeck_common::validate::validate_name;
use kvmdeck_common::{CreateSnapshotRequest, Error, Result, Snapshot};
use std::sync::Arc;
use tracing::info;

pub struct Snapshots {
    session: Session,
    cloner: Arc<dyn Cloner>,
}

impl Snapshots {
    pub fn new(session: Session, cloner: Arc<dyn Cloner>) -> Self {
        Self { session, cloner }
    }

    /// Snapshots of `name`, oldest first
    pub async fn list(&self, name: &str) -> Result<Vec<Snapshot>> {
        let hv = self.session.acquire().await?;
        let current = hv.current_snapshot(name).await?;
        let mut out = Vec::new();
        for snapshot in hv.list_snapshots(name).await? {
            let meta = parse_snapshot(&hv.snapshot_xml(name, &snapshot).await?)?;
            out.push(Snapshot {
                is_current: current.as_deref() == Some(snapshot.as_str()),
                name: snapshot,
                description: meta.description,
                state: meta.state,
                created_at: meta.created_at,
            });
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    pub async fn create(&self, name: &str, req: &CreateSnapshotRequest) -> Result<()> {
        validate_name("snapshot", &req.name)?;
        let hv = self.session.acquire().await?;
        if hv.list_snapshots(name).await?.contains(&req.name) {
            return Err(Error::conflict("snapshot", req.name.as_str()));
        }
        hv.create_snapshot(name, &snapshot_document(&req.name, &req.description))
            .await?;
        info!("Created snapshot {} of {}", req.name, name);
        Ok(())
    }

    pub async fn delete(&self, name: &str, snapshot: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        hv.delete_snapshot(name, snapshot).await?;
        info!("Deleted snapshot {} of {}", snapshot, name);
        Ok(())
    }

    pub async fn revert(&self, name: &str, snapshot: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        hv.revert_snapshot(name, snapshot).await?;
        info!("Reverted {} to {}", name, snapshot);
        Ok(())
    }

    /// Clone `source` as it was at `snapshot` into `new_name`.
    ///
    /// The source is reverted to `snapshot` for the clone and always returned
    /// to the snapshot that was current before. When the clone fails the
    /// restore happens before the error is returned; after a successful clone
    /// a failed restore is only logged.
    pub async fn revert_to_new_instance(&self, source: &str, snapshot: &str, new_name: &str) -> Result<()> {
        validate_name("machine", new_name)?;

        let original = {
            let hv = self.session.acquire().await?;
            let state = hv.domain_state(source).await?;
            if !state.is_offline() {
                return Err(Error::Precondition(format!(
                    "{} must be shut off to clone from a snapshot, it is {}",
                    source, state
                )));
            }
            if !hv.list_snapshots(source).await?.iter().any(|s| s == snapshot) {
                return Err(Error::not_found("snapshot", snapshot));
            }
            if hv.list_domains().await?.iter().any(|d| d == new_name) {
                return Err(Error::conflict("machine", new_name));
            }
            let original = hv.current_snapshot(source).await?.ok_or_else(|| {
                Error::Precondition(format!("{} has no current snapshot to return to", source))
            })?;
            hv.revert_snapshot(source, snapshot).await?;
            info!("Reverted {} to {} for cloning", source, snapshot);
            original
        };

        let mut saga = Saga::new("revert to new instance");
        let session = self.session.clone();
        let machine = source.to_string();
        saga.always("revert source", async move {
            let hv = session.acquire().await?;
            let state = hv.domain_state(&machine).await?;
            if !state.is_offline() {
                return Err(Error::Precondition(format!(
                    "{} left the shut off state during the clone",
                    machine
                )));
            }
            hv.revert_snapshot(&machine, &original).await?;
            info!("Restored {} to {}", machine, original);
            Ok::<(), Error>(())
        });

        // Cloning copies whole disks; the session stays free meanwhile
        if let Err(e) = self.cloner.clone_machine(source, new_name).await {
            return Err(saga.abort("clone", e).await);
        }

        let defined = async {
            let hv = self.session.acquire().await?;
            Ok::<bool, Error>(hv.list_domains().await?.iter().any(|d| d == new_name))
        }
        .await;
        match defined {
            Ok(true) => {}
            Ok(false) => {
                let missing = Error::Clone(format!("{} is not defined after cloning", new_name));
                return Err(saga.abort("verify clone", missing).await);
            }
            Err(e) => return Err(saga.abort("verify clone", e).await),
        }

        saga.complete().await;
        info!("Created {} from {} at {}", new_name, source, snapshot);
        Ok(())
    }
}

//! Disk image allocation

use async_trait::async_trait;
use kvmdeck_common::{Error, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Allocates backing files for new machines
#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn create(&self, path: &Path, size_gib: u64) -> Result<()>;
}

/// qemu-img backed allocation
pub struct QemuImg {
    binary: String,
}

impl QemuImg {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    async fn create(&self, path: &Path, size_gib: u64) -> Result<()> {
        let size = format!("{}G", size_gib);
        debug!("{} create -f qcow2 {} {}", self.binary, path.display(), size);

        let output = Command::new(&self.binary)
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg(path)
            .arg(&size)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Storage(format!("{} failed to start: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(Error::Storage(format!(
                "{} failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!("Allocated {} ({})", path.display(), size);
        Ok(())
    }
}

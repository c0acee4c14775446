//! External clone utility

use async_trait::async_trait;
use kvmdeck_common::{Error, Result};
use tokio::process::Command;
use tracing::info;

/// Copies a shut-off machine, disks included, under a new name
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn clone_machine(&self, source: &str, new_name: &str) -> Result<()>;
}

/// virt-clone invoked as an opaque subprocess
pub struct VirtClone {
    binary: String,
    uri: String,
}

impl VirtClone {
    pub fn new(binary: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            uri: uri.into(),
        }
    }
}

#[async_trait]
impl Cloner for VirtClone {
    async fn clone_machine(&self, source: &str, new_name: &str) -> Result<()> {
        info!("Cloning {} to {}", source, new_name);
        let output = Command::new(&self.binary)
            .args(["--connect", &self.uri])
            .args(["--original", source, "--name", new_name, "--auto-clone"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Clone(format!("{} failed to start: {}", self.binary, e)))?;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if text.is_empty() {
                text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(Error::Clone(text));
        }

        info!("Clone {} finished", new_name);
        Ok(())
    }
}

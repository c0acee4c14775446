//! Storage pools, their volumes and installation media

use crate::config::StorageConfig;
use crate::hypervisor::Hypervisor;
use crate::session::Session;
use kvmdeck_common::resources::{self, gib_ceil, gib_floor};
use kvmdeck_common::validate::{contained_path, validate_name};
use kvmdeck_common::{
    CreateStoragePoolRequest, CreateVolumeRequest, Error, ErrorKind, IsoFile, Result, StoragePool,
    StorageVolume,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_VOLUME_GIB: u64 = 20;
const VOLUME_FORMATS: [&str; 4] = ["qcow2", "raw", "vmdk", "vdi"];

pub struct Storage {
    session: Session,
    config: StorageConfig,
}

async fn describe_pool(hv: &dyn Hypervisor, name: &str) -> Result<StoragePool> {
    let info = hv.pool_info(name).await?;
    let meta = resources::parse_pool(&hv.pool_xml(name).await?)?;
    let mut pool = StoragePool {
        name: name.to_string(),
        uuid: meta.uuid,
        active: info.active,
        kind: meta.kind,
        path: meta.path,
        capacity: 0,
        allocation: 0,
        available: 0,
    };
    if info.active {
        pool.capacity = gib_ceil(info.capacity);
        pool.allocation = gib_ceil(info.allocation);
        pool.available = gib_floor(info.available);
    }
    Ok(pool)
}

/// Target directory of a new pool, which must sit under `root`
pub fn pool_path(root: &Path, images: &Path, req: &CreateStoragePoolRequest) -> Result<PathBuf> {
    validate_name("pool", &req.name)?;
    let requested = if req.path.is_empty() {
        images.join(&req.name).display().to_string()
    } else {
        req.path.clone()
    };
    contained_path(root, &requested)
}

/// Name, capacity and format of a new volume after defaults
pub fn plan_volume(req: &CreateVolumeRequest) -> Result<(u64, &str)> {
    validate_name("volume", &req.name)?;
    validate_name("pool", &req.pool)?;
    let capacity = if req.capacity == 0 {
        DEFAULT_VOLUME_GIB
    } else {
        req.capacity
    };
    let format = if req.format.is_empty() {
        "qcow2"
    } else {
        req.format.as_str()
    };
    if !VOLUME_FORMATS.contains(&format) {
        return Err(Error::Validation(format!("invalid format: {}", format)));
    }
    Ok((capacity, format))
}

fn is_iso(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".iso")
}

impl Storage {
    pub fn new(session: Session, config: StorageConfig) -> Self {
        Self { session, config }
    }

    pub async fn list_pools(&self) -> Result<Vec<StoragePool>> {
        let hv = self.session.acquire().await?;
        let mut out = Vec::new();
        for name in hv.list_pools().await? {
            match describe_pool(&**hv, &name).await {
                Ok(pool) => out.push(pool),
                Err(e) if e.kind() == ErrorKind::Connectivity => return Err(e),
                Err(e) => debug!("Skipping pool {}: {}", name, e),
            }
        }
        Ok(out)
    }

    pub async fn start_pool(&self, name: &str) -> Result<()> {
        self.session.acquire().await?.start_pool(name).await?;
        info!("Started pool {}", name);
        Ok(())
    }

    pub async fn stop_pool(&self, name: &str) -> Result<()> {
        self.session.acquire().await?.stop_pool(name).await?;
        info!("Stopped pool {}", name);
        Ok(())
    }

    /// Stop if active, then remove the definition; volumes stay on disk
    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        if let Err(e) = hv.stop_pool(name).await {
            if e.kind() == ErrorKind::NotFound {
                return Err(e);
            }
            debug!("Pool {} was not active: {}", name, e);
        }
        hv.undefine_pool(name).await?;
        info!("Deleted pool {}", name);
        Ok(())
    }

    /// Define a directory pool; it stays inactive until started
    pub async fn create_pool(&self, req: &CreateStoragePoolRequest) -> Result<()> {
        let path = pool_path(&self.config.pool_root, &self.config.storage_root, req)?;
        let xml = resources::dir_pool_document(&req.name, &path.display().to_string());
        self.session.acquire().await?.define_pool(&xml).await?;
        info!("Defined pool {} at {}", req.name, path.display());
        Ok(())
    }

    /// Volumes of a pool after a rescan of its target
    pub async fn list_volumes(&self, pool: &str) -> Result<Vec<StorageVolume>> {
        let hv = self.session.acquire().await?;
        if let Err(e) = hv.refresh_pool(pool).await {
            if e.kind() == ErrorKind::NotFound {
                return Err(e);
            }
            debug!("Refresh of pool {} failed: {}", pool, e);
        }
        let mut out = Vec::new();
        for name in hv.list_volumes(pool).await? {
            match hv.volume_info(pool, &name).await {
                Ok(info) => out.push(StorageVolume {
                    name,
                    path: info.path,
                    kind: resources::volume_kind(info.kind).to_string(),
                    capacity: gib_ceil(info.capacity),
                    allocation: gib_ceil(info.allocation),
                }),
                Err(e) if e.kind() == ErrorKind::Connectivity => return Err(e),
                Err(e) => debug!("Skipping volume {}: {}", name, e),
            }
        }
        Ok(out)
    }

    pub async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<()> {
        let (capacity, format) = plan_volume(req)?;
        let xml = resources::volume_document(&req.name, capacity, format);
        self.session
            .acquire()
            .await?
            .create_volume(&req.pool, &xml)
            .await?;
        info!("Created volume {} ({} GiB {}) in {}", req.name, capacity, format, req.pool);
        Ok(())
    }

    pub async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.session.acquire().await?.delete_volume(pool, name).await?;
        info!("Deleted volume {} from {}", name, pool);
        Ok(())
    }

    /// Installation images in the media root; the root is created if missing
    pub async fn list_isos(&self) -> Result<Vec<IsoFile>> {
        let root = &self.config.media_root;
        tokio::fs::create_dir_all(root).await?;
        let mut entries = tokio::fs::read_dir(root).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() && is_iso(&name) => meta,
                _ => continue,
            };
            out.push(IsoFile {
                path: root.join(&name).display().to_string(),
                name,
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Remove one image by bare file name
    pub async fn delete_iso(&self, name: &str) -> Result<()> {
        if name.contains('/') || name.starts_with('.') || !is_iso(name) {
            return Err(Error::Validation(format!("not an iso file: {}", name)));
        }
        let path = self.config.media_root.join(name);
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("iso", name),
            _ => e.into(),
        })?;
        info!("Deleted {}", path.display());
        Ok(())
    }
}

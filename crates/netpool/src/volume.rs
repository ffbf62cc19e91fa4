//! Volumes and export device slots

use pool_store::{
    ExportDevice, PoolStore, PoolTransaction, Record, Volume, VolumeAttachment, VolumeId,
};
use tracing::{debug, info, warn};

use crate::allocator::{Allocator, Claimable, Pool};
use crate::error::{PoolError, Result};

#[derive(Debug, Clone)]
pub struct VolumeManager<S: PoolStore> {
    allocator: Allocator<S>,
}

impl<S: PoolStore> VolumeManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            allocator: Allocator::new(store),
        }
    }

    pub async fn create(&self, project_id: Option<String>, size_gb: u32) -> Result<Volume> {
        let mut tx = self.allocator.store().begin().await?;
        let volume = tx.insert(Volume::new(project_id, size_gb))?;
        tx.commit().await?;
        info!(volume_id = volume.id, size_gb, "Created volume");
        Ok(volume)
    }

    pub async fn get(&self, volume_id: VolumeId) -> Result<Volume> {
        let tx = self.allocator.store().begin().await?;
        tx.get::<Volume>(&volume_id)?
            .ok_or_else(|| not_found(volume_id))
    }

    /// Delete the volume and free its export device in the same transaction
    pub async fn destroy(&self, volume_id: VolumeId) -> Result<()> {
        let mut tx = self.allocator.store().begin().await?;
        tx.lock::<Volume>(&volume_id)
            .await?
            .ok_or_else(|| not_found(volume_id))?;

        let bound = tx.filter::<ExportDevice, _>(|row| row.volume_id == Some(volume_id))?;
        for candidate in bound {
            let Some(mut device) = tx.lock::<ExportDevice>(&candidate.key()).await? else {
                continue;
            };
            if device.volume_id == Some(volume_id) {
                debug!(volume_id, shelf = device.shelf_id, blade = device.blade_id, "Releasing export device");
                device.volume_id = None;
                tx.update(device)?;
            }
        }
        tx.delete::<Volume>(&volume_id)?;
        tx.commit().await?;
        info!(volume_id, "Destroyed volume");
        Ok(())
    }

    /// Add `shelves` x `blades_per_shelf` free export devices
    pub async fn add_export_devices(&self, shelves: u16, blades_per_shelf: u16) -> Result<usize> {
        let mut tx = self.allocator.store().begin().await?;
        let mut count = 0;
        for shelf_id in 0..shelves {
            for blade_id in 0..blades_per_shelf {
                tx.insert(ExportDevice::new(shelf_id, blade_id))?;
                count += 1;
            }
        }
        tx.commit().await?;
        info!(shelves, blades_per_shelf, count, "Added export devices");
        Ok(count)
    }

    /// Bind a free export device to the volume.
    ///
    /// A volume holds at most one device: when it already has one, that
    /// device is returned and nothing is claimed. The volume row stays locked
    /// for the whole claim so concurrent calls for one volume serialize.
    pub async fn allocate_shelf_and_blade(&self, volume_id: VolumeId) -> Result<(u16, u16)> {
        let mut tx = self.allocator.store().begin().await?;
        tx.lock::<Volume>(&volume_id)
            .await?
            .ok_or_else(|| not_found(volume_id))?;

        if let Some(bound) = tx.find::<ExportDevice, _>(|row| row.volume_id == Some(volume_id))? {
            tx.rollback().await?;
            debug!(volume_id, shelf = bound.shelf_id, blade = bound.blade_id, "Volume already has an export device");
            return Ok((bound.shelf_id, bound.blade_id));
        }

        let Some(mut device) = tx
            .select_for_update::<ExportDevice, _>(|row| row.is_free())
            .await?
        else {
            tx.rollback().await?;
            warn!(pool = %Pool::ExportDevices, volume_id, "Pool exhausted");
            return Err(Pool::ExportDevices.exhausted());
        };
        device.volume_id = Some(volume_id);
        tx.update(device.clone())?;
        tx.commit().await?;
        info!(volume_id, shelf = device.shelf_id, blade = device.blade_id, "Allocated export device");
        Ok((device.shelf_id, device.blade_id))
    }

    /// Export device bound to the volume
    pub async fn shelf_and_blade(&self, volume_id: VolumeId) -> Result<(u16, u16)> {
        let tx = self.allocator.store().begin().await?;
        let device = tx
            .find::<ExportDevice, _>(|row| row.volume_id == Some(volume_id))?
            .ok_or_else(|| {
                PoolError::NotFound(format!("export device for volume {}", volume_id))
            })?;
        Ok((device.shelf_id, device.blade_id))
    }

    pub async fn attach(&self, volume_id: VolumeId, instance_id: &str, mountpoint: &str) -> Result<Volume> {
        let volume = self
            .set_attachment(
                volume_id,
                VolumeAttachment::Attached {
                    instance_id: instance_id.to_string(),
                    mountpoint: mountpoint.to_string(),
                },
            )
            .await?;
        info!(volume_id, instance_id, mountpoint, "Attached volume");
        Ok(volume)
    }

    pub async fn detach(&self, volume_id: VolumeId) -> Result<Volume> {
        let volume = self
            .set_attachment(volume_id, VolumeAttachment::Detached)
            .await?;
        info!(volume_id, "Detached volume");
        Ok(volume)
    }

    async fn set_attachment(&self, volume_id: VolumeId, attachment: VolumeAttachment) -> Result<Volume> {
        self.allocator
            .modify_one(
                |row: &Volume| row.id == volume_id,
                |row: &mut Volume| {
                    row.attachment = attachment;
                    Ok(())
                },
            )
            .await?
            .ok_or_else(|| not_found(volume_id))
    }
}

fn not_found(volume_id: VolumeId) -> PoolError {
    PoolError::NotFound(format!("volume {}", volume_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_store::{AttachStatus, MemoryPoolStore, VolumeStatus};

    async fn manager_with_devices(shelves: u16, blades: u16) -> VolumeManager<MemoryPoolStore> {
        let manager = VolumeManager::new(MemoryPoolStore::new());
        manager.add_export_devices(shelves, blades).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_allocate_shelf_and_blade_until_exhausted() {
        let manager = manager_with_devices(1, 2).await;
        let a = manager.create(None, 1).await.unwrap();
        let b = manager.create(None, 1).await.unwrap();
        let c = manager.create(None, 1).await.unwrap();

        assert_eq!(manager.allocate_shelf_and_blade(a.id).await.unwrap(), (0, 0));
        assert_eq!(manager.allocate_shelf_and_blade(b.id).await.unwrap(), (0, 1));
        assert!(matches!(
            manager.allocate_shelf_and_blade(c.id).await,
            Err(PoolError::NoMoreBlades)
        ));

        assert_eq!(manager.shelf_and_blade(b.id).await.unwrap(), (0, 1));
        assert!(matches!(
            manager.shelf_and_blade(c.id).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_twice_keeps_one_device() {
        let manager = manager_with_devices(1, 2).await;
        let volume = manager.create(None, 1).await.unwrap();

        let first = manager.allocate_shelf_and_blade(volume.id).await.unwrap();
        let second = manager.allocate_shelf_and_blade(volume.id).await.unwrap();
        assert_eq!(first, (0, 0));
        assert_eq!(second, first);

        manager.destroy(volume.id).await.unwrap();

        // Both slots are free again
        let a = manager.create(None, 1).await.unwrap();
        let b = manager.create(None, 1).await.unwrap();
        assert_eq!(manager.allocate_shelf_and_blade(a.id).await.unwrap(), (0, 0));
        assert_eq!(manager.allocate_shelf_and_blade(b.id).await.unwrap(), (0, 1));
    }

    #[tokio::test]
    async fn test_allocate_for_unknown_volume() {
        let manager = manager_with_devices(1, 1).await;
        assert!(matches!(
            manager.allocate_shelf_and_blade(42).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_releases_export_device() {
        let manager = manager_with_devices(1, 1).await;
        let first = manager.create(Some("proj-a".to_string()), 10).await.unwrap();
        manager.allocate_shelf_and_blade(first.id).await.unwrap();

        manager.destroy(first.id).await.unwrap();
        assert!(matches!(manager.get(first.id).await, Err(PoolError::NotFound(_))));

        let second = manager.create(None, 5).await.unwrap();
        assert_eq!(manager.allocate_shelf_and_blade(second.id).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_attach_detach_move_together() {
        let manager = manager_with_devices(1, 1).await;
        let volume = manager.create(None, 1).await.unwrap();
        assert_eq!(volume.status(), VolumeStatus::Available);

        // Re-attaching and re-detaching keep both statuses consistent
        for _ in 0..2 {
            let attached = manager.attach(volume.id, "i-1", "/dev/vdb").await.unwrap();
            assert_eq!(attached.status(), VolumeStatus::InUse);
            assert_eq!(attached.attach_status(), AttachStatus::Attached);
            assert_eq!(attached.attachment.instance_id(), Some("i-1"));
            assert_eq!(attached.attachment.mountpoint(), Some("/dev/vdb"));
        }
        for _ in 0..2 {
            let detached = manager.detach(volume.id).await.unwrap();
            assert_eq!(detached.status(), VolumeStatus::Available);
            assert_eq!(detached.attach_status(), AttachStatus::Detached);
            assert_eq!(detached.attachment.instance_id(), None);
            assert_eq!(detached.attachment.mountpoint(), None);
        }
    }

    #[tokio::test]
    async fn test_attach_unknown_volume() {
        let manager = manager_with_devices(0, 0).await;
        assert!(matches!(
            manager.attach(7, "i-1", "/dev/vdb").await,
            Err(PoolError::NotFound(_))
        ));
    }
}

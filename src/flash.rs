//! Flash partition collaborator interface
//!
//! Two images: the running image (read-only to the core) and the update
//! partition (written during OTA, then marked bootable). Implementations use
//! interior mutability; the OTA worker holds a shared handle while a delta
//! session is applying and nothing else touches the update partition.

use std::io;

/// Flash access contract consumed by the OTA pipeline
pub trait Flash: Send + Sync {
    /// Size of the update partition in bytes
    fn update_capacity(&self) -> u32;

    /// Size of the running image in bytes
    fn running_size(&self) -> u32;

    /// Read from the running image at `offset`
    fn read_running(&self, offset: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Open the update partition for writing (erases previous content)
    fn begin_update(&self) -> io::Result<()>;

    /// Write to the update partition at `offset`
    fn write_update(&self, offset: u32, data: &[u8]) -> io::Result<()>;

    /// Close the update partition after a complete write
    fn end_update(&self) -> io::Result<()>;

    /// Abandon an open update; the running image stays bootable
    fn abort_update(&self);

    /// Mark the update partition as the boot target
    fn set_boot_target(&self) -> io::Result<()>;
}

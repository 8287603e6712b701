//! OTA update pipeline
//!
//! Session-oriented chunked receiver with two paths: full images stream
//! straight to the update partition under a running CRC; delta updates feed
//! a ring buffer consumed by a background worker that patches the running
//! image into the update partition. The worker shares nothing with the loop
//! beyond the ring and two atomic completion cells.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::patch::{self, FlashSource, FlashTarget};
use crate::ring::{byte_ring, RingConsumer, RingProducer};

/// Delta patch ring capacity
pub const RING_CAPACITY: usize = 8192;

/// How long the producer waits for ring space before reporting failure
const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// OTA session states, including terminal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaStatus {
    Idle = 0,
    Receiving = 1,
    Validating = 2,
    Applying = 3,
    Success = 4,
    ErrorSpace = 5,
    ErrorCrc = 6,
    ErrorFlash = 7,
}

impl OtaStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => OtaStatus::Receiving,
            2 => OtaStatus::Validating,
            3 => OtaStatus::Applying,
            4 => OtaStatus::Success,
            5 => OtaStatus::ErrorSpace,
            6 => OtaStatus::ErrorCrc,
            7 => OtaStatus::ErrorFlash,
            _ => OtaStatus::Idle,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            OtaStatus::ErrorSpace | OtaStatus::ErrorCrc | OtaStatus::ErrorFlash
        )
    }
}

/// Completion cells published by the delta worker
struct DeltaShared {
    complete: AtomicBool,
    result: AtomicU8,
}

/// OTA service owning the session state machine
pub struct OtaService {
    flash: Arc<dyn Flash>,
    status: OtaStatus,

    expected_size: u32,
    expected_crc: u32,
    received: u32,
    hasher: crc32fast::Hasher,

    is_delta: bool,
    source_crc: u32,
    producer: Option<RingProducer>,
    consumer: Option<RingConsumer>,
    shared: Arc<DeltaShared>,
    worker: Option<JoinHandle<()>>,
}

impl OtaService {
    pub fn new(flash: Arc<dyn Flash>) -> Self {
        Self {
            flash,
            status: OtaStatus::Idle,
            expected_size: 0,
            expected_crc: 0,
            received: 0,
            hasher: crc32fast::Hasher::new(),
            is_delta: false,
            source_crc: 0,
            producer: None,
            consumer: None,
            shared: Arc::new(DeltaShared {
                complete: AtomicBool::new(false),
                result: AtomicU8::new(OtaStatus::Idle as u8),
            }),
            worker: None,
        }
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }

    /// Advertised CRC of the running image for the active delta session
    pub fn source_crc(&self) -> u32 {
        self.source_crc
    }

    /// CAN ingestion must pause while the update partition is being written
    /// from finalize onward
    pub fn needs_pause(&self) -> bool {
        matches!(self.status, OtaStatus::Applying | OtaStatus::Validating)
    }

    // ========================================================================
    // Session start
    // ========================================================================

    /// Begin a full-image session: `expected_size` bytes with CRC-32
    /// `expected_crc` will stream directly to the update partition.
    pub fn start_full(&mut self, expected_size: u32, expected_crc: u32) -> Result<()> {
        if self.status != OtaStatus::Idle {
            return Err(Error::Ota("update already in progress".into()));
        }
        if expected_size > self.flash.update_capacity() {
            return Err(Error::Ota(format!(
                "firmware too large: {} > {}",
                expected_size,
                self.flash.update_capacity()
            )));
        }

        self.flash
            .begin_update()
            .map_err(|e| Error::Ota(format!("flash begin failed: {}", e)))?;

        self.expected_size = expected_size;
        self.expected_crc = expected_crc;
        self.received = 0;
        self.hasher = crc32fast::Hasher::new();
        self.is_delta = false;
        self.status = OtaStatus::Receiving;

        log::info!("full update started: {} bytes", expected_size);
        Ok(())
    }

    /// Begin a delta session: a patch of `patch_size` bytes against the
    /// running image (advertising CRC `source_crc`) will arrive via the ring.
    pub fn start_delta(&mut self, patch_size: u32, source_crc: u32) -> Result<()> {
        if self.status != OtaStatus::Idle {
            return Err(Error::Ota("update already in progress".into()));
        }

        self.flash
            .begin_update()
            .map_err(|e| Error::Ota(format!("flash begin failed: {}", e)))?;

        let (producer, consumer) = byte_ring(RING_CAPACITY);
        self.producer = Some(producer);
        self.consumer = Some(consumer);

        self.expected_size = patch_size;
        self.source_crc = source_crc;
        self.received = 0;
        self.is_delta = true;
        self.shared = Arc::new(DeltaShared {
            complete: AtomicBool::new(false),
            result: AtomicU8::new(OtaStatus::Idle as u8),
        });
        self.status = OtaStatus::Receiving;

        log::info!("delta update started: {} byte patch", patch_size);
        Ok(())
    }

    // ========================================================================
    // Chunk intake
    // ========================================================================

    /// Accept one received chunk for the active session
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if self.status != OtaStatus::Receiving {
            return Err(Error::Ota("no session receiving".into()));
        }

        if self.is_delta {
            let producer = self
                .producer
                .as_ref()
                .ok_or_else(|| Error::Ota("ring missing".into()))?;
            producer
                .push(data, PUSH_TIMEOUT)
                .map_err(|e| Error::Ota(format!("patch ring: {}", e)))?;
            self.received += data.len() as u32;
            return Ok(());
        }

        if self.received + data.len() as u32 > self.expected_size {
            log::error!(
                "firmware overflow: {} + {} > {}",
                self.received,
                data.len(),
                self.expected_size
            );
            self.status = OtaStatus::ErrorSpace;
            return Err(Error::Ota("size overflow".into()));
        }

        if let Err(e) = self.flash.write_update(self.received, data) {
            log::error!("flash write failed: {}", e);
            self.status = OtaStatus::ErrorFlash;
            return Err(Error::Ota(format!("flash write failed: {}", e)));
        }

        self.hasher.update(data);
        self.received += data.len() as u32;
        Ok(())
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Validate and commit a full-image session
    pub fn finalize_full(&mut self) -> Result<()> {
        if self.status != OtaStatus::Receiving || self.is_delta {
            return Err(Error::Ota("no full session receiving".into()));
        }

        self.status = OtaStatus::Validating;

        if self.received != self.expected_size {
            log::error!(
                "size mismatch: {} != {}",
                self.received,
                self.expected_size
            );
            self.status = OtaStatus::ErrorSpace;
            return Err(Error::Ota("size mismatch".into()));
        }

        let calculated = self.hasher.clone().finalize();
        if calculated != self.expected_crc {
            log::error!(
                "CRC mismatch: {:#010x} != {:#010x}",
                calculated,
                self.expected_crc
            );
            self.status = OtaStatus::ErrorCrc;
            return Err(Error::Ota("CRC mismatch".into()));
        }

        if let Err(e) = self.flash.end_update().and_then(|_| self.flash.set_boot_target()) {
            log::error!("flash commit failed: {}", e);
            self.status = OtaStatus::ErrorFlash;
            return Err(Error::Ota(format!("flash commit failed: {}", e)));
        }

        self.status = OtaStatus::Success;
        log::info!("full update complete: {} bytes", self.received);
        Ok(())
    }

    /// Hand the buffered patch stream to the background worker
    pub fn finalize_delta(&mut self) -> Result<()> {
        if self.status != OtaStatus::Receiving || !self.is_delta {
            return Err(Error::Ota("no delta session receiving".into()));
        }

        let consumer = self
            .consumer
            .take()
            .ok_or_else(|| Error::Ota("ring missing".into()))?;

        // The whole patch is buffered; close the producer so the worker
        // sees EOF once drained.
        if let Some(producer) = &self.producer {
            producer.close();
        }

        self.status = OtaStatus::Applying;

        let flash = Arc::clone(&self.flash);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("ota-delta".into())
            .spawn(move || {
                let result = run_delta(flash, consumer);
                shared.result.store(result as u8, Ordering::Release);
                shared.complete.store(true, Ordering::Release);
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                log::info!("delta worker started");
                Ok(())
            }
            Err(e) => {
                log::error!("delta worker spawn failed: {}", e);
                self.flash.abort_update();
                self.status = OtaStatus::ErrorFlash;
                Err(Error::Ota("worker spawn failed".into()))
            }
        }
    }

    /// Observe delta worker completion.
    ///
    /// Returns the terminal status exactly once when the worker finishes;
    /// `None` otherwise. Call every loop iteration.
    pub fn poll(&mut self) -> Option<OtaStatus> {
        if !self.is_delta || !self.shared.complete.load(Ordering::Acquire) {
            return None;
        }

        self.shared.complete.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.status = OtaStatus::from_u8(self.shared.result.load(Ordering::Acquire));
        log::info!("delta update finished: {:?}", self.status);
        Some(self.status)
    }

    /// Abort any session: stop the worker, drain the ring, release flash
    pub fn abort(&mut self) {
        if self.status == OtaStatus::Idle {
            return;
        }

        if let Some(producer) = &self.producer {
            producer.close();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(producer) = &self.producer {
            producer.clear();
        }
        self.producer = None;
        self.consumer = None;

        self.flash.abort_update();

        self.status = OtaStatus::Idle;
        self.is_delta = false;
        self.received = 0;
        self.hasher = crc32fast::Hasher::new();
        self.shared.complete.store(false, Ordering::Release);

        log::info!("OTA aborted");
    }
}

/// Delta worker body: apply the patch from the ring onto the update
/// partition and mark it bootable.
fn run_delta(flash: Arc<dyn Flash>, consumer: RingConsumer) -> OtaStatus {
    log::info!("delta worker applying patch");

    let mut source = FlashSource::new(Arc::clone(&flash));
    let mut patch_stream = consumer;
    let mut target = FlashTarget::new(Arc::clone(&flash));

    match patch::apply(&mut source, &mut patch_stream, &mut target) {
        Ok(written) => {
            if let Err(e) = flash.end_update().and_then(|_| flash.set_boot_target()) {
                log::error!("delta commit failed: {}", e);
                flash.abort_update();
                return OtaStatus::ErrorFlash;
            }
            log::info!("delta patch applied: {} bytes written", written);
            OtaStatus::Success
        }
        Err(e) => {
            log::error!("delta patch failed: {}", e);
            flash.abort_update();
            OtaStatus::ErrorFlash
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc32;
    use std::io;
    use std::sync::Mutex;

    struct MemFlash {
        running: Vec<u8>,
        capacity: u32,
        update: Mutex<Vec<u8>>,
        update_open: Mutex<bool>,
        bootable: Mutex<bool>,
        fail_writes: bool,
    }

    impl MemFlash {
        fn new(running: Vec<u8>, capacity: u32) -> Self {
            Self {
                running,
                capacity,
                update: Mutex::new(Vec::new()),
                update_open: Mutex::new(false),
                bootable: Mutex::new(false),
                fail_writes: false,
            }
        }
    }

    impl Flash for MemFlash {
        fn update_capacity(&self) -> u32 {
            self.capacity
        }
        fn running_size(&self) -> u32 {
            self.running.len() as u32
        }
        fn read_running(&self, offset: u32, buf: &mut [u8]) -> io::Result<()> {
            let start = offset as usize;
            buf.copy_from_slice(&self.running[start..start + buf.len()]);
            Ok(())
        }
        fn begin_update(&self) -> io::Result<()> {
            *self.update_open.lock().unwrap() = true;
            self.update.lock().unwrap().clear();
            Ok(())
        }
        fn write_update(&self, offset: u32, data: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::Other, "write fault"));
            }
            let mut update = self.update.lock().unwrap();
            let end = offset as usize + data.len();
            if update.len() < end {
                update.resize(end, 0xFF);
            }
            update[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
        fn end_update(&self) -> io::Result<()> {
            *self.update_open.lock().unwrap() = false;
            Ok(())
        }
        fn abort_update(&self) {
            *self.update_open.lock().unwrap() = false;
        }
        fn set_boot_target(&self) -> io::Result<()> {
            *self.bootable.lock().unwrap() = true;
            Ok(())
        }
    }

    fn wait_for_completion(ota: &mut OtaService) -> OtaStatus {
        for _ in 0..500 {
            if let Some(status) = ota.poll() {
                return status;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("delta worker did not complete");
    }

    #[test]
    fn test_full_update_success() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 4096));
        let mut ota = OtaService::new(Arc::clone(&flash) as Arc<dyn Flash>);

        let image: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        ota.start_full(image.len() as u32, crc32(&image)).unwrap();
        assert_eq!(ota.status(), OtaStatus::Receiving);

        for chunk in image.chunks(100) {
            ota.write_chunk(chunk).unwrap();
        }
        ota.finalize_full().unwrap();

        assert_eq!(ota.status(), OtaStatus::Success);
        assert_eq!(&*flash.update.lock().unwrap(), &image);
        assert!(*flash.bootable.lock().unwrap());
    }

    #[test]
    fn test_full_update_short_payload() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 4096));
        let mut ota = OtaService::new(flash as Arc<dyn Flash>);

        let image = vec![7u8; 100];
        ota.start_full(image.len() as u32, crc32(&image)).unwrap();
        ota.write_chunk(&image[..99]).unwrap();

        assert!(ota.finalize_full().is_err());
        assert_eq!(ota.status(), OtaStatus::ErrorSpace);
    }

    #[test]
    fn test_full_update_bad_crc() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 4096));
        let mut ota = OtaService::new(flash as Arc<dyn Flash>);

        let image = vec![7u8; 100];
        ota.start_full(image.len() as u32, crc32(&image) ^ 1).unwrap();
        ota.write_chunk(&image).unwrap();

        assert!(ota.finalize_full().is_err());
        assert_eq!(ota.status(), OtaStatus::ErrorCrc);
    }

    #[test]
    fn test_full_update_overflow() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 4096));
        let mut ota = OtaService::new(flash as Arc<dyn Flash>);

        ota.start_full(10, 0).unwrap();
        assert!(ota.write_chunk(&[0u8; 11]).is_err());
        assert_eq!(ota.status(), OtaStatus::ErrorSpace);
    }

    #[test]
    fn test_image_larger_than_partition_rejected() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 100));
        let mut ota = OtaService::new(flash as Arc<dyn Flash>);
        assert!(ota.start_full(101, 0).is_err());
        assert_eq!(ota.status(), OtaStatus::Idle);
    }

    #[test]
    fn test_start_from_non_idle_rejected() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 4096));
        let mut ota = OtaService::new(flash as Arc<dyn Flash>);
        ota.start_full(100, 0).unwrap();
        assert!(ota.start_full(100, 0).is_err());
        assert!(ota.start_delta(100, 0).is_err());
    }

    #[test]
    fn test_flash_write_failure() {
        let mut flash = MemFlash::new(Vec::new(), 4096);
        flash.fail_writes = true;
        let mut ota = OtaService::new(Arc::new(flash) as Arc<dyn Flash>);

        ota.start_full(100, 0).unwrap();
        assert!(ota.write_chunk(&[0u8; 10]).is_err());
        assert_eq!(ota.status(), OtaStatus::ErrorFlash);
    }

    #[test]
    fn test_delta_update_success() {
        let running = b"The quick brown fox jumps over the lazy dog".to_vec();
        let flash = Arc::new(MemFlash::new(running, 4096));
        let mut ota = OtaService::new(Arc::clone(&flash) as Arc<dyn Flash>);

        // Copy the first 16 source bytes, then insert a suffix
        let patch = [
            &[0xA7, 0xA3, 15][..],
            &[0xA7, 0xA5][..],
            b"ran away",
        ]
        .concat();

        ota.start_delta(patch.len() as u32, 0).unwrap();
        for chunk in patch.chunks(5) {
            ota.write_chunk(chunk).unwrap();
        }
        ota.finalize_delta().unwrap();
        assert_eq!(ota.status(), OtaStatus::Applying);
        assert!(ota.needs_pause());

        assert_eq!(wait_for_completion(&mut ota), OtaStatus::Success);
        assert_eq!(&*flash.update.lock().unwrap(), b"The quick brown ran away");
        assert!(*flash.bootable.lock().unwrap());
    }

    #[test]
    fn test_delta_bad_patch_reports_flash_error() {
        let flash = Arc::new(MemFlash::new(vec![1u8; 16], 4096));
        let mut ota = OtaService::new(Arc::clone(&flash) as Arc<dyn Flash>);

        // EQL run longer than the source image
        let patch = [0xA7, 0xA3, 251];
        ota.start_delta(patch.len() as u32, 0).unwrap();
        ota.write_chunk(&patch).unwrap();
        ota.finalize_delta().unwrap();

        assert_eq!(wait_for_completion(&mut ota), OtaStatus::ErrorFlash);
        assert!(!*flash.bootable.lock().unwrap());
    }

    #[test]
    fn test_abort_resets_session() {
        let flash = Arc::new(MemFlash::new(vec![0u8; 16], 4096));
        let mut ota = OtaService::new(Arc::clone(&flash) as Arc<dyn Flash>);

        ota.start_delta(100, 0x1234).unwrap();
        assert_eq!(ota.source_crc(), 0x1234);
        ota.write_chunk(&[1, 2, 3]).unwrap();
        ota.abort();

        assert_eq!(ota.status(), OtaStatus::Idle);
        assert!(!*flash.update_open.lock().unwrap());

        // A fresh session starts cleanly
        ota.start_full(10, 0).unwrap();
        assert_eq!(ota.status(), OtaStatus::Receiving);
    }

    #[test]
    fn test_chunk_without_session_rejected() {
        let flash = Arc::new(MemFlash::new(Vec::new(), 4096));
        let mut ota = OtaService::new(flash as Arc<dyn Flash>);
        assert!(ota.write_chunk(&[1]).is_err());
        assert!(ota.finalize_full().is_err());
        assert!(ota.finalize_delta().is_err());
    }
}

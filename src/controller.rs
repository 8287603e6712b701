//! Module controller
//!
//! Thin orchestrator over the engine, transport, storage, CAN bus and OTA
//! service: dispatches textual commands, reassembles binary streams, emits
//! periodic status and debug frames, and persists accepted rulesets.
//! Everything runs on one cooperative loop; call [`Controller::run_once`]
//! from the embedder's main loop.

use crate::bus::CanBus;
use crate::clock::{Clock, SystemClock};
use crate::codec::{self, ProfileInfo};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::ota::{OtaService, OtaStatus};
use crate::storage::Storage;
use crate::transport::{LinkEvent, Transport};
use crate::types::{CapabilityHandler, CapabilityMeta};

/// Status frame interval
const STATUS_INTERVAL_MS: u32 = 5000;
/// Minimum spacing between debug signal frames
const DEBUG_TX_INTERVAL_MS: u32 = 10;
/// Serialized profile ceiling
const PROFILE_MAX_LEN: usize = 2048;

const KEY_RULES_BIN: &str = "rules_bin";
const KEY_BOOT_COUNT: &str = "boot_count";

/// Stream reassembly target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    None,
    RulesetRam,
    RulesetNvs,
    DebugWatch,
    OtaFull,
    OtaDelta,
}

/// Static module identity, supplied by the embedder
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub module_id: String,
    pub hw_version: String,
    pub fw_version: String,
    pub serial: String,
    /// Advertised link name; falls back to `module_id` when empty
    pub link_name: String,
}

/// The module controller
pub struct Controller<C: CanBus, S: Storage, T: Transport> {
    can: C,
    storage: S,
    transport: T,
    ota: Option<OtaService>,
    engine: Engine,
    clock: Box<dyn Clock>,

    info: ModuleInfo,
    boot_count: u16,
    /// 0 = no rules, 1 = RAM, 2 = persisted
    rules_mode: u8,

    stream: StreamKind,
    stream_buffer: Vec<u8>,
    stream_expected_len: u32,
    stream_expected_crc: u32,

    last_status_ms: u32,
    last_debug_tx_ms: u32,
    restart_pending: bool,
}

impl<C: CanBus, S: Storage, T: Transport> Controller<C, S, T> {
    pub fn new(can: C, storage: S, transport: T, ota: Option<OtaService>, info: ModuleInfo) -> Self {
        Self {
            can,
            storage,
            transport,
            ota,
            engine: Engine::new(),
            clock: Box::new(SystemClock::new()),
            info,
            boot_count: 0,
            rules_mode: 0,
            stream: StreamKind::None,
            stream_buffer: Vec::new(),
            stream_expected_len: 0,
            stream_expected_crc: 0,
            last_status_ms: 0,
            last_debug_tx_ms: 0,
            restart_pending: false,
        }
    }

    /// Replace the timebase (deterministic clocks under test)
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a capability handler
    pub fn register_capability(&mut self, id: &str, handler: CapabilityHandler) {
        self.engine.register_capability(id, handler);
    }

    /// Register a capability handler with profile metadata
    pub fn register_capability_with_meta(
        &mut self,
        id: &str,
        handler: CapabilityHandler,
        meta: CapabilityMeta,
    ) {
        self.engine.register_capability_with_meta(id, handler, meta);
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn boot_count(&self) -> u16 {
        self.boot_count
    }

    pub fn rules_mode(&self) -> u8 {
        self.rules_mode
    }

    /// Set after a successful full update; the embedder owns the restart
    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Initialize collaborators, bump the boot counter and restore the
    /// persisted ruleset.
    pub fn begin(&mut self) {
        log::info!("starting module '{}'", self.info.module_id);

        self.storage.begin();
        self.can.begin();

        let boots = self
            .storage
            .read_string(KEY_BOOT_COUNT)
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(0);
        self.boot_count = boots.wrapping_add(1);
        self.storage
            .write_string(KEY_BOOT_COUNT, &self.boot_count.to_string());

        self.load_rules_from_nvs();

        let name = if self.info.link_name.is_empty() {
            self.info.module_id.clone()
        } else {
            self.info.link_name.clone()
        };
        self.transport.begin(&name);

        log::info!(
            "module ready: id={} boots={} rules_mode={}",
            self.info.module_id,
            self.boot_count,
            self.rules_mode
        );
    }

    /// One cooperative loop iteration: pump the transport, drain CAN,
    /// evaluate rules, emit periodic frames, observe OTA completion.
    pub fn run_once(&mut self) {
        while let Some(event) = self.transport.poll() {
            match event {
                LinkEvent::Connected => log::info!("link connected"),
                LinkEvent::Disconnected => {
                    log::info!("link disconnected");
                    self.reset_stream();
                    self.engine.set_debug_mode(false);
                    self.engine.clear_debug_signals();
                }
                LinkEvent::Frame(data) => {
                    if self.stream != StreamKind::None {
                        self.handle_stream_data(&data);
                    } else {
                        self.handle_command(&data);
                    }
                }
            }
        }

        // While a delta is applying (or a full image validating) only the
        // OTA pipeline runs; CAN stays paused.
        let paused = self.ota.as_ref().map_or(false, |o| o.needs_pause());
        if paused {
            self.poll_ota();
            return;
        }

        let now = self.clock.now_ms();

        while let Some(frame) = self.can.receive() {
            self.engine.process_frame(&frame, now);
        }
        self.engine.evaluate_rules(now);

        if self.engine.is_debug_mode() {
            self.send_debug_update(now);
        }

        if now.wrapping_sub(self.last_status_ms) >= STATUS_INTERVAL_MS {
            self.send_status(now);
            self.last_status_ms = now;
        }

        self.transport.loop_tick();
        self.poll_ota();
    }

    fn poll_ota(&mut self) {
        let Some(ota) = self.ota.as_mut() else {
            return;
        };
        let Some(status) = ota.poll() else {
            return;
        };

        if status == OtaStatus::Success {
            self.transport.send(b"OTA:SUCCESS");
            self.restart_pending = true;
        } else {
            self.transport.send(b"OTA:ERROR");
            self.can.resume();
        }
    }

    // ========================================================================
    // Command dispatch
    // ========================================================================

    fn handle_command(&mut self, data: &[u8]) {
        let packet = String::from_utf8_lossy(data);
        let packet = packet.trim();
        log::debug!("command: {}", packet);

        match packet {
            "GET:PROFILE" => self.send_profile(),
            "GET:RULES" => self.send_rules(),
            "DEBUG:START" => self.engine.set_debug_mode(true),
            "DEBUG:STOP" => {
                self.engine.set_debug_mode(false);
                self.engine.clear_debug_signals();
            }
            _ => {
                if let Some(rest) = packet.strip_prefix("DEBUG:WATCH:") {
                    if let Some((len, crc)) = parse_len_crc(rest, false) {
                        self.open_stream(StreamKind::DebugWatch, len, crc);
                    }
                } else if let Some(rest) = packet.strip_prefix("SET:RULES:RAM:") {
                    if let Some((len, crc)) = parse_len_crc(rest, false) {
                        self.open_stream(StreamKind::RulesetRam, len, crc);
                    }
                } else if let Some(rest) = packet.strip_prefix("SET:RULES:NVS:") {
                    if let Some((len, crc)) = parse_len_crc(rest, false) {
                        self.open_stream(StreamKind::RulesetNvs, len, crc);
                    }
                } else if let Some(rest) = packet.strip_prefix("OTA:BEGIN:") {
                    if let Some((size, crc)) = parse_len_crc(rest, true) {
                        self.start_ota(StreamKind::OtaFull, size, crc);
                    }
                } else if let Some(rest) = packet.strip_prefix("OTA:DELTA:") {
                    if let Some((size, crc)) = parse_len_crc(rest, true) {
                        self.start_ota(StreamKind::OtaDelta, size, crc);
                    }
                } else {
                    log::debug!("unknown command ignored: {}", packet);
                }
            }
        }
    }

    fn open_stream(&mut self, kind: StreamKind, expected_len: u32, expected_crc: u32) {
        self.stream = kind;
        self.stream_expected_len = expected_len;
        self.stream_expected_crc = expected_crc;
        self.stream_buffer.clear();
        self.stream_buffer.reserve(expected_len as usize);
    }

    fn start_ota(&mut self, kind: StreamKind, size: u32, crc: u32) {
        let Some(ota) = self.ota.as_mut() else {
            return;
        };

        let started = if kind == StreamKind::OtaDelta {
            ota.start_delta(size, crc)
        } else {
            ota.start_full(size, crc)
        };

        match started {
            Ok(()) => {
                self.stream = kind;
                self.stream_buffer.clear();
                self.can.stop();
                self.transport.send(b"OTA:READY");
            }
            Err(e) => {
                log::warn!("OTA start rejected: {}", e);
                self.transport.send(b"OTA:ERROR");
            }
        }
    }

    // ========================================================================
    // Stream reassembly
    // ========================================================================

    fn handle_stream_data(&mut self, data: &[u8]) {
        if data == b"END" {
            self.finalize_stream();
            return;
        }

        match self.stream {
            StreamKind::OtaFull | StreamKind::OtaDelta => {
                if let Some(ota) = self.ota.as_mut() {
                    if let Err(e) = ota.write_chunk(data) {
                        log::warn!("OTA chunk dropped: {}", e);
                    }
                }
            }
            _ => self.stream_buffer.extend_from_slice(data),
        }
    }

    fn finalize_stream(&mut self) {
        let kind = self.stream;
        log::info!(
            "stream end: kind {:?}, {} bytes buffered",
            kind,
            self.stream_buffer.len()
        );

        match kind {
            StreamKind::None => {}

            StreamKind::OtaFull => {
                self.reset_stream();
                let finalized = self.ota.as_mut().map(|o| o.finalize_full());
                match finalized {
                    Some(Ok(())) => {
                        self.transport.send(b"OTA:SUCCESS");
                        self.restart_pending = true;
                    }
                    Some(Err(_)) => {
                        self.transport.send(b"OTA:ERROR");
                        self.can.resume();
                    }
                    None => {}
                }
            }

            StreamKind::OtaDelta => {
                self.reset_stream();
                let finalized = self.ota.as_mut().map(|o| o.finalize_delta());
                if let Some(Err(_)) = finalized {
                    self.transport.send(b"OTA:ERROR");
                    self.can.resume();
                }
                // Success reply is deferred to worker completion via poll_ota
            }

            StreamKind::RulesetRam | StreamKind::RulesetNvs | StreamKind::DebugWatch => {
                if let Err(e) = self.finalize_buffered_stream(kind) {
                    log::warn!("stream rejected: {}", e);
                    let reply = match &e {
                        Error::LengthMismatch { .. } => "ERR:LEN_MISMATCH".to_string(),
                        Error::StreamCrc { .. } => "ERR:CRC_FAIL".to_string(),
                        Error::UnknownCapability(id) => format!("ERR:CAP_UNKNOWN:{}", id),
                        _ => "ERR:RULES_INVALID".to_string(),
                    };
                    self.transport.send(reply.as_bytes());
                }
                self.reset_stream();
            }
        }
    }

    /// Verify and apply a fully buffered stream.
    ///
    /// Every failure comes back as a typed [`Error`]; the caller maps it to
    /// its wire reply in one place.
    fn finalize_buffered_stream(&mut self, kind: StreamKind) -> Result<()> {
        if self.stream_buffer.len() != self.stream_expected_len as usize {
            return Err(Error::LengthMismatch {
                got: self.stream_buffer.len(),
                expected: self.stream_expected_len as usize,
            });
        }

        let calculated = codec::crc32(&self.stream_buffer);
        if calculated != self.stream_expected_crc {
            return Err(Error::StreamCrc {
                calculated,
                expected: self.stream_expected_crc,
            });
        }

        if kind == StreamKind::DebugWatch {
            let defs = String::from_utf8_lossy(&self.stream_buffer).into_owned();
            self.engine.load_debug_signals(&defs);
            return Ok(());
        }

        let bytes = std::mem::take(&mut self.stream_buffer);
        self.engine.install(&bytes)?;

        self.rules_mode = if kind == StreamKind::RulesetNvs { 2 } else { 1 };
        if kind == StreamKind::RulesetNvs {
            if let Err(e) = self.save_rules_to_nvs() {
                log::warn!("{}", e);
            }
        }
        // Acceptance is visible through the next status frame
        Ok(())
    }

    fn reset_stream(&mut self) {
        self.stream = StreamKind::None;
        self.stream_buffer.clear();
        self.stream_expected_len = 0;
        self.stream_expected_crc = 0;
    }

    // ========================================================================
    // Outbound frames
    // ========================================================================

    fn send_profile(&mut self) {
        let info = ProfileInfo {
            module_id: self.info.module_id.clone(),
            hw_version: self.info.hw_version.clone(),
            fw_version: self.info.fw_version.clone(),
            serial: self.info.serial.clone(),
            uptime_ms: self.clock.now_ms(),
            boot_count: self.boot_count,
            rules_mode: self.rules_mode,
            rules_crc: self.engine.ruleset_crc(),
            signal_count: self.engine.signal_count() as u8,
            condition_count: self.engine.condition_count() as u8,
            action_count: self.engine.action_count() as u8,
            rule_count: self.engine.rule_count() as u8,
        };

        let serialized = {
            let caps: Vec<&CapabilityMeta> = self.engine.capabilities().values().collect();
            codec::serialize_profile(&info, &caps, PROFILE_MAX_LEN)
        };

        match serialized {
            Ok(bytes) => {
                let crc = codec::crc32(&bytes);
                self.send_chunked(&bytes, crc);
            }
            Err(e) => {
                log::warn!("profile serialization failed: {}", e);
                self.transport.send(b"ERR:PROFILE_TOO_LARGE");
            }
        }
    }

    fn send_rules(&mut self) {
        if self.engine.ruleset_binary().is_empty() {
            self.transport.send(b"ERR:NO_RULES");
            return;
        }
        let bytes = self.engine.ruleset_binary().to_vec();
        let crc = self.engine.ruleset_crc();
        self.send_chunked(&bytes, crc);
    }

    /// BEGIN, MTU-sized chunks, END:<len>:<crc32>
    fn send_chunked(&mut self, bytes: &[u8], crc: u32) {
        self.transport.send(b"BEGIN");
        let mtu = self.transport.mtu().max(1);
        for chunk in bytes.chunks(mtu) {
            self.transport.send(chunk);
        }
        self.transport
            .send(format!("END:{}:{}", bytes.len(), crc).as_bytes());
    }

    fn send_status(&mut self, now: u32) {
        if !self.transport.is_connected() {
            return;
        }
        let line = format!(
            "S:{}:{}:{}:{}:{}:{}",
            self.rules_mode,
            self.engine.signal_count(),
            self.engine.rule_count(),
            self.engine.unique_can_id_count(),
            now,
            self.boot_count
        );
        self.transport.send_status(line.as_bytes());
    }

    fn send_debug_update(&mut self, now: u32) {
        if now.wrapping_sub(self.last_debug_tx_ms) < DEBUG_TX_INTERVAL_MS {
            return;
        }
        if let Some(sig) = self.engine.pop_dirty_debug_signal() {
            let line = format!(
                "D:S:{}:{}:{}:{}:{:.4}:{:.4}:{:.2}",
                sig.can_id,
                sig.start_bit,
                sig.bit_length,
                sig.big_endian as u8,
                sig.factor,
                sig.offset,
                sig.value
            );
            self.transport.send(line.as_bytes());
            self.last_debug_tx_ms = now;
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn load_rules_from_nvs(&mut self) {
        let Some(bytes) = self.storage.read_blob(KEY_RULES_BIN) else {
            self.rules_mode = 0;
            return;
        };

        match self.engine.install(&bytes) {
            Ok(()) => {
                self.rules_mode = 2;
                log::info!("restored {} rules from storage", self.engine.rule_count());
            }
            Err(e) => {
                log::warn!("persisted ruleset rejected: {}", e);
                self.rules_mode = 0;
            }
        }
    }

    fn save_rules_to_nvs(&mut self) -> Result<()> {
        let data = self.engine.ruleset_binary();
        if data.is_empty() {
            return Ok(());
        }
        let data = data.to_vec();
        if !self.storage.write_blob(KEY_RULES_BIN, &data) {
            return Err(Error::Storage("ruleset write failed".into()));
        }
        self.storage.commit();
        log::info!("persisted {} byte ruleset", data.len());
        Ok(())
    }
}

fn parse_len_crc(rest: &str, crc_hex: bool) -> Option<(u32, u32)> {
    let (len_s, crc_s) = rest.split_once(':')?;
    let len = len_s.trim().parse::<u32>().ok()?;
    let crc = if crc_hex {
        u32::from_str_radix(crc_s.trim(), 16).ok()?
    } else {
        crc_s.trim().parse::<u32>().ok()?
    };
    Some((len, crc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{
        serialize_rules, ActionDef, ConditionDef, RuleDef, RulesetDef, SignalDef,
    };
    use crate::bus::CanFrame;
    use crate::codec::crc32;
    use crate::flash::Flash;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};
    use std::io;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct MockCan {
        frames: Rc<RefCell<VecDeque<CanFrame>>>,
        running: Rc<Cell<bool>>,
    }

    impl CanBus for MockCan {
        fn begin(&mut self) -> bool {
            self.running.set(true);
            true
        }
        fn receive(&mut self) -> Option<CanFrame> {
            if !self.running.get() {
                return None;
            }
            self.frames.borrow_mut().pop_front()
        }
        fn transmit(&mut self, _frame: &CanFrame) -> bool {
            true
        }
        fn stop(&mut self) {
            self.running.set(false);
        }
        fn resume(&mut self) {
            self.running.set(true);
        }
        fn is_running(&self) -> bool {
            self.running.get()
        }
    }

    #[derive(Clone, Default)]
    struct MemStorage {
        map: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    }

    impl Storage for MemStorage {
        fn begin(&mut self) -> bool {
            true
        }
        fn write_blob(&mut self, key: &str, data: &[u8]) -> bool {
            self.map.borrow_mut().insert(key.into(), data.to_vec());
            true
        }
        fn read_blob(&self, key: &str) -> Option<Vec<u8>> {
            self.map.borrow().get(key).cloned()
        }
        fn write_string(&mut self, key: &str, value: &str) -> bool {
            self.write_blob(key, value.as_bytes())
        }
        fn read_string(&self, key: &str) -> Option<String> {
            self.read_blob(key)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        }
        fn erase(&mut self, key: &str) -> bool {
            self.map.borrow_mut().remove(key).is_some()
        }
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        connected: Rc<Cell<bool>>,
        events: Rc<RefCell<VecDeque<LinkEvent>>>,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        status_sent: Rc<RefCell<Vec<Vec<u8>>>>,
        ticks: Rc<Cell<u32>>,
    }

    impl MockTransport {
        fn push_frame(&self, data: &[u8]) {
            self.events
                .borrow_mut()
                .push_back(LinkEvent::Frame(data.to_vec()));
        }

        fn sent_strings(&self) -> Vec<String> {
            self.sent
                .borrow()
                .iter()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn begin(&mut self, _name: &str) -> bool {
            true
        }
        fn is_connected(&self) -> bool {
            self.connected.get()
        }
        fn send(&mut self, data: &[u8]) {
            self.sent.borrow_mut().push(data.to_vec());
        }
        fn send_status(&mut self, data: &[u8]) {
            self.status_sent.borrow_mut().push(data.to_vec());
        }
        fn poll(&mut self) -> Option<LinkEvent> {
            self.events.borrow_mut().pop_front()
        }
        fn loop_tick(&mut self) {
            self.ticks.set(self.ticks.get() + 1);
        }
        fn mtu(&self) -> usize {
            64
        }
    }

    #[derive(Clone)]
    struct ManualClock {
        now: Rc<Cell<u32>>,
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u32 {
            self.now.get()
        }
    }

    struct MemFlash {
        update: Mutex<Vec<u8>>,
        bootable: Mutex<bool>,
    }

    impl Flash for MemFlash {
        fn update_capacity(&self) -> u32 {
            64 * 1024
        }
        fn running_size(&self) -> u32 {
            0
        }
        fn read_running(&self, _offset: u32, _buf: &mut [u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty image"))
        }
        fn begin_update(&self) -> io::Result<()> {
            self.update.lock().unwrap().clear();
            Ok(())
        }
        fn write_update(&self, offset: u32, data: &[u8]) -> io::Result<()> {
            let mut update = self.update.lock().unwrap();
            let end = offset as usize + data.len();
            if update.len() < end {
                update.resize(end, 0xFF);
            }
            update[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
        fn end_update(&self) -> io::Result<()> {
            Ok(())
        }
        fn abort_update(&self) {}
        fn set_boot_target(&self) -> io::Result<()> {
            *self.bootable.lock().unwrap() = true;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Rig {
        controller: Controller<MockCan, MemStorage, MockTransport>,
        can: MockCan,
        transport: MockTransport,
        clock: Rc<Cell<u32>>,
    }

    fn rig_with(storage: MemStorage, ota: Option<OtaService>) -> Rig {
        let can = MockCan::default();
        let transport = MockTransport::default();
        transport.connected.set(true);
        let clock = Rc::new(Cell::new(0u32));

        let info = ModuleInfo {
            module_id: "MOD-42".into(),
            hw_version: "1.0".into(),
            fw_version: "0.3.0".into(),
            serial: "SN-1".into(),
            link_name: String::new(),
        };

        let controller = Controller::new(can.clone(), storage.clone(), transport.clone(), ota, info)
            .with_clock(Box::new(ManualClock {
                now: Rc::clone(&clock),
            }));

        Rig {
            controller,
            can,
            transport,
            clock,
        }
    }

    fn rig() -> Rig {
        rig_with(MemStorage::default(), None)
    }

    fn counting_ruleset() -> Vec<u8> {
        let def = RulesetDef {
            signals: vec![SignalDef {
                can_id: 0x100,
                start_bit: 0,
                bit_length: 8,
                big_endian: false,
                signed: false,
                factor: 1.0,
                offset: 0.0,
            }],
            conditions: vec![ConditionDef {
                signal: 0,
                op: "gt".into(),
                value1: 10.0,
                value2: 0.0,
            }],
            rules: vec![RuleDef {
                flow_id: "f".into(),
                conditions: vec![0],
                actions: vec![ActionDef {
                    capability: "count".into(),
                    params: vec![],
                }],
                debounce_ds: 0,
                cooldown_ds: 0,
            }],
        };
        serialize_rules(&def).unwrap()
    }

    fn register_counter(rig: &mut Rig) -> Arc<AtomicU32> {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        rig.controller.register_capability(
            "count",
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        counter
    }

    fn stream_ruleset(rig: &mut Rig, command: &str, bytes: &[u8]) {
        let header = format!("{}:{}:{}", command, bytes.len(), crc32(bytes));
        rig.transport.push_frame(header.as_bytes());
        for chunk in bytes.chunks(20) {
            rig.transport.push_frame(chunk);
        }
        rig.transport.push_frame(b"END");
        rig.controller.run_once();
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn test_boot_count_increments() {
        let storage = MemStorage::default();
        {
            let mut rig = rig_with(storage.clone(), None);
            rig.controller.begin();
            assert_eq!(rig.controller.boot_count(), 1);
        }
        {
            let mut rig = rig_with(storage.clone(), None);
            rig.controller.begin();
            assert_eq!(rig.controller.boot_count(), 2);
        }
        assert_eq!(storage.read_string(KEY_BOOT_COUNT), Some("2".into()));
    }

    #[test]
    fn test_unparseable_boot_count_reads_as_zero() {
        let storage = MemStorage::default();
        storage
            .map
            .borrow_mut()
            .insert(KEY_BOOT_COUNT.into(), b"garbage".to_vec());
        let mut rig = rig_with(storage, None);
        rig.controller.begin();
        assert_eq!(rig.controller.boot_count(), 1);
    }

    #[test]
    fn test_get_rules_without_ruleset() {
        let mut rig = rig();
        rig.controller.begin();
        rig.transport.push_frame(b"GET:RULES");
        rig.controller.run_once();
        assert!(rig.transport.sent_strings().contains(&"ERR:NO_RULES".into()));
    }

    #[test]
    fn test_ruleset_install_via_stream() {
        let mut rig = rig();
        let counter = register_counter(&mut rig);
        rig.controller.begin();

        let bytes = counting_ruleset();
        stream_ruleset(&mut rig, "SET:RULES:RAM", &bytes);

        assert_eq!(rig.controller.engine().rule_count(), 1);
        assert_eq!(rig.controller.rules_mode(), 1);
        // No dedicated OK reply
        assert!(rig.transport.sent_strings().is_empty());

        // The installed rule fires on traffic
        rig.can
            .frames
            .borrow_mut()
            .push_back(CanFrame::standard(0x100, [50, 0, 0, 0, 0, 0, 0, 0]));
        rig.controller.run_once();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nvs_install_persists_and_restores() {
        let storage = MemStorage::default();
        let bytes = counting_ruleset();

        {
            let mut rig = rig_with(storage.clone(), None);
            register_counter(&mut rig);
            rig.controller.begin();
            stream_ruleset(&mut rig, "SET:RULES:NVS", &bytes);
            assert_eq!(rig.controller.rules_mode(), 2);
        }

        assert_eq!(storage.read_blob(KEY_RULES_BIN), Some(bytes.clone()));

        // A fresh boot restores the persisted ruleset
        let mut rig = rig_with(storage, None);
        register_counter(&mut rig);
        rig.controller.begin();
        assert_eq!(rig.controller.rules_mode(), 2);
        assert_eq!(rig.controller.engine().rule_count(), 1);
    }

    #[test]
    fn test_stream_length_mismatch() {
        let mut rig = rig();
        rig.controller.begin();

        rig.transport.push_frame(b"SET:RULES:RAM:5:12345");
        rig.transport.push_frame(b"abc");
        rig.transport.push_frame(b"END");
        rig.controller.run_once();

        assert!(rig
            .transport
            .sent_strings()
            .contains(&"ERR:LEN_MISMATCH".into()));
        assert_eq!(rig.controller.rules_mode(), 0);
    }

    #[test]
    fn test_stream_crc_mismatch() {
        let mut rig = rig();
        rig.controller.begin();

        rig.transport.push_frame(b"SET:RULES:RAM:3:999");
        rig.transport.push_frame(b"abc");
        rig.transport.push_frame(b"END");
        rig.controller.run_once();

        assert!(rig.transport.sent_strings().contains(&"ERR:CRC_FAIL".into()));
    }

    #[test]
    fn test_unknown_capability_reply() {
        let mut rig = rig();
        rig.controller.begin();

        // "count" is not registered
        let bytes = counting_ruleset();
        stream_ruleset(&mut rig, "SET:RULES:RAM", &bytes);

        assert!(rig
            .transport
            .sent_strings()
            .contains(&"ERR:CAP_UNKNOWN:count".into()));
        assert_eq!(rig.controller.engine().rule_count(), 0);
    }

    #[test]
    fn test_invalid_ruleset_reply() {
        let mut rig = rig();
        rig.controller.begin();

        let junk = vec![0xA5u8; 64];
        stream_ruleset(&mut rig, "SET:RULES:RAM", &junk);

        assert!(rig
            .transport
            .sent_strings()
            .contains(&"ERR:RULES_INVALID".into()));
    }

    #[test]
    fn test_status_pacing() {
        let mut rig = rig();
        rig.controller.begin();

        rig.clock.set(1);
        rig.controller.run_once();
        assert_eq!(rig.transport.status_sent.borrow().len(), 0);

        rig.clock.set(5001);
        rig.controller.run_once();
        rig.controller.run_once();
        assert_eq!(rig.transport.status_sent.borrow().len(), 1);

        rig.clock.set(9000);
        rig.controller.run_once();
        assert_eq!(rig.transport.status_sent.borrow().len(), 1);

        rig.clock.set(10_001);
        rig.controller.run_once();
        assert_eq!(rig.transport.status_sent.borrow().len(), 2);

        let status = String::from_utf8(rig.transport.status_sent.borrow()[0].clone()).unwrap();
        assert!(status.starts_with("S:0:0:0:0:5001:1"), "status: {}", status);
    }

    #[test]
    fn test_status_counts_reflect_ruleset() {
        let mut rig = rig();
        register_counter(&mut rig);
        rig.controller.begin();

        let bytes = counting_ruleset();
        stream_ruleset(&mut rig, "SET:RULES:RAM", &bytes);

        rig.clock.set(6000);
        rig.controller.run_once();
        let status = String::from_utf8(rig.transport.status_sent.borrow()[0].clone()).unwrap();
        assert_eq!(status, "S:1:1:1:1:6000:1");
    }

    #[test]
    fn test_debug_watch_and_frame_pacing() {
        let mut rig = rig();
        rig.controller.begin();

        let defs = b"256:0:8:0:1.0:0.0";
        let header = format!("DEBUG:WATCH:{}:{}", defs.len(), crc32(defs));
        rig.transport.push_frame(header.as_bytes());
        rig.transport.push_frame(defs);
        rig.transport.push_frame(b"END");
        rig.controller.run_once();
        assert!(rig.controller.engine().is_debug_mode());

        rig.clock.set(100);
        rig.can
            .frames
            .borrow_mut()
            .push_back(CanFrame::standard(256, [42, 0, 0, 0, 0, 0, 0, 0]));
        rig.controller.run_once();

        let sent = rig.transport.sent_strings();
        assert_eq!(sent, vec!["D:S:256:0:8:0:1.0000:0.0000:42.00"]);
    }

    #[test]
    fn test_debug_stop_clears_overlay() {
        let mut rig = rig();
        rig.controller.begin();

        rig.transport.push_frame(b"DEBUG:START");
        rig.controller.run_once();
        assert!(rig.controller.engine().is_debug_mode());

        rig.transport.push_frame(b"DEBUG:STOP");
        rig.controller.run_once();
        assert!(!rig.controller.engine().is_debug_mode());
    }

    #[test]
    fn test_disconnect_resets_stream_and_debug() {
        let mut rig = rig();
        rig.controller.begin();

        rig.transport.push_frame(b"DEBUG:START");
        rig.transport.push_frame(b"SET:RULES:RAM:100:1");
        rig.transport.push_frame(b"some bytes");
        rig.controller.run_once();

        rig.transport
            .events
            .borrow_mut()
            .push_back(LinkEvent::Disconnected);
        rig.controller.run_once();

        assert!(!rig.controller.engine().is_debug_mode());

        // The next frame is a command again, not stream data
        rig.transport.push_frame(b"GET:RULES");
        rig.controller.run_once();
        assert!(rig.transport.sent_strings().contains(&"ERR:NO_RULES".into()));
    }

    #[test]
    fn test_get_profile_chunked() {
        let mut rig = rig();
        rig.controller.begin();
        rig.transport.push_frame(b"GET:PROFILE");
        rig.controller.run_once();

        let sent = rig.transport.sent.borrow();
        assert_eq!(sent.first().unwrap().as_slice(), b"BEGIN".as_slice());

        let end = String::from_utf8(sent.last().unwrap().clone()).unwrap();
        let parts: Vec<&str> = end.split(':').collect();
        assert_eq!(parts[0], "END");
        let len: usize = parts[1].parse().unwrap();
        let crc: u32 = parts[2].parse().unwrap();

        let body: Vec<u8> = sent[1..sent.len() - 1].concat();
        assert_eq!(body.len(), len);
        assert_eq!(crc32(&body), crc);
        assert_eq!(&body[0..4], &codec::PROFILE_MAGIC.to_le_bytes());
    }

    #[test]
    fn test_get_rules_round_trip() {
        let mut rig = rig();
        register_counter(&mut rig);
        rig.controller.begin();

        let bytes = counting_ruleset();
        stream_ruleset(&mut rig, "SET:RULES:RAM", &bytes);

        rig.transport.push_frame(b"GET:RULES");
        rig.controller.run_once();

        let sent = rig.transport.sent.borrow();
        let body: Vec<u8> = sent[1..sent.len() - 1].concat();
        assert_eq!(body, bytes);
    }

    #[test]
    fn test_ota_full_flow() {
        let flash = Arc::new(MemFlash {
            update: Mutex::new(Vec::new()),
            bootable: Mutex::new(false),
        });
        let ota = OtaService::new(Arc::clone(&flash) as Arc<dyn Flash>);
        let mut rig = rig_with(MemStorage::default(), Some(ota));
        rig.controller.begin();

        let image: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let header = format!("OTA:BEGIN:{}:{:08x}", image.len(), crc32(&image));
        rig.transport.push_frame(header.as_bytes());
        rig.controller.run_once();

        assert!(rig.transport.sent_strings().contains(&"OTA:READY".into()));
        assert!(!rig.can.is_running());

        for chunk in image.chunks(64) {
            rig.transport.push_frame(chunk);
        }
        rig.transport.push_frame(b"END");
        rig.controller.run_once();

        assert!(rig.transport.sent_strings().contains(&"OTA:SUCCESS".into()));
        assert!(rig.controller.restart_pending());
        assert_eq!(&*flash.update.lock().unwrap(), &image);
        assert!(*flash.bootable.lock().unwrap());
    }

    #[test]
    fn test_ota_bad_crc_reports_error_and_resumes_can() {
        let flash = Arc::new(MemFlash {
            update: Mutex::new(Vec::new()),
            bootable: Mutex::new(false),
        });
        let ota = OtaService::new(flash as Arc<dyn Flash>);
        let mut rig = rig_with(MemStorage::default(), Some(ota));
        rig.controller.begin();

        let image = vec![1u8; 50];
        let header = format!("OTA:BEGIN:{}:{:08x}", image.len(), crc32(&image) ^ 1);
        rig.transport.push_frame(header.as_bytes());
        rig.controller.run_once();

        rig.transport.push_frame(&image);
        rig.transport.push_frame(b"END");
        rig.controller.run_once();

        assert!(rig.transport.sent_strings().contains(&"OTA:ERROR".into()));
        assert!(!rig.controller.restart_pending());
        assert!(rig.can.is_running());
    }

    #[test]
    fn test_ota_without_service_ignored() {
        let mut rig = rig();
        rig.controller.begin();
        rig.transport.push_frame(b"OTA:BEGIN:100:abcd");
        rig.controller.run_once();
        assert!(rig.transport.sent_strings().is_empty());
    }

    #[test]
    fn test_ota_hex_crc_parsing() {
        assert_eq!(parse_len_crc("100:1a2B", true), Some((100, 0x1A2B)));
        assert_eq!(parse_len_crc("100:1234", false), Some((100, 1234)));
        assert_eq!(parse_len_crc("100", false), None);
        assert_eq!(parse_len_crc("x:1", false), None);
    }

    #[test]
    fn test_transport_gets_loop_tick() {
        let mut rig = rig();
        rig.controller.begin();
        rig.controller.run_once();
        rig.controller.run_once();
        assert_eq!(rig.transport.ticks.get(), 2);
    }

    #[test]
    fn test_malformed_commands_ignored() {
        let mut rig = rig();
        rig.controller.begin();
        for cmd in [
            &b"SET:RULES:RAM:"[..],
            b"SET:RULES:RAM:abc:1",
            b"DEBUG:WATCH:5",
            b"NOT:A:COMMAND",
            b"",
        ] {
            rig.transport.push_frame(cmd);
        }
        rig.controller.run_once();
        assert!(rig.transport.sent_strings().is_empty());
        assert_eq!(rig.controller.rules_mode(), 0);
    }
}

//! Simulate a module end to end with in-memory drivers.
//!
//! Wires the controller to mock CAN/storage/transport drivers, installs a
//! ruleset over the simulated link, then replays CAN traffic and shows the
//! rules firing and the debug overlay streaming value changes.
//!
//! Usage:
//!   cargo run --example device_sim

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use rulebus::{
    crc32, serialize_rules, ActionDef, CanBus, CanFrame, ConditionDef, Controller, LinkEvent,
    ModuleInfo, ParamDef, RuleDef, RulesetDef, SignalDef, Storage, Transport,
};

#[derive(Clone, Default)]
struct SimCan {
    frames: Rc<RefCell<VecDeque<CanFrame>>>,
    running: Rc<RefCell<bool>>,
}

impl CanBus for SimCan {
    fn begin(&mut self) -> bool {
        *self.running.borrow_mut() = true;
        true
    }
    fn receive(&mut self) -> Option<CanFrame> {
        if *self.running.borrow() {
            self.frames.borrow_mut().pop_front()
        } else {
            None
        }
    }
    fn transmit(&mut self, _frame: &CanFrame) -> bool {
        true
    }
    fn stop(&mut self) {
        *self.running.borrow_mut() = false;
    }
    fn resume(&mut self) {
        *self.running.borrow_mut() = true;
    }
    fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

#[derive(Default)]
struct SimStorage {
    map: HashMap<String, Vec<u8>>,
}

impl Storage for SimStorage {
    fn begin(&mut self) -> bool {
        true
    }
    fn write_blob(&mut self, key: &str, data: &[u8]) -> bool {
        self.map.insert(key.into(), data.to_vec());
        true
    }
    fn read_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }
    fn write_string(&mut self, key: &str, value: &str) -> bool {
        self.write_blob(key, value.as_bytes())
    }
    fn read_string(&self, key: &str) -> Option<String> {
        self.read_blob(key)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }
    fn erase(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }
}

/// Loopback link: the demo pushes host frames in, module replies print out
#[derive(Clone, Default)]
struct SimLink {
    inbox: Rc<RefCell<VecDeque<LinkEvent>>>,
}

impl SimLink {
    fn push(&self, data: &[u8]) {
        self.inbox
            .borrow_mut()
            .push_back(LinkEvent::Frame(data.to_vec()));
    }
}

impl Transport for SimLink {
    fn begin(&mut self, name: &str) -> bool {
        println!("[link] advertising as '{}'", name);
        true
    }
    fn is_connected(&self) -> bool {
        true
    }
    fn send(&mut self, data: &[u8]) {
        println!("[module->host] {}", String::from_utf8_lossy(data));
    }
    fn send_status(&mut self, data: &[u8]) {
        println!("[module->host status] {}", String::from_utf8_lossy(data));
    }
    fn poll(&mut self) -> Option<LinkEvent> {
        self.inbox.borrow_mut().pop_front()
    }
}

fn speed_ruleset() -> Vec<u8> {
    let def = RulesetDef {
        signals: vec![SignalDef {
            can_id: 0x244,
            start_bit: 0,
            bit_length: 16,
            big_endian: false,
            signed: false,
            factor: 0.1,
            offset: 0.0,
        }],
        conditions: vec![ConditionDef {
            signal: 0,
            op: "gt".into(),
            value1: 120.0,
            value2: 0.0,
        }],
        rules: vec![RuleDef {
            flow_id: "overspeed".into(),
            conditions: vec![0],
            actions: vec![ActionDef {
                capability: "chime".into(),
                params: vec![ParamDef::Int(2), ParamDef::Str("overspeed".into())],
            }],
            debounce_ds: 0,
            cooldown_ds: 20,
        }],
    };
    serialize_rules(&def).expect("compile demo ruleset")
}

fn speed_frame(kmh_x10: u16) -> CanFrame {
    let mut data = [0u8; 8];
    data[..2].copy_from_slice(&kmh_x10.to_le_bytes());
    CanFrame::standard(0x244, data)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let can = SimCan::default();
    let bus = can.clone();
    let link = SimLink::default();
    let host = link.clone();

    let mut controller = Controller::new(
        can,
        SimStorage::default(),
        link,
        None,
        ModuleInfo {
            module_id: "SIM-01".into(),
            hw_version: "1.0".into(),
            fw_version: "0.3.0".into(),
            serial: "SIM".into(),
            link_name: String::new(),
        },
    );

    controller.register_capability(
        "chime",
        Box::new(|params| {
            println!(
                "[capability] chime fired: count={} reason={}",
                params.get("p0").map(String::as_str).unwrap_or("?"),
                params.get("p1").map(String::as_str).unwrap_or("?"),
            );
        }),
    );

    controller.begin();

    // Install the ruleset over the link
    let bytes = speed_ruleset();
    host.push(format!("SET:RULES:RAM:{}:{}", bytes.len(), crc32(&bytes)).as_bytes());
    for chunk in bytes.chunks(64) {
        host.push(chunk);
    }
    host.push(b"END");
    controller.run_once();
    println!(
        "[demo] ruleset installed: {} rules active",
        controller.engine().rule_count()
    );

    // Watch the speed signal live (CAN id 0x244 = 580)
    let defs = b"580:0:16:0:0.1:0.0";
    host.push(format!("DEBUG:WATCH:{}:{}", defs.len(), crc32(defs)).as_bytes());
    host.push(defs);
    host.push(b"END");
    controller.run_once();

    // Replay a short drive: accelerate past the limit, slow back down
    println!("[demo] replaying CAN traffic");
    for kmh in [80.0f32, 100.0, 118.0, 125.0, 131.0, 90.0] {
        bus.frames
            .borrow_mut()
            .push_back(speed_frame((kmh * 10.0) as u16));
        controller.run_once();
        thread::sleep(Duration::from_millis(20));
        controller.run_once();
    }

    println!("[demo] done");
}

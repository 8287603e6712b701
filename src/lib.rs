//! rulebus: vehicle-bus rule engine core
//!
//! The firmware core of a CAN-attached rule engine module: it decodes
//! operator-defined signals from raw frames, evaluates a compiled rule table
//! against them, and dispatches parameterized capability actions when rules
//! fire. A paired host installs rule programs, observes live signal values,
//! and streams firmware updates over a message-based link.
//!
//! # Key Features
//!
//! - **WBP codec**: versioned, bounds-checked binary containers for
//!   rulesets and module profiles with string interning and CRC-32
//! - **Rule engine**: bit-field signal decoding (Intel and Motorola),
//!   temporal HOLD conditions, per-rule debounce/cooldown, capability
//!   dispatch
//! - **OTA pipeline**: full-image and delta update paths; delta patches
//!   apply in a background worker fed by a ring buffer
//! - **Pluggable drivers**: CAN, storage, transport and flash are traits
//!   supplied by the embedder at construction
//!
//! # Example
//!
//! ```ignore
//! use rulebus::{Controller, ModuleInfo};
//!
//! let mut controller = Controller::new(can, storage, transport, None, ModuleInfo {
//!     module_id: "MOD-01".into(),
//!     hw_version: "1.0".into(),
//!     fw_version: "0.3.0".into(),
//!     ..Default::default()
//! });
//!
//! controller.register_capability("log", Box::new(|params| {
//!     println!("rule fired: {:?}", params);
//! }));
//!
//! controller.begin();
//! loop {
//!     controller.run_once();
//! }
//! ```

mod builder;
mod bus;
mod clock;
mod codec;
mod controller;
mod engine;
mod error;
mod flash;
mod ota;
mod patch;
mod ring;
mod storage;
mod transport;
mod types;

pub use builder::{
    serialize_rules, ActionDef, ConditionDef, ParamDef, RuleDef, RulesetDef, SignalDef,
};
pub use bus::{CanBus, CanFrame};
pub use clock::{Clock, SystemClock};
pub use codec::{
    crc32, parse_rules, serialize_profile, ParseError, ParsedRuleset, ProfileInfo,
    PROFILE_MAGIC, RULES_MAGIC, WBP_VERSION,
};
pub use controller::{Controller, ModuleInfo};
pub use engine::Engine;
pub use error::{Error, Result};
pub use flash::Flash;
pub use ota::{OtaService, OtaStatus, RING_CAPACITY};
pub use patch::{apply as apply_patch, FlashSource, FlashTarget, PatchError};
pub use ring::{byte_ring, RingConsumer, RingError, RingProducer};
pub use storage::Storage;
pub use transport::{LinkEvent, Transport};
pub use types::{
    Action, CapabilityHandler, CapabilityMeta, CapabilityParamMeta, Condition, Operation,
    ParamMap, ParamType, ParamValue, Rule, Signal,
};

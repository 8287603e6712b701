//! Rule evaluation engine
//!
//! Transport-agnostic: consumes CAN frames and a millisecond counter,
//! decodes signals, evaluates AND-masked rules with debounce/cooldown, and
//! dispatches capability actions. A separate debug overlay decodes an
//! independent signal table for live observation without touching rule
//! evaluation.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::bus::CanFrame;
use crate::codec;
use crate::error::{Error, Result};
use crate::types::{
    Action, CapabilityHandler, CapabilityMeta, Condition, Operation, ParamMap, ParamValue, Rule,
    Signal,
};

/// Absolute tolerance for EQ/NE comparisons and HOLD activity detection
const EPSILON: f32 = 1e-4;

/// Minimum value change before an overlay signal is queued as dirty
const DEBUG_CHANGE_THRESHOLD: f32 = 0.01;

/// Debug dirty-queue capacity
const DEBUG_QUEUE_CAP: usize = 64;

/// Extract a contiguous bit field from an 8-byte CAN payload.
///
/// Little-endian walks bit positions upward from `start`; big-endian walks
/// downward, accumulating MSB-first (the Motorola sawtooth convention).
/// Out-of-range positions are skipped.
fn extract_bits(data: &[u8; 8], start: u16, len: u8, big_endian: bool) -> u64 {
    if len == 0 || len > 64 {
        return 0;
    }

    let mut result: u64 = 0;

    if !big_endian {
        for i in 0..len as u32 {
            let bit_pos = start as u32 + i;
            let byte_idx = (bit_pos / 8) as usize;
            if byte_idx < 8 {
                let bit = (data[byte_idx] >> (bit_pos % 8)) & 1;
                result |= (bit as u64) << i;
            }
        }
    } else {
        for i in 0..len as i32 {
            let bit_pos = start as i32 - i;
            if !(0..64).contains(&bit_pos) {
                continue;
            }
            let byte_idx = (bit_pos / 8) as usize;
            let bit = (data[byte_idx] >> (bit_pos % 8)) & 1;
            result = (result << 1) | bit as u64;
        }
    }

    result
}

/// Decode a signal value from a payload: extract, sign-extend, scale.
fn decode_signal(sig: &Signal, data: &[u8; 8]) -> f32 {
    let mut raw = extract_bits(data, sig.start_bit, sig.bit_length, sig.big_endian);

    let val = if sig.signed {
        if sig.bit_length > 0 && sig.bit_length < 64 && raw & (1u64 << (sig.bit_length - 1)) != 0 {
            raw |= !0u64 << sig.bit_length;
        }
        raw as i64 as f32
    } else {
        raw as f32
    };

    val * sig.factor + sig.offset
}

fn build_param_map(params: &[ParamValue]) -> ParamMap {
    let mut map = ParamMap::new();
    for (i, p) in params.iter().enumerate() {
        let value = match p {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Float(f) => format!("{:.4}", f),
            ParamValue::Int(v) => v.to_string(),
            ParamValue::Bool(b) => (*b as i32).to_string(),
        };
        map.insert(format!("p{}", i), value);
    }
    map
}

/// The rule evaluation engine
pub struct Engine {
    signals: Vec<Signal>,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
    rules: Vec<Rule>,

    /// Accepted container bytes, retained for persistence and GET:RULES
    ruleset_binary: Vec<u8>,
    ruleset_crc: u32,

    /// CAN id -> indices into `signals`
    signal_index: HashMap<u32, Vec<usize>>,

    handlers: HashMap<String, CapabilityHandler>,
    capability_meta: BTreeMap<String, CapabilityMeta>,

    debug_mode: bool,
    debug_signals: Vec<Signal>,
    debug_index: HashMap<u32, Vec<usize>>,
    debug_dirty: Vec<bool>,
    debug_queue: VecDeque<usize>,

    rules_triggered: u32,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            signals: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            rules: Vec::new(),
            ruleset_binary: Vec::new(),
            ruleset_crc: 0,
            signal_index: HashMap::new(),
            handlers: HashMap::new(),
            capability_meta: BTreeMap::new(),
            debug_mode: false,
            debug_signals: Vec::new(),
            debug_index: HashMap::new(),
            debug_dirty: Vec::new(),
            debug_queue: VecDeque::new(),
            rules_triggered: 0,
        }
    }

    // ========================================================================
    // Ruleset lifecycle
    // ========================================================================

    /// Install a WBP rules container.
    ///
    /// Parses and validates the container, then checks every referenced
    /// capability against the registry. Only after every check passes do the
    /// tables swap in; any failure leaves the previous ruleset intact.
    pub fn install(&mut self, data: &[u8]) -> Result<()> {
        let parsed = codec::parse_rules(data)?;

        for action in &parsed.actions {
            if !self.handlers.contains_key(&action.capability_id) {
                return Err(Error::UnknownCapability(action.capability_id.clone()));
            }
        }

        let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, sig) in parsed.signals.iter().enumerate() {
            index.entry(sig.can_id).or_default().push(i);
        }

        self.signals = parsed.signals;
        self.conditions = parsed.conditions;
        self.actions = parsed.actions;
        self.rules = parsed.rules;
        self.signal_index = index;
        self.ruleset_binary = data[..].to_vec();
        self.ruleset_crc = codec::crc32(data);

        log::info!(
            "ruleset installed: {} signals, {} conditions, {} actions, {} rules",
            self.signals.len(),
            self.conditions.len(),
            self.actions.len(),
            self.rules.len()
        );
        Ok(())
    }

    /// Drop the active ruleset and all its runtime state
    pub fn clear_ruleset(&mut self) {
        self.signals.clear();
        self.conditions.clear();
        self.actions.clear();
        self.rules.clear();
        self.signal_index.clear();
        self.ruleset_binary.clear();
        self.ruleset_crc = 0;
        self.rules_triggered = 0;
    }

    pub fn ruleset_binary(&self) -> &[u8] {
        &self.ruleset_binary
    }

    pub fn ruleset_crc(&self) -> u32 {
        self.ruleset_crc
    }

    // ========================================================================
    // Capability registry
    // ========================================================================

    /// Register a capability handler
    pub fn register_capability(&mut self, id: &str, handler: CapabilityHandler) {
        self.handlers.insert(id.to_owned(), handler);
    }

    /// Register a capability handler with profile metadata
    pub fn register_capability_with_meta(
        &mut self,
        id: &str,
        handler: CapabilityHandler,
        meta: CapabilityMeta,
    ) {
        self.handlers.insert(id.to_owned(), handler);
        self.capability_meta.insert(id.to_owned(), meta);
    }

    /// Registered capability metadata, ordered by id
    pub fn capabilities(&self) -> &BTreeMap<String, CapabilityMeta> {
        &self.capability_meta
    }

    // ========================================================================
    // Frame ingestion and evaluation
    // ========================================================================

    /// Decode one CAN frame into ruleset signals and, in debug mode, into
    /// the overlay.
    pub fn process_frame(&mut self, frame: &CanFrame, now_ms: u32) {
        if let Some(indices) = self.signal_index.get(&frame.id) {
            for &i in indices {
                let sig = &mut self.signals[i];
                sig.last_value = sig.value;
                sig.value = decode_signal(sig, &frame.data);
                sig.last_update_ms = now_ms;
                sig.ever_set = true;
            }
        }

        if self.debug_mode {
            if let Some(indices) = self.debug_index.get(&frame.id) {
                for &i in indices {
                    let sig = &mut self.debug_signals[i];
                    sig.last_value = sig.value;
                    sig.value = decode_signal(sig, &frame.data);
                    sig.last_update_ms = now_ms;
                    sig.ever_set = true;

                    if (sig.value - sig.last_reported).abs() > DEBUG_CHANGE_THRESHOLD
                        && !self.debug_dirty[i]
                        && self.debug_queue.len() < DEBUG_QUEUE_CAP
                    {
                        self.debug_dirty[i] = true;
                        self.debug_queue.push_back(i);
                    }
                }
            }
        }
    }

    fn eval_condition(cond: &mut Condition, signals: &[Signal], now_ms: u32) -> bool {
        let Some(sig) = signals.get(cond.signal_idx as usize) else {
            return false;
        };
        if !sig.ever_set {
            return false;
        }

        let val = sig.value;

        if cond.operation == Operation::Hold {
            let active = val.abs() > EPSILON;
            if active {
                if !cond.hold_active {
                    cond.hold_active = true;
                    cond.hold_start_ms = now_ms;
                }
                return now_ms.wrapping_sub(cond.hold_start_ms) >= cond.hold_ms;
            }
            cond.hold_active = false;
            cond.hold_start_ms = 0;
            return false;
        }

        match cond.operation {
            Operation::Eq => (val - cond.value1).abs() < EPSILON,
            Operation::Ne => (val - cond.value1).abs() >= EPSILON,
            Operation::Gt => val > cond.value1,
            Operation::Ge => val >= cond.value1,
            Operation::Lt => val < cond.value1,
            Operation::Le => val <= cond.value1,
            Operation::Within => val >= cond.value1 && val <= cond.value2,
            Operation::Outside => val < cond.value1 || val > cond.value2,
            Operation::Hold => false,
        }
    }

    /// Evaluate all rules in declaration order, firing triggered actions.
    ///
    /// A rule fires when every masked condition holds, the conjunction has
    /// been continuously true for the debounce window, and the cooldown
    /// since the last trigger has elapsed.
    pub fn evaluate_rules(&mut self, now_ms: u32) {
        for r in 0..self.rules.len() {
            let mask = self.rules[r].condition_mask;

            let mut all_met = true;
            for c in 0..self.conditions.len().min(32) {
                if mask & (1 << c) != 0
                    && !Self::eval_condition(&mut self.conditions[c], &self.signals, now_ms)
                {
                    all_met = false;
                    break;
                }
            }

            let rule = &mut self.rules[r];
            if all_met != rule.last_condition_state {
                rule.last_condition_state = all_met;
                rule.last_condition_change_ms = now_ms;
            }

            if !all_met {
                continue;
            }

            let debounced = now_ms.wrapping_sub(rule.last_condition_change_ms) >= rule.debounce_ms;
            let cooled = now_ms.wrapping_sub(rule.last_trigger_ms) >= rule.cooldown_ms;
            if !debounced || !cooled {
                continue;
            }

            let start = self.rules[r].action_start_idx as usize;
            let end = (start + self.rules[r].action_count as usize).min(self.actions.len());
            for a in start..end {
                let action = &self.actions[a];
                let params = build_param_map(&action.params);
                if let Some(handler) = self.handlers.get_mut(&action.capability_id) {
                    handler(&params);
                }
            }

            let rule = &mut self.rules[r];
            rule.last_trigger_ms = now_ms;
            self.rules_triggered += 1;
        }
    }

    // ========================================================================
    // Debug overlay
    // ========================================================================

    /// Replace the debug overlay from a comma-separated definition list.
    ///
    /// Entry format: `can_id:start_bit:bit_length:big_endian:factor:offset`.
    /// Malformed entries are skipped. Enables debug mode and returns the
    /// number of overlay signals installed.
    pub fn load_debug_signals(&mut self, definitions: &str) -> usize {
        let mut signals = Vec::new();
        let mut index: HashMap<u32, Vec<usize>> = HashMap::new();

        for entry in definitions.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let fields: Vec<&str> = entry.split(':').collect();
            if fields.len() != 6 {
                log::warn!("skipping malformed debug signal '{}'", entry);
                continue;
            }

            let parsed = (
                fields[0].parse::<u32>(),
                fields[1].parse::<u16>(),
                fields[2].parse::<u8>(),
                fields[3].parse::<u8>(),
                fields[4].parse::<f32>(),
                fields[5].parse::<f32>(),
            );
            let (Ok(can_id), Ok(start), Ok(len), Ok(be), Ok(factor), Ok(offset)) = parsed else {
                log::warn!("skipping malformed debug signal '{}'", entry);
                continue;
            };

            let idx = signals.len();
            signals.push(Signal::new(can_id, start, len, be != 0, false, factor, offset));
            index.entry(can_id).or_default().push(idx);
        }

        let count = signals.len();
        self.debug_dirty = vec![false; count];
        self.debug_signals = signals;
        self.debug_index = index;
        self.debug_queue.clear();
        self.debug_mode = true;

        log::info!("debug overlay loaded: {} signals", count);
        count
    }

    /// Drop the overlay and leave debug mode
    pub fn clear_debug_signals(&mut self) {
        self.debug_signals.clear();
        self.debug_index.clear();
        self.debug_dirty.clear();
        self.debug_queue.clear();
        self.debug_mode = false;
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    /// Pop one changed overlay signal, updating its last-reported value
    pub fn pop_dirty_debug_signal(&mut self) -> Option<Signal> {
        let idx = self.debug_queue.pop_front()?;
        self.debug_dirty[idx] = false;
        let sig = &mut self.debug_signals[idx];
        let snapshot = sig.clone();
        sig.last_reported = sig.value;
        Some(snapshot)
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Distinct CAN ids referenced by the active ruleset
    pub fn unique_can_id_count(&self) -> usize {
        self.signal_index.len()
    }

    pub fn rules_triggered(&self) -> u32 {
        self.rules_triggered
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

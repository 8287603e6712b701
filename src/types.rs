//! Runtime structures decoded from WBP containers
//!
//! Signals, conditions, actions and rules are stored in contiguous arrays of
//! plain structs; operator semantics are selected by the [`Operation`] tag.
//! Each struct pairs its wire-derived definition with the runtime state the
//! engine mutates while frames arrive.

use std::collections::BTreeMap;

/// Condition comparison operators (wire codes 0..=8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Eq = 0,
    Ne = 1,
    Gt = 2,
    Ge = 3,
    Lt = 4,
    Le = 5,
    Within = 6,
    Outside = 7,
    Hold = 8,
}

impl Operation {
    /// Decode a wire operation code
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Operation::Eq,
            1 => Operation::Ne,
            2 => Operation::Gt,
            3 => Operation::Ge,
            4 => Operation::Lt,
            5 => Operation::Le,
            6 => Operation::Within,
            7 => Operation::Outside,
            8 => Operation::Hold,
            _ => return None,
        })
    }
}

/// Action parameter types (wire codes 0..=3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamType {
    Int = 0,
    Float = 1,
    String = 2,
    Bool = 3,
}

impl ParamType {
    /// Decode a wire parameter type code
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ParamType::Int,
            1 => ParamType::Float,
            2 => ParamType::String,
            3 => ParamType::Bool,
            _ => return None,
        })
    }
}

impl Default for ParamType {
    fn default() -> Self {
        ParamType::Int
    }
}

/// A decoded action parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Str(String),
}

/// CAN signal definition plus runtime decode state
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub can_id: u32,
    pub start_bit: u16,
    pub bit_length: u8,
    pub big_endian: bool,
    pub signed: bool,
    pub factor: f32,
    pub offset: f32,
    /// Most recent decoded value
    pub value: f32,
    /// Value before the most recent update
    pub last_value: f32,
    /// Last value pushed to a debug observer (overlay signals only)
    pub last_reported: f32,
    pub last_update_ms: u32,
    pub ever_set: bool,
}

impl Signal {
    /// Sentinel ensuring the first decoded value always reads as changed
    pub const NEVER_REPORTED: f32 = -999_999.9;

    pub fn new(
        can_id: u32,
        start_bit: u16,
        bit_length: u8,
        big_endian: bool,
        signed: bool,
        factor: f32,
        offset: f32,
    ) -> Self {
        Self {
            can_id,
            start_bit,
            bit_length,
            big_endian,
            signed,
            factor,
            offset,
            value: 0.0,
            last_value: 0.0,
            last_reported: Self::NEVER_REPORTED,
            last_update_ms: 0,
            ever_set: false,
        }
    }
}

/// Condition definition plus HOLD tracking state
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub signal_idx: u8,
    pub operation: Operation,
    pub value1: f32,
    pub value2: f32,
    /// Required continuous-truth duration for HOLD, milliseconds
    pub hold_ms: u32,
    pub hold_start_ms: u32,
    pub hold_active: bool,
}

impl Condition {
    pub fn new(signal_idx: u8, operation: Operation, value1: f32, value2: f32) -> Self {
        let hold_ms = if operation == Operation::Hold {
            value1 as u32
        } else {
            0
        };
        Self {
            signal_idx,
            operation,
            value1,
            value2,
            hold_ms,
            hold_start_ms: 0,
            hold_active: false,
        }
    }
}

/// Action referencing a registered capability with resolved parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub capability_id: String,
    pub params: Vec<ParamValue>,
}

/// Rule definition plus debounce/cooldown state
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Host-side flow identifier, kept for diagram reconstruction
    pub flow_id: String,
    /// Bit `c` set means condition index `c` is in this rule's AND-group
    pub condition_mask: u32,
    pub action_start_idx: u8,
    pub action_count: u8,
    pub debounce_ms: u32,
    pub cooldown_ms: u32,
    pub last_trigger_ms: u32,
    pub last_condition_change_ms: u32,
    pub last_condition_state: bool,
}

impl Rule {
    pub fn new(
        flow_id: String,
        condition_mask: u32,
        action_start_idx: u8,
        action_count: u8,
        debounce_ms: u32,
        cooldown_ms: u32,
    ) -> Self {
        Self {
            flow_id,
            condition_mask,
            action_start_idx,
            action_count,
            debounce_ms,
            cooldown_ms,
            last_trigger_ms: 0,
            last_condition_change_ms: 0,
            last_condition_state: false,
        }
    }
}

/// Parameter map handed to capability handlers, keyed `"p0"`, `"p1"`, ...
pub type ParamMap = BTreeMap<String, String>;

/// Host-provided capability handler
pub type CapabilityHandler = Box<dyn FnMut(&ParamMap) + Send>;

/// Parameter metadata advertised in the module profile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityParamMeta {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub min: i16,
    pub max: i16,
    pub description: String,
}

/// Capability metadata advertised in the module profile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityMeta {
    pub id: String,
    pub label: String,
    pub description: String,
    pub category: String,
    pub params: Vec<CapabilityParamMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_round_trip() {
        for code in 0u8..=8 {
            let op = Operation::from_code(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(Operation::from_code(9).is_none());
        assert!(Operation::from_code(255).is_none());
    }

    #[test]
    fn test_param_type_codes() {
        assert_eq!(ParamType::from_code(0), Some(ParamType::Int));
        assert_eq!(ParamType::from_code(3), Some(ParamType::Bool));
        assert!(ParamType::from_code(4).is_none());
    }

    #[test]
    fn test_hold_condition_captures_duration() {
        let cond = Condition::new(0, Operation::Hold, 1500.0, 0.0);
        assert_eq!(cond.hold_ms, 1500);
        assert!(!cond.hold_active);

        let cond = Condition::new(0, Operation::Gt, 1500.0, 0.0);
        assert_eq!(cond.hold_ms, 0);
    }

    #[test]
    fn test_new_signal_never_set() {
        let sig = Signal::new(0x100, 0, 16, false, false, 1.0, 0.0);
        assert!(!sig.ever_set);
        assert_eq!(sig.last_reported, Signal::NEVER_REPORTED);
    }
}

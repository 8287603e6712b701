//! Ruleset authoring model and WBP rules serializer
//!
//! Hosts author rulesets as JSON (or construct [`RulesetDef`] directly) and
//! compile them to the binary container the module accepts. Per-rule action
//! lists are flattened into the container's global action/parameter arrays,
//! strings are interned, and every count ceiling is enforced so the output
//! always passes [`crate::codec::parse_rules`].

use serde::{Deserialize, Serialize};

use crate::codec::{self, StringTableBuilder, FLAG_HAS_META, HEADER_LEN, MAX_HOLD_MS};
use crate::error::{Error, Result};
use crate::types::ParamType;

fn default_factor() -> f32 {
    1.0
}

/// Signal definition: a contiguous bit field of a CAN payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDef {
    pub can_id: u32,
    pub start_bit: u16,
    pub bit_length: u8,
    #[serde(default)]
    pub big_endian: bool,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_factor")]
    pub factor: f32,
    #[serde(default)]
    pub offset: f32,
}

/// Condition definition: one comparison over one signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDef {
    /// Index into the signal array
    pub signal: u8,
    /// Operator name: eq, ne, gt, ge, lt, le, within, outside, hold
    pub op: String,
    pub value1: f32,
    #[serde(default)]
    pub value2: f32,
}

/// Action parameter, tagged by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamDef {
    Int(u16),
    Float(f32),
    Bool(bool),
    Str(String),
}

/// Action definition: a capability invocation with parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDef {
    pub capability: String,
    #[serde(default)]
    pub params: Vec<ParamDef>,
}

/// Rule definition: an AND-group of conditions firing an ordered action list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub flow_id: String,
    /// Indices into the condition array (each must be < 32)
    pub conditions: Vec<usize>,
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub debounce_ds: u8,
    #[serde(default)]
    pub cooldown_ds: u8,
}

/// A complete ruleset definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesetDef {
    pub signals: Vec<SignalDef>,
    pub conditions: Vec<ConditionDef>,
    pub rules: Vec<RuleDef>,
}

impl RulesetDef {
    /// Load a definition from its JSON form
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the definition to its JSON form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn op_code(name: &str) -> Option<u8> {
    Some(match name {
        "eq" => 0,
        "ne" => 1,
        "gt" => 2,
        "ge" => 3,
        "lt" => 4,
        "le" => 5,
        "within" => 6,
        "outside" => 7,
        "hold" => 8,
        _ => return None,
    })
}

/// Compile a ruleset definition into a WBP rules container.
///
/// The returned bytes carry a stamped total size and body CRC and parse
/// cleanly back into structurally equal tables.
pub fn serialize_rules(def: &RulesetDef) -> Result<Vec<u8>> {
    if def.signals.len() > u8::MAX as usize {
        return Err(Error::Build(format!(
            "too many signals: {}",
            def.signals.len()
        )));
    }
    if def.conditions.len() > u8::MAX as usize {
        return Err(Error::Build(format!(
            "too many conditions: {}",
            def.conditions.len()
        )));
    }
    if def.rules.len() > u8::MAX as usize {
        return Err(Error::Build(format!("too many rules: {}", def.rules.len())));
    }

    let mut table = StringTableBuilder::new();

    // Signals
    let mut body: Vec<u8> = Vec::new();
    for sig in &def.signals {
        if sig.bit_length == 0 || sig.bit_length > 64 {
            return Err(Error::Build(format!(
                "signal bit length {} out of range",
                sig.bit_length
            )));
        }
        body.extend_from_slice(&sig.can_id.to_le_bytes());
        body.extend_from_slice(&sig.start_bit.to_le_bytes());
        body.push(sig.bit_length);
        body.push((sig.big_endian as u8) | ((sig.signed as u8) << 1));
        body.extend_from_slice(&sig.factor.to_le_bytes());
        body.extend_from_slice(&sig.offset.to_le_bytes());
    }

    // Conditions
    for (i, cond) in def.conditions.iter().enumerate() {
        let code = op_code(&cond.op)
            .ok_or_else(|| Error::Build(format!("condition {} has unknown op '{}'", i, cond.op)))?;
        if cond.signal as usize >= def.signals.len() {
            return Err(Error::Build(format!(
                "condition {} references missing signal {}",
                i, cond.signal
            )));
        }
        if code == 8 && !(0.0..=MAX_HOLD_MS).contains(&cond.value1) {
            return Err(Error::Build(format!("condition {} hold duration invalid", i)));
        }
        body.push(cond.signal);
        body.push(code);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&cond.value1.to_le_bytes());
        body.extend_from_slice(&cond.value2.to_le_bytes());
    }

    // Flatten per-rule actions into the global arrays
    struct FlatAction {
        cap_idx: u16,
        param_start: usize,
        param_count: usize,
    }
    struct FlatRule {
        flow_idx: u16,
        mask: u32,
        action_start: usize,
        action_count: usize,
        debounce_ds: u8,
        cooldown_ds: u8,
    }

    let mut flat_actions: Vec<FlatAction> = Vec::new();
    let mut flat_params: Vec<(ParamType, u16)> = Vec::new();
    let mut flat_rules: Vec<FlatRule> = Vec::new();

    for (i, rule) in def.rules.iter().enumerate() {
        let mut mask = 0u32;
        for &c in &rule.conditions {
            if c >= def.conditions.len() {
                return Err(Error::Build(format!(
                    "rule {} references missing condition {}",
                    i, c
                )));
            }
            if c >= 32 {
                return Err(Error::Build(format!(
                    "rule {} condition index {} exceeds mask width",
                    i, c
                )));
            }
            mask |= 1 << c;
        }

        let action_start = flat_actions.len();
        for action in &rule.actions {
            if action.capability.is_empty() {
                return Err(Error::Build(format!("rule {} has an empty capability id", i)));
            }
            let param_start = flat_params.len();
            for p in &action.params {
                flat_params.push(match p {
                    ParamDef::Int(v) => (ParamType::Int, *v),
                    ParamDef::Bool(v) => (ParamType::Bool, *v as u16),
                    ParamDef::Float(v) => (ParamType::Float, (v * 100.0) as u16),
                    ParamDef::Str(s) => (ParamType::String, table.add(s)?),
                });
            }
            flat_actions.push(FlatAction {
                cap_idx: table.add(&action.capability)?,
                param_start,
                param_count: action.params.len(),
            });
        }

        flat_rules.push(FlatRule {
            flow_idx: table.add(&rule.flow_id)?,
            mask,
            action_start,
            action_count: rule.actions.len(),
            debounce_ds: rule.debounce_ds,
            cooldown_ds: rule.cooldown_ds,
        });
    }

    // The parser requires the string table to sit inside the container, so
    // emit at least one entry even for rulesets that intern no strings
    if table.is_empty() {
        table.add("")?;
    }

    if flat_actions.len() > u8::MAX as usize {
        return Err(Error::Build(format!(
            "too many actions: {}",
            flat_actions.len()
        )));
    }
    if flat_params.len() > u8::MAX as usize {
        // param_start_idx is a u8 on the wire
        return Err(Error::Build(format!(
            "too many action parameters: {}",
            flat_params.len()
        )));
    }

    for action in &flat_actions {
        body.extend_from_slice(&action.cap_idx.to_le_bytes());
        body.push(action.param_count as u8);
        body.push(action.param_start as u8);
        body.extend_from_slice(&0u32.to_le_bytes());
    }
    for (param_type, value) in &flat_params {
        body.push(*param_type as u8);
        body.push(0);
        body.extend_from_slice(&value.to_le_bytes());
    }
    for rule in &flat_rules {
        body.extend_from_slice(&rule.flow_idx.to_le_bytes());
        body.extend_from_slice(&rule.mask.to_le_bytes());
        body.push(rule.action_start as u8);
        body.push(rule.action_count as u8);
        body.push(rule.debounce_ds);
        body.push(rule.cooldown_ds);
    }

    let string_table_offset = HEADER_LEN + body.len();
    let total_size = string_table_offset + table.len();
    if total_size > u16::MAX as usize {
        return Err(Error::Build(format!("container too large: {}", total_size)));
    }

    let mut out = Vec::with_capacity(total_size);
    out.extend_from_slice(&codec::RULES_MAGIC.to_le_bytes());
    out.push(codec::WBP_VERSION);
    out.push(0); // flags: no meta block
    out.extend_from_slice(&(total_size as u16).to_le_bytes());
    out.push(def.signals.len() as u8);
    out.push(def.conditions.len() as u8);
    out.push(flat_actions.len() as u8);
    out.push(def.rules.len() as u8);
    out.extend_from_slice(&(flat_params.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // meta offset
    out.extend_from_slice(&(string_table_offset as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved
    out.extend_from_slice(&0u32.to_le_bytes()); // crc placeholder

    out.extend_from_slice(&body);
    out.extend_from_slice(table.as_bytes());

    let crc = codec::crc32(&out[HEADER_LEN..]);
    out[20..24].copy_from_slice(&crc.to_le_bytes());

    debug_assert_eq!(out.len(), total_size);
    debug_assert_eq!(out[5] & FLAG_HAS_META, 0);
    Ok(out)
}

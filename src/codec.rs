//! WBP (Wire Binary Protocol) codec
//!
//! Versioned, self-describing binary containers for rulesets and module
//! profiles: fixed little-endian header, record arrays, an interned string
//! table of NUL-terminated entries, and a CRC-32/IEEE over everything after
//! the header. The parser is bounds-checked end to end and returns a typed
//! [`ParseError`] for every way a container can be malformed.

use thiserror::Error;

use crate::error::{Error, Result};
use crate::types::{
    Action, CapabilityMeta, Condition, Operation, ParamType, ParamValue, Rule, Signal,
};

/// Magic number of a rules container
pub const RULES_MAGIC: u32 = 0xC0DE5702;
/// Magic number of a profile container
pub const PROFILE_MAGIC: u32 = 0xC0DE5701;
/// Container version written by this codec
pub const WBP_VERSION: u8 = 2;
/// Oldest container version this codec accepts
pub const WBP_MIN_VERSION: u8 = 2;
/// Header flag: optional meta block follows the header
pub const FLAG_HAS_META: u8 = 0x01;

/// Rules header length on the wire
pub const HEADER_LEN: usize = 24;
/// Optional meta block length
pub const META_LEN: usize = 40;
/// Profile header length on the wire
pub const PROFILE_HEADER_LEN: usize = 32;

const SIGNAL_LEN: usize = 16;
const CONDITION_LEN: usize = 12;
const ACTION_LEN: usize = 8;
const ACTION_PARAM_LEN: usize = 4;
const RULE_LEN: usize = 10;
const CAPABILITY_LEN: usize = 12;
const CAP_PARAM_LEN: usize = 12;

/// String table ceiling (u16 offsets with headroom for sentinel values)
pub const MAX_STRING_TABLE: usize = 0xFFF0;

/// Longest accepted HOLD duration, milliseconds (24 h)
pub const MAX_HOLD_MS: f32 = 86_400_000.0;

/// Signal flags byte: bit 0 = big-endian, bit 1 = signed
const SIG_FLAG_BIG_ENDIAN: u8 = 0x01;
const SIG_FLAG_SIGNED: u8 = 0x02;

/// Ways a rules container can fail validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer shorter than the fixed header
    #[error("data too short for header")]
    ShortHeader,

    /// Magic number is not a rules container
    #[error("invalid magic {0:#010x}")]
    BadMagic(u32),

    /// Container version outside the accepted range
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Declared total size disagrees with the buffer
    #[error("declared size inconsistent with buffer")]
    TruncatedBody,

    /// String table offset outside the record area
    #[error("invalid string table offset")]
    BadStringTableOffset,

    /// Record counts exceed the buffer or overlap the string table
    #[error("record counts exceed buffer")]
    CountsOverflow,

    /// Condition references a signal index past the signal array
    #[error("condition {condition} references invalid signal {signal_idx}")]
    InvalidSignalIdx { condition: usize, signal_idx: u8 },

    /// Condition carries an unknown operation code
    #[error("condition {condition} has invalid operation {code}")]
    InvalidOperation { condition: usize, code: u8 },

    /// HOLD duration outside 0..=86_400_000 ms
    #[error("condition {condition} has invalid hold duration")]
    InvalidHoldDuration { condition: usize },

    /// Action parameter carries an unknown type code
    #[error("action {action} parameter {param} has invalid type {code}")]
    InvalidParamType {
        action: usize,
        param: usize,
        code: u8,
    },

    /// Action capability id is missing or unreadable
    #[error("empty capability id at action {action}")]
    EmptyCapabilityId { action: usize },

    /// Action parameter slice extends past the parameter array
    #[error("action {action} parameter range exceeds parameter array")]
    ParamRangeOverflow { action: usize },

    /// Rule action slice extends past the action array
    #[error("rule {rule} action range exceeds action array")]
    ActionRangeOverflow { rule: usize },

    /// Rule condition mask references a missing condition
    #[error("rule {rule} references non-existent condition {bit}")]
    ConditionMaskOutOfRange { rule: usize, bit: usize },

    /// Body CRC does not match the header
    #[error("CRC mismatch: calculated {calculated:#010x}, stored {stored:#010x}")]
    CrcMismatch { calculated: u32, stored: u32 },
}

/// The four tables decoded from a rules container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRuleset {
    pub signals: Vec<Signal>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub rules: Vec<Rule>,
}

/// CRC-32/IEEE (polynomial 0xEDB88320), as used in all WBP containers
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// ============================================================================
// Little-endian field access
// ============================================================================

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn f32_at(buf: &[u8], off: usize) -> f32 {
    f32::from_bits(u32_at(buf, off))
}

/// Read the NUL-terminated string starting at `offset` in the table.
///
/// Fails when the offset is past the table end or no terminator exists
/// inside the table bounds.
pub fn read_table_string(table: &[u8], offset: u16) -> Option<String> {
    let start = offset as usize;
    if start >= table.len() {
        return None;
    }
    let rest = &table[start..];
    let nul = rest.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&rest[..nul]).into_owned())
}

// ============================================================================
// Rules container parsing
// ============================================================================

/// Parse a WBP rules container into runtime tables.
///
/// Checks run header-first: size/magic/version, declared length, body CRC,
/// then the structural layout, then every record. Any failure leaves the
/// caller's state untouched; trailing bytes past the declared total size are
/// ignored.
pub fn parse_rules(data: &[u8]) -> std::result::Result<ParsedRuleset, ParseError> {
    if data.len() < HEADER_LEN {
        return Err(ParseError::ShortHeader);
    }

    let magic = u32_at(data, 0);
    if magic != RULES_MAGIC {
        return Err(ParseError::BadMagic(magic));
    }

    let version = data[4];
    if !(WBP_MIN_VERSION..=WBP_VERSION).contains(&version) {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let flags = data[5];
    let total_size = u16_at(data, 6) as usize;
    if total_size > data.len() || total_size < HEADER_LEN {
        return Err(ParseError::TruncatedBody);
    }

    let signal_count = data[8] as usize;
    let condition_count = data[9] as usize;
    let action_count = data[10] as usize;
    let rule_count = data[11] as usize;
    let action_param_count = u16_at(data, 12) as usize;
    let string_table_offset = u16_at(data, 16) as usize;
    let stored_crc = u32_at(data, 20);

    // Body CRC before record validation: any corruption past the header must
    // surface as CrcMismatch, not as a downstream record error.
    let calculated = crc32(&data[HEADER_LEN..total_size]);
    if calculated != stored_crc {
        return Err(ParseError::CrcMismatch {
            calculated,
            stored: stored_crc,
        });
    }

    let mut offset = HEADER_LEN;
    if flags & FLAG_HAS_META != 0 {
        offset += META_LEN;
    }

    if string_table_offset < offset || string_table_offset >= total_size {
        return Err(ParseError::BadStringTableOffset);
    }

    let records_len = signal_count * SIGNAL_LEN
        + condition_count * CONDITION_LEN
        + action_count * ACTION_LEN
        + action_param_count * ACTION_PARAM_LEN
        + rule_count * RULE_LEN;
    if offset + records_len > data.len() || string_table_offset < offset + records_len {
        return Err(ParseError::CountsOverflow);
    }

    let table = &data[string_table_offset..total_size];

    // Signals
    let mut signals = Vec::with_capacity(signal_count);
    for _ in 0..signal_count {
        let sig_flags = data[offset + 7];
        signals.push(Signal::new(
            u32_at(data, offset),
            u16_at(data, offset + 4),
            data[offset + 6],
            sig_flags & SIG_FLAG_BIG_ENDIAN != 0,
            sig_flags & SIG_FLAG_SIGNED != 0,
            f32_at(data, offset + 8),
            f32_at(data, offset + 12),
        ));
        offset += SIGNAL_LEN;
    }

    // Conditions
    let mut conditions = Vec::with_capacity(condition_count);
    for i in 0..condition_count {
        let signal_idx = data[offset];
        if signal_idx as usize >= signal_count {
            return Err(ParseError::InvalidSignalIdx {
                condition: i,
                signal_idx,
            });
        }

        let code = data[offset + 1];
        let operation =
            Operation::from_code(code).ok_or(ParseError::InvalidOperation { condition: i, code })?;

        let mut value1 = f32_at(data, offset + 4);
        let mut value2 = f32_at(data, offset + 8);

        if operation == Operation::Hold && !(0.0..=MAX_HOLD_MS).contains(&value1) {
            return Err(ParseError::InvalidHoldDuration { condition: i });
        }

        // Normalize ranges so value1 <= value2
        if matches!(operation, Operation::Within | Operation::Outside) && value2 < value1 {
            std::mem::swap(&mut value1, &mut value2);
        }

        conditions.push(Condition::new(signal_idx, operation, value1, value2));
        offset += CONDITION_LEN;
    }

    // Actions reference the parameter array that follows them
    let actions_offset = offset;
    let params_offset = actions_offset + action_count * ACTION_LEN;
    offset = params_offset + action_param_count * ACTION_PARAM_LEN;

    let mut actions = Vec::with_capacity(action_count);
    for i in 0..action_count {
        let rec = actions_offset + i * ACTION_LEN;
        let cap_str_idx = u16_at(data, rec);
        let param_count = data[rec + 2] as usize;
        let param_start = data[rec + 3] as usize;

        let capability_id = read_table_string(table, cap_str_idx)
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::EmptyCapabilityId { action: i })?;

        if param_start + param_count > action_param_count {
            return Err(ParseError::ParamRangeOverflow { action: i });
        }

        let mut params = Vec::with_capacity(param_count);
        for j in 0..param_count {
            let prec = params_offset + (param_start + j) * ACTION_PARAM_LEN;
            let type_code = data[prec];
            let value = u16_at(data, prec + 2);

            let param_type = ParamType::from_code(type_code).ok_or(ParseError::InvalidParamType {
                action: i,
                param: j,
                code: type_code,
            })?;

            params.push(match param_type {
                ParamType::Int => ParamValue::Int(value as i32),
                ParamType::Bool => ParamValue::Bool(value != 0),
                ParamType::Float => ParamValue::Float(value as f32 / 100.0),
                ParamType::String => {
                    ParamValue::Str(read_table_string(table, value).unwrap_or_default())
                }
            });
        }

        actions.push(Action {
            capability_id,
            params,
        });
    }

    // Rules
    let mut rules = Vec::with_capacity(rule_count);
    for i in 0..rule_count {
        let rec = offset + i * RULE_LEN;
        let flow_id_str_idx = u16_at(data, rec);
        let condition_mask = u32_at(data, rec + 2);
        let action_start_idx = data[rec + 6];
        let rule_action_count = data[rec + 7];
        let debounce_ds = data[rec + 8];
        let cooldown_ds = data[rec + 9];

        for bit in 0..32 {
            if condition_mask & (1 << bit) != 0 && bit >= condition_count {
                return Err(ParseError::ConditionMaskOutOfRange { rule: i, bit });
            }
        }

        if action_start_idx as usize + rule_action_count as usize > action_count {
            return Err(ParseError::ActionRangeOverflow { rule: i });
        }

        let flow_id = read_table_string(table, flow_id_str_idx).unwrap_or_default();

        rules.push(Rule::new(
            flow_id,
            condition_mask,
            action_start_idx,
            rule_action_count,
            debounce_ds as u32 * 10,
            cooldown_ds as u32 * 10,
        ));
    }

    Ok(ParsedRuleset {
        signals,
        conditions,
        actions,
        rules,
    })
}

// ============================================================================
// String table interning
// ============================================================================

/// Builds a deduplicated string table of NUL-terminated entries
#[derive(Debug, Default)]
pub struct StringTableBuilder {
    bytes: Vec<u8>,
    index: std::collections::HashMap<String, u16>,
}

impl StringTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning its table offset. Equal strings share an entry.
    pub fn add(&mut self, s: &str) -> Result<u16> {
        if let Some(&offset) = self.index.get(s) {
            return Ok(offset);
        }

        if self.bytes.len() + s.len() + 1 > MAX_STRING_TABLE {
            return Err(Error::Build("string table overflow".into()));
        }

        let offset = self.bytes.len() as u16;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.index.insert(s.to_owned(), offset);
        Ok(offset)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ============================================================================
// Profile serialization
// ============================================================================

/// Module facts stamped into a serialized profile
#[derive(Debug, Clone, Default)]
pub struct ProfileInfo {
    pub module_id: String,
    pub hw_version: String,
    pub fw_version: String,
    pub serial: String,
    pub uptime_ms: u32,
    pub boot_count: u16,
    /// 0 = no rules, 1 = RAM, 2 = persisted
    pub rules_mode: u8,
    pub rules_crc: u32,
    pub signal_count: u8,
    pub condition_count: u8,
    pub action_count: u8,
    pub rule_count: u8,
}

/// Serialize a module profile container.
///
/// Layout: fixed header, capability records, capability-parameter records,
/// interned string table. Fails with [`Error::ProfileTooLarge`] when the
/// result would exceed `max_len`.
pub fn serialize_profile(
    info: &ProfileInfo,
    capabilities: &[&CapabilityMeta],
    max_len: usize,
) -> Result<Vec<u8>> {
    let mut table = StringTableBuilder::new();

    let module_id_idx = table.add(&info.module_id)?;
    let hw_idx = table.add(&info.hw_version)?;
    let fw_idx = table.add(&info.fw_version)?;
    let serial_idx = table.add(&info.serial)?;

    // Capability and parameter records, strings interned as we go
    let mut cap_records: Vec<[u8; CAPABILITY_LEN]> = Vec::with_capacity(capabilities.len());
    let mut param_records: Vec<[u8; CAP_PARAM_LEN]> = Vec::new();

    for meta in capabilities {
        let id_idx = table.add(&meta.id)?;
        let label_idx = table.add(&meta.label)?;
        let desc_idx = table.add(&meta.description)?;
        let category_idx = table.add(&meta.category)?;

        let param_start = param_records.len();
        for p in &meta.params {
            let name_idx = table.add(&p.name)?;
            let pdesc_idx = table.add(&p.description)?;

            let mut rec = [0u8; CAP_PARAM_LEN];
            rec[0..2].copy_from_slice(&name_idx.to_le_bytes());
            rec[2..4].copy_from_slice(&pdesc_idx.to_le_bytes());
            rec[4] = p.param_type as u8;
            rec[5] = p.required as u8;
            rec[8..10].copy_from_slice(&p.min.to_le_bytes());
            rec[10..12].copy_from_slice(&p.max.to_le_bytes());
            param_records.push(rec);
        }

        let mut rec = [0u8; CAPABILITY_LEN];
        rec[0..2].copy_from_slice(&id_idx.to_le_bytes());
        rec[2..4].copy_from_slice(&label_idx.to_le_bytes());
        rec[4..6].copy_from_slice(&desc_idx.to_le_bytes());
        rec[6..8].copy_from_slice(&category_idx.to_le_bytes());
        rec[8] = meta.params.len() as u8;
        rec[9] = param_start as u8;
        cap_records.push(rec);
    }

    let string_table_offset =
        PROFILE_HEADER_LEN + cap_records.len() * CAPABILITY_LEN + param_records.len() * CAP_PARAM_LEN;
    let total_size = string_table_offset + table.len();
    if total_size > max_len {
        return Err(Error::ProfileTooLarge {
            size: total_size,
            max: max_len,
        });
    }

    let mut out = Vec::with_capacity(total_size);
    out.extend_from_slice(&PROFILE_MAGIC.to_le_bytes());
    out.push(WBP_VERSION);
    out.push(if info.rules_crc != 0 { 0x01 } else { 0x00 });
    out.extend_from_slice(&module_id_idx.to_le_bytes());
    out.extend_from_slice(&hw_idx.to_le_bytes());
    out.extend_from_slice(&fw_idx.to_le_bytes());
    out.extend_from_slice(&serial_idx.to_le_bytes());
    out.push(capabilities.len() as u8);
    out.push(info.rules_mode);
    out.extend_from_slice(&info.rules_crc.to_le_bytes());
    out.push(info.signal_count);
    out.push(info.condition_count);
    out.push(info.action_count);
    out.push(info.rule_count);
    out.extend_from_slice(&info.uptime_ms.to_le_bytes());
    out.extend_from_slice(&info.boot_count.to_le_bytes());
    out.extend_from_slice(&(string_table_offset as u16).to_le_bytes());

    for rec in &cap_records {
        out.extend_from_slice(rec);
    }
    for rec in &param_records {
        out.extend_from_slice(rec);
    }
    out.extend_from_slice(table.as_bytes());

    debug_assert_eq!(out.len(), total_size);
    Ok(out)
}

//! Compile a JSON ruleset definition into a WBP container.
//!
//! Usage:
//!   cargo run --example pack_ruleset              # built-in demo ruleset
//!   cargo run --example pack_ruleset rules.json   # compile a definition file
//!
//! Prints the container summary plus the SET:RULES command line a host would
//! use to install it.

use std::env;
use std::fs;

use rulebus::{
    crc32, parse_rules, serialize_rules, ActionDef, ConditionDef, ParamDef, RuleDef, RulesetDef,
    SignalDef,
};

fn demo_ruleset() -> RulesetDef {
    RulesetDef {
        signals: vec![
            // Coolant temperature: 8 bits, factor 1, -40 offset
            SignalDef {
                can_id: 0x3E8,
                start_bit: 0,
                bit_length: 8,
                big_endian: false,
                signed: false,
                factor: 1.0,
                offset: -40.0,
            },
            // Engine speed: 16 bits little-endian, 0.25 rpm/bit
            SignalDef {
                can_id: 0x3E9,
                start_bit: 0,
                bit_length: 16,
                big_endian: false,
                signed: false,
                factor: 0.25,
                offset: 0.0,
            },
        ],
        conditions: vec![
            ConditionDef {
                signal: 0,
                op: "gt".into(),
                value1: 105.0,
                value2: 0.0,
            },
            ConditionDef {
                signal: 1,
                op: "hold".into(),
                value1: 2000.0,
                value2: 0.0,
            },
        ],
        rules: vec![RuleDef {
            flow_id: "overheat-warn".into(),
            conditions: vec![0, 1],
            actions: vec![ActionDef {
                capability: "warn".into(),
                params: vec![
                    ParamDef::Str("coolant overtemp".into()),
                    ParamDef::Int(3),
                ],
            }],
            debounce_ds: 10,
            cooldown_ds: 50,
        }],
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let def = if let Some(path) = args.get(1) {
        let json = fs::read_to_string(path).expect("read definition file");
        RulesetDef::from_json(&json).expect("parse definition")
    } else {
        println!("No definition file given, using the built-in demo ruleset\n");
        demo_ruleset()
    };

    let bytes = serialize_rules(&def).expect("compile ruleset");
    let crc = crc32(&bytes);

    let parsed = parse_rules(&bytes).expect("self-check");
    println!("Compiled WBP rules container:");
    println!("  {} bytes, CRC32 {:#010x}", bytes.len(), crc);
    println!(
        "  {} signals, {} conditions, {} actions, {} rules",
        parsed.signals.len(),
        parsed.conditions.len(),
        parsed.actions.len(),
        parsed.rules.len()
    );

    let out_path = "ruleset.wbp";
    fs::write(out_path, &bytes).expect("write container");
    println!("\nWrote {}", out_path);
    println!(
        "Install with: SET:RULES:NVS:{}:{}  (then stream the file, then END)",
        bytes.len(),
        crc
    );
}

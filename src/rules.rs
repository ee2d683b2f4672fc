//! Injection engine (C5): compiles the declarative rule set and
//! applies match-and-mutate to control, bulk, and interrupt traffic.
//!
//! The engine itself is pure — no I/O — so it's safe to call from any
//! pipeline thread without synchronization once compiled.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::{ProxyError, Result};
use crate::queue::MAX_TRANSFER;

/// JSON shape accepted for a field that is normally a decimal integer
/// but has historically also shown up as a hex-looking string. Per
/// spec §6: numeric fields are base-10 unless prefixed `0x`/`0X`.
fn parse_numeric_field(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u32>().map_err(|e| e.to_string())
    }
}

struct NumberOrString;

impl<'de> Visitor<'de> for NumberOrString {
    type Value = u32;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a decimal integer, or a string with an optional 0x prefix")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<u32, E> {
        Ok(v as u32)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<u32, E> {
        Ok(v as u32)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<u32, E> {
        parse_numeric_field(v).map_err(E::custom)
    }
}

fn de_numeric<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    deserializer.deserialize_any(NumberOrString)
}

fn de_numeric_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u32>, D::Error> {
    Ok(Some(de_numeric(deserializer)?))
}

/// Decodes a pattern/replacement string with `\xHH` escapes into raw
/// bytes. Everything that is not a `\xHH` escape passes through as its
/// own byte — this is deliberately a byte-oriented operation, not a
/// text one (spec §9, "string-based pattern matching over binary
/// data").
pub fn decode_escaped(s: &str) -> std::result::Result<Vec<u8>, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if (bytes[i] == b'\\')
            && i + 3 < bytes.len()
            && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X')
        {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4])
                .map_err(|_| "invalid \\x escape".to_string())?;
            let byte = u8::from_str_radix(hex, 16).map_err(|e| e.to_string())?;
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

// --- Raw (serde) rule model: the JSON value-producer boundary ---

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawRuleSet {
    #[serde(default)]
    pub control: Vec<RawControlRule>,
    #[serde(default)]
    pub bulk: Vec<RawDataRule>,
    #[serde(default)]
    pub int: Vec<RawDataRule>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RawControlRule {
    #[serde(default, deserialize_with = "de_numeric_opt")]
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: Option<u32>,
    #[serde(default, deserialize_with = "de_numeric_opt")]
    #[serde(rename = "bRequest")]
    pub b_request: Option<u32>,
    #[serde(default, deserialize_with = "de_numeric_opt")]
    #[serde(rename = "wValue")]
    pub w_value: Option<u32>,
    #[serde(default, deserialize_with = "de_numeric_opt")]
    #[serde(rename = "wIndex")]
    pub w_index: Option<u32>,
    #[serde(default, deserialize_with = "de_numeric_opt")]
    #[serde(rename = "wLength")]
    pub w_length: Option<u32>,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub content_pattern: Vec<String>,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RawDataRule {
    #[serde(deserialize_with = "de_numeric")]
    pub ep_address: u32,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub content_pattern: Vec<String>,
    #[serde(default)]
    pub replacement: String,
}

fn default_enable() -> bool {
    true
}

// --- Compiled rule model ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Modify,
    Ignore,
    Stall,
}

#[derive(Debug, Clone, Default)]
pub struct ControlMatch {
    pub bm_request_type: Option<u8>,
    pub b_request: Option<u8>,
    pub w_value: Option<u16>,
    pub w_index: Option<u16>,
    pub w_length: Option<u16>,
}

impl ControlMatch {
    fn matches(&self, setup: &crate::proto::SetupPacket) -> bool {
        self.bm_request_type.map_or(true, |v| v == setup.bmRequestType)
            && self.b_request.map_or(true, |v| v == setup.bRequest)
            && self.w_value.map_or(true, |v| v == setup.wValue)
            && self.w_index.map_or(true, |v| v == setup.wIndex)
            && self.w_length.map_or(true, |v| v == setup.wLength)
    }
}

#[derive(Debug, Clone)]
pub struct ControlRule {
    pub matcher: ControlMatch,
    pub action: Action,
    pub patterns: Vec<Vec<u8>>,
    pub replacement: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DataRule {
    pub ep_address: u8,
    pub patterns: Vec<Vec<u8>>,
    pub replacement: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ControlAction {
    Forward(Vec<u8>),
    Drop,
    Stall,
}

/// Compiled, validated, immutable rule set (spec §3/§4.5).
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    control: Vec<ControlRule>,
    data: HashMap<u8, Vec<DataRule>>,
}

impl CompiledRules {
    pub fn empty() -> Self {
        CompiledRules::default()
    }

    pub fn compile(raw: RawRuleSet) -> Result<Self> {
        let mut control = Vec::new();
        for rule in raw.control {
            if !rule.enable {
                continue;
            }
            control.push(compile_control_rule(rule)?);
        }

        let mut data: HashMap<u8, Vec<DataRule>> = HashMap::new();
        for rule in raw.bulk.into_iter().chain(raw.int.into_iter()) {
            if !rule.enable {
                continue;
            }
            let compiled = compile_data_rule(rule)?;
            data.entry(compiled.ep_address).or_default().push(compiled);
        }

        Ok(CompiledRules { control, data })
    }

    /// Scans control rules in declaration order; the first whose
    /// matcher fits the setup packet wins. Unmatched requests forward
    /// the payload unchanged.
    pub fn apply_control(
        &self,
        setup: &crate::proto::SetupPacket,
        payload: &[u8],
    ) -> ControlAction {
        for rule in &self.control {
            if !rule.matcher.matches(setup) {
                continue;
            }
            return match rule.action {
                Action::Stall => ControlAction::Stall,
                Action::Ignore => ControlAction::Drop,
                Action::Modify => {
                    ControlAction::Forward(apply_replacements(payload, &rule.patterns, &rule.replacement))
                }
            };
        }
        ControlAction::Forward(payload.to_vec())
    }

    /// Applies every `modify` rule registered for `ep_address`, in
    /// declaration order.
    pub fn apply_data(&self, ep_address: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = payload.to_vec();
        if let Some(rules) = self.data.get(&ep_address) {
            for rule in rules {
                data = apply_replacements(&data, &rule.patterns, &rule.replacement);
            }
        }
        data
    }
}

fn compile_control_rule(rule: RawControlRule) -> Result<ControlRule> {
    let action = match rule.action.as_deref() {
        Some("stall") => Action::Stall,
        Some("ignore") => Action::Ignore,
        Some("modify") | None => Action::Modify,
        Some(other) => {
            return Err(ProxyError::RuleInvalid(format!("unknown control rule action '{}'", other)))
        }
    };
    let patterns = decode_patterns(&rule.content_pattern)?;
    let replacement = decode_escaped(&rule.replacement).map_err(ProxyError::RuleInvalid)?;
    Ok(ControlRule {
        matcher: ControlMatch {
            bm_request_type: narrow_u8(rule.bm_request_type)?,
            b_request: narrow_u8(rule.b_request)?,
            w_value: narrow_u16(rule.w_value)?,
            w_index: narrow_u16(rule.w_index)?,
            w_length: narrow_u16(rule.w_length)?,
        },
        action,
        patterns,
        replacement,
    })
}

fn compile_data_rule(rule: RawDataRule) -> Result<DataRule> {
    let ep_address = u8::try_from(rule.ep_address)
        .map_err(|_| ProxyError::RuleInvalid(format!("ep_address {} out of range", rule.ep_address)))?;
    let patterns = decode_patterns(&rule.content_pattern)?;
    let replacement = decode_escaped(&rule.replacement).map_err(ProxyError::RuleInvalid)?;
    Ok(DataRule { ep_address, patterns, replacement })
}

fn decode_patterns(patterns: &[String]) -> Result<Vec<Vec<u8>>> {
    patterns
        .iter()
        .map(|p| decode_escaped(p).map_err(ProxyError::RuleInvalid))
        .collect()
}

fn narrow_u8(value: Option<u32>) -> Result<Option<u8>> {
    match value {
        None => Ok(None),
        Some(v) => u8::try_from(v)
            .map(Some)
            .map_err(|_| ProxyError::RuleInvalid(format!("value {} does not fit in a u8 field", v))),
    }
}

fn narrow_u16(value: Option<u32>) -> Result<Option<u16>> {
    match value {
        None => Ok(None),
        Some(v) => u16::try_from(v)
            .map(Some)
            .map_err(|_| ProxyError::RuleInvalid(format!("value {} does not fit in a u16 field", v))),
    }
}

/// Applies every pattern's find-replace over `payload`, left to right,
/// one pattern at a time. If any step would grow the payload beyond
/// [`MAX_TRANSFER`], the whole rule is skipped and the original payload
/// is returned unchanged (spec §4.5/§7).
fn apply_replacements(payload: &[u8], patterns: &[Vec<u8>], replacement: &[u8]) -> Vec<u8> {
    let mut out = payload.to_vec();
    for pattern in patterns {
        if pattern.is_empty() {
            continue;
        }
        let candidate = find_replace_all(&out, pattern, replacement);
        if candidate.len() > MAX_TRANSFER {
            log::warn!(
                "injection rule would grow payload to {} bytes (max {}), skipping",
                candidate.len(),
                MAX_TRANSFER
            );
            return payload.to_vec();
        }
        out = candidate;
    }
    out
}

/// Non-overlapping, left-to-right byte find/replace.
fn find_replace_all(haystack: &[u8], pattern: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(pattern) {
            out.extend_from_slice(replacement);
            i += pattern.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SetupPacket;

    fn setup(bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> SetupPacket {
        SetupPacket { bmRequestType: bm_request_type, bRequest: b_request, wValue: w_value, wIndex: w_index, wLength: w_length }
    }

    #[test]
    fn decodes_hex_escapes_and_raw_bytes() {
        assert_eq!(decode_escaped(r"\x01\x00\x00\x00").unwrap(), vec![1, 0, 0, 0]);
        assert_eq!(decode_escaped("AB").unwrap(), vec![b'A', b'B']);
    }

    #[test]
    fn numeric_field_parses_decimal_and_0x_hex() {
        assert_eq!(parse_numeric_field("129").unwrap(), 129);
        assert_eq!(parse_numeric_field("0x81").unwrap(), 0x81);
        assert_eq!(parse_numeric_field("81").unwrap(), 81); // decimal, NOT hex 0x81
    }

    #[test]
    fn mouse_button_swap_scenario_s3() {
        let raw = RawRuleSet {
            control: vec![],
            bulk: vec![],
            int: vec![RawDataRule {
                ep_address: 129,
                enable: true,
                content_pattern: vec![r"\x01\x00\x00\x00".to_string()],
                replacement: r"\x02\x00\x00\x00".to_string(),
            }],
        };
        let compiled = CompiledRules::compile(raw).unwrap();
        let out = compiled.apply_data(0x81, &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(out, vec![0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn control_stall_scenario_s4() {
        let raw = RawRuleSet {
            control: vec![RawControlRule {
                bm_request_type: None,
                b_request: Some(6),
                w_value: None,
                w_index: None,
                w_length: None,
                enable: true,
                action: Some("stall".to_string()),
                content_pattern: vec![],
                replacement: String::new(),
            }],
            bulk: vec![],
            int: vec![],
        };
        let compiled = CompiledRules::compile(raw).unwrap();
        let action = compiled.apply_control(&setup(0x80, 6, 0x0100, 0, 18), &[]);
        assert!(matches!(action, ControlAction::Stall));
    }

    #[test]
    fn ignore_action_drops_without_forwarding() {
        let raw = RawRuleSet {
            control: vec![RawControlRule {
                bm_request_type: None,
                b_request: Some(6),
                w_value: None,
                w_index: None,
                w_length: None,
                enable: true,
                action: Some("ignore".to_string()),
                content_pattern: vec![],
                replacement: String::new(),
            }],
            bulk: vec![],
            int: vec![],
        };
        let compiled = CompiledRules::compile(raw).unwrap();
        let action = compiled.apply_control(&setup(0x80, 6, 0, 0, 18), &[1, 2, 3]);
        assert!(matches!(action, ControlAction::Drop));
    }

    #[test]
    fn disabled_rule_is_not_compiled() {
        let raw = RawRuleSet {
            control: vec![RawControlRule {
                bm_request_type: None,
                b_request: Some(6),
                w_value: None,
                w_index: None,
                w_length: None,
                enable: false,
                action: Some("stall".to_string()),
                content_pattern: vec![],
                replacement: String::new(),
            }],
            bulk: vec![],
            int: vec![],
        };
        let compiled = CompiledRules::compile(raw).unwrap();
        let action = compiled.apply_control(&setup(0x80, 6, 0, 0, 18), &[9]);
        assert!(matches!(action, ControlAction::Forward(ref v) if v == &[9]));
    }

    #[test]
    fn oversized_replacement_skips_rule_and_forwards_original() {
        let pattern = vec![0u8];
        let replacement = vec![0u8; MAX_TRANSFER + 1];
        let payload = vec![0u8; 1];
        let out = apply_replacements(&payload, &[pattern], &replacement);
        assert_eq!(out, payload);
    }

    #[test]
    fn find_replace_is_left_to_right_non_overlapping() {
        let out = find_replace_all(&[1, 1, 1], &[1, 1], &[9]);
        assert_eq!(out, vec![9, 1]);
    }
}

//! Device identity: parses `iPod_Control/Device/SysInfo` and maps the model
//! number to a checksum scheme and (purely for diagnostics) a human name.

use std::collections::HashMap;
use std::path::Path;

use crate::checksum::ChecksumKind;

#[derive(Debug, Clone, Default)]
pub struct SysInfo {
    pub model_num_str: Option<String>,
    pub firewire_guid: Option<String>,
    pub serial_number: Option<String>,
    pub board_hw_name: Option<String>,
    pub visible_build_id: Option<String>,
}

/// Parse simple `Key: value` lines. Unknown keys are ignored.
pub fn parse_sysinfo(contents: &str) -> SysInfo {
    let mut fields: HashMap<String, String> = HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    SysInfo {
        model_num_str: fields.get("ModelNumStr").cloned(),
        firewire_guid: fields.get("FirewireGuid").cloned(),
        serial_number: fields.get("pszSerialNumber").cloned(),
        board_hw_name: fields.get("BoardHwName").cloned(),
        visible_build_id: fields.get("visibleBuildID").cloned(),
    }
}

pub fn read_sysinfo(mount: &Path) -> std::io::Result<SysInfo> {
    let contents = std::fs::read_to_string(mount.join("iPod_Control/Device/SysInfo"))?;
    Ok(parse_sysinfo(&contents))
}

/// Known model-number prefixes, purely for diagnostic output.
struct ModelEntry {
    prefix: &'static str,
    name: &'static str,
    generation: &'static str,
}

const MODEL_TABLE: &[ModelEntry] = &[
    ModelEntry { prefix: "MB029", name: "iPod Classic", generation: "6G 80GB" },
    ModelEntry { prefix: "MB147", name: "iPod Classic", generation: "6G 160GB" },
    ModelEntry { prefix: "MC293", name: "iPod Classic", generation: "6G 160GB (2009)" },
    ModelEntry { prefix: "MA446", name: "iPod Video", generation: "5G 30GB" },
    ModelEntry { prefix: "MA448", name: "iPod Video", generation: "5G 60GB" },
    ModelEntry { prefix: "MA350", name: "iPod Nano", generation: "2G" },
];

pub fn describe_model(model_num_str: &str) -> Option<(&'static str, &'static str)> {
    let prefix: String = model_num_str.chars().take(5).collect();
    MODEL_TABLE
        .iter()
        .find(|entry| entry.prefix.eq_ignore_ascii_case(&prefix))
        .map(|entry| (entry.name, entry.generation))
}

/// Extract the leading `M` + digits model number, tolerating trailing
/// locale/color suffixes (`MB029LL/A` -> `MB029`).
pub fn normalize_model_number(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if !raw.starts_with('M') {
        return None;
    }
    let tail: String = raw.chars().skip(1).take_while(|c| c.is_ascii_digit()).collect();
    if tail.is_empty() {
        None
    } else {
        Some(format!("M{}", tail))
    }
}

/// Detection cascade described in the checksum engine's companion table:
/// known model prefix -> `HashInfo` file presence -> firmware-version
/// heuristic -> conservative FireWire-GUID-present fallback -> `None`.
pub fn detect_checksum_kind(mount: &Path, sysinfo: &SysInfo) -> ChecksumKind {
    if let Some(model) = sysinfo.model_num_str.as_deref().and_then(normalize_model_number) {
        if let Some(kind) = checksum_kind_for_model(&model) {
            return kind;
        }
    }
    if mount.join("iPod_Control/Device/HashInfo").exists() {
        return ChecksumKind::Hash72;
    }
    if let Some(build) = &sysinfo.visible_build_id {
        if build_implies_hash72(build) {
            return ChecksumKind::Hash72;
        }
    }
    if sysinfo.firewire_guid.is_some() {
        return ChecksumKind::Unknown;
    }
    ChecksumKind::None
}

fn checksum_kind_for_model(model: &str) -> Option<ChecksumKind> {
    match model {
        "MB029" | "MB147" | "MC293" => Some(ChecksumKind::Hash72),
        "MA446" | "MA448" | "MA350" => Some(ChecksumKind::Hash58),
        _ => None,
    }
}

/// Parse the hex `FirewireGuid` SysInfo value into the `u64` the HASH58
/// key derivation expects.
pub fn parse_firewire_guid(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim(), 16).ok()
}

fn build_implies_hash72(build_id: &str) -> bool {
    // Later firmware build stamps (observed on 6th-generation devices)
    // start with "9" or higher; earlier ones start with "1"-"7".
    build_id.chars().next().map(|c| c.is_ascii_digit() && c >= '8').unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_locale_suffix() {
        assert_eq!(normalize_model_number("MB029LL/A").as_deref(), Some("MB029"));
    }

    #[test]
    fn parse_sysinfo_reads_known_keys() {
        let text = "ModelNumStr: MB029LL/A\nFirewireGuid: 000a1b2c3d4e5f60\nBuildID: 9A405\n";
        let info = parse_sysinfo(text);
        assert_eq!(info.model_num_str.as_deref(), Some("MB029LL/A"));
        assert_eq!(info.firewire_guid.as_deref(), Some("000a1b2c3d4e5f60"));
    }

    #[test]
    fn known_model_resolves_hash72() {
        let sysinfo = SysInfo { model_num_str: Some("MB029LL/A".into()), ..Default::default() };
        assert_eq!(checksum_kind_for_model("MB029"), Some(ChecksumKind::Hash72));
        let _ = sysinfo;
    }
}

//! Attribute grammar for catalogue entries.
//!
//! Keys are matched case-insensitively after trimming; values stay the raw
//! strings the catalogue delivered. Unknown keys are ignored.

pub const ATTR_READ_ONLY: &str = "readonly";
pub const ATTR_IGNORED: &str = "ignored";
pub const ATTR_DEFAULT: &str = "default";
pub const ATTR_LOWER_BORDER: &str = "lowerborder";
pub const ATTR_UPPER_BORDER: &str = "upperborder";
pub const ATTR_ON_SET: &str = "onset";
pub const ATTR_ON_GET: &str = "onget";
pub const ATTR_ON_CLEAR: &str = "onclear";
pub const ATTR_ON_CHANGE: &str = "onchange";

/// Normalised attribute block of one catalogue entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeSet {
    entries: Vec<(String, String)>,
}

impl AttributeSet {
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let entries = pairs
            .iter()
            .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.clone()))
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value recorded under `key` (already lowercased keys).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Presence-style flags (`readonly`, `ignored`): the key being listed
    /// is the signal, the value does not matter.
    pub fn flag(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }
}

/// `"true"` (any casing) is true, everything else false.
pub fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Integer attribute values; tolerates float notation by truncation.
pub fn parse_int(value: &str) -> Option<i128> {
    let trimmed = value.trim();
    if let Ok(n) = trimmed.parse::<i128>() {
        return Some(n);
    }
    trimmed.parse::<f64>().ok().map(|f| f as i128)
}

pub fn parse_float(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

//! Option normalisation.
//!
//! Requests carry loosely-typed option maps (`{"videoEncoder": "H.264",
//! "width": "640"}`). [`OptionNormalizer::normalize`] turns them into a complete,
//! canonically ordered [`NormalizedOptions`] for one [`OutputKind`]: option names
//! and enumerated values collapse to one spelling, numbers are parsed and range
//! checked, and every unset option takes its default.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use super::kind::OutputKind;
use crate::config::Config;
use crate::error::{Result, TranscodeError};

/// Options as supplied by a caller.
pub type RawOptions = serde_json::Map<String, Value>;

/// Option name that pulls in a configured preset.
const PRESET_KEY: &str = "preset";

/// Plain numbers at or above this are read as bit/s rather than kbit/s.
const BITRATE_BPS_THRESHOLD: f64 = 100_000.0;

static BITRATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*([kKmM])?\s*(?:bps|b/s|bit/s)?$").expect("valid regex")
});

// Short hex needs its prefix so names like "red" or "bed" stay names
static HEX_COLOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:#|0x)([0-9a-fA-F]{3})|(?:#|0x)?([0-9a-fA-F]{6}))$").expect("valid regex")
});

static NAMED_COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]{3,24}$").expect("valid regex"));

/// A canonical option value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Derived at generation time (e.g. from the source dimensions).
    Auto,
    Number(u64),
    Flag(bool),
    Token(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Number(n) => write!(f, "{}", n),
            Self::Flag(b) => write!(f, "{}", b),
            Self::Token(t) => f.write_str(t),
        }
    }
}

/// An accepted value of a choice option and its alternative spellings.
#[derive(Debug)]
pub(crate) struct Choice {
    pub token: &'static str,
    pub aliases: &'static [&'static str],
}

#[derive(Debug)]
pub(crate) enum OptionType {
    Number { min: u64, max: u64 },
    /// A pixel edge length, or `auto`.
    Dimension { max: u64 },
    /// kbit/s.
    Bitrate { max: u64 },
    Flag,
    Choice(&'static [Choice]),
    Color,
}

#[derive(Debug)]
pub(crate) enum DefaultValue {
    Auto,
    Number(u64),
    Flag(bool),
    Token(&'static str),
}

impl DefaultValue {
    fn to_value(&self) -> OptionValue {
        match self {
            Self::Auto => OptionValue::Auto,
            Self::Number(n) => OptionValue::Number(*n),
            Self::Flag(b) => OptionValue::Flag(*b),
            Self::Token(t) => OptionValue::Token((*t).to_string()),
        }
    }
}

/// Definition of one option of an output kind.
#[derive(Debug)]
pub(crate) struct OptionSpec {
    pub name: &'static str,
    /// Legacy or alternative names, already squashed.
    pub aliases: &'static [&'static str],
    pub ty: OptionType,
    pub default: DefaultValue,
}

impl OptionSpec {
    fn matches(&self, squashed: &str) -> bool {
        squash(self.name) == squashed || self.aliases.contains(&squashed)
    }
}

/// Lowercase and drop everything but ASCII letters and digits.
fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A complete, canonical option set for one output kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedOptions {
    kind: OutputKind,
    values: BTreeMap<&'static str, OptionValue>,
}

impl NormalizedOptions {
    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    /// Numeric value; `None` when unset (`auto`) or not numeric.
    pub fn number(&self, name: &str) -> Option<u64> {
        match self.values.get(name) {
            Some(OptionValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Flag(true)))
    }

    pub fn token(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::Token(t)) => Some(t),
            _ => None,
        }
    }

    /// Options in canonical (name) order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    /// Canonical serialisation, `name=value` pairs joined by `;`.
    pub fn canonical(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Turns raw request options into [`NormalizedOptions`].
///
/// Holds the configured presets and format allow-lists; normalisation itself
/// performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct OptionNormalizer {
    presets: BTreeMap<String, RawOptions>,
    allowed: BTreeMap<OutputKind, BTreeSet<&'static str>>,
}

impl OptionNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration, validating allow-lists and presets.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut normalizer = Self::new();
        for (kind, tokens) in [
            (OutputKind::Video, &config.formats.video),
            (OutputKind::Audio, &config.formats.audio),
            (OutputKind::Thumbnail, &config.formats.thumbnail),
        ] {
            if !tokens.is_empty() {
                normalizer = normalizer.with_allowed_formats(kind, tokens)?;
            }
        }
        for (name, options) in &config.presets {
            normalizer = normalizer.with_preset(name, options.clone())?;
        }
        Ok(normalizer)
    }

    /// Restrict the format option of `kind` to `tokens` (any accepted spelling).
    pub fn with_allowed_formats<S: AsRef<str>>(mut self, kind: OutputKind, tokens: &[S]) -> Result<Self> {
        let spec = format_spec(kind).ok_or_else(|| {
            TranscodeError::Config(format!("{} output has no selectable format", kind))
        })?;
        let OptionType::Choice(choices) = &spec.ty else {
            return Err(TranscodeError::Config(format!("{} format is not a choice", kind)));
        };

        let mut allowed = BTreeSet::new();
        for token in tokens {
            let token = token.as_ref();
            let choice = match_choice(choices, token).ok_or_else(|| {
                TranscodeError::Config(format!("unknown {} format {:?}", kind, token))
            })?;
            allowed.insert(choice);
        }
        self.allowed.insert(kind, allowed);
        Ok(self)
    }

    /// Register a named preset. It must be valid for at least one output kind.
    pub fn with_preset(mut self, name: &str, options: RawOptions) -> Result<Self> {
        if options.keys().any(|k| squash(k) == PRESET_KEY) {
            return Err(TranscodeError::Config(format!(
                "preset {:?} cannot reference another preset",
                name
            )));
        }

        let mut last_err = None;
        let valid = OutputKind::ALL.iter().any(|kind| {
            match resolve_entries(*kind, &options) {
                Ok(_) => true,
                Err(e) => {
                    last_err = Some(e);
                    false
                }
            }
        });
        if !valid {
            return Err(TranscodeError::Config(format!(
                "preset {:?} is not valid for any output kind: {}",
                name,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )));
        }

        self.presets.insert(name.to_string(), options);
        Ok(self)
    }

    /// Normalise `raw` for `kind`.
    ///
    /// # Errors
    ///
    /// [`TranscodeError::InvalidOptions`] for unknown names, unparseable or
    /// out-of-range values, formats outside the allow-list and unknown presets.
    pub fn normalize(&self, kind: OutputKind, raw: &RawOptions) -> Result<NormalizedOptions> {
        let mut request = raw.clone();
        let preset_name = take_preset(&mut request)?;

        let mut values = BTreeMap::new();
        if let Some(name) = preset_name {
            let preset = self.presets.get(&name).ok_or_else(|| {
                TranscodeError::invalid_options(format!("unknown preset {:?}", name))
            })?;
            values.extend(resolve_entries(kind, preset)?);
        }
        values.extend(resolve_entries(kind, &request)?);

        for spec in kind.option_schema() {
            values
                .entry(spec.name)
                .or_insert_with(|| spec.default.to_value());
        }

        if let (Some(allowed), Some(spec)) = (self.allowed.get(&kind), format_spec(kind)) {
            if let Some(OptionValue::Token(token)) = values.get(spec.name) {
                if !allowed.contains(token.as_str()) {
                    return Err(TranscodeError::invalid_options(format!(
                        "{} {} {:?} is not allowed",
                        kind, spec.name, token
                    )));
                }
            }
        }

        Ok(NormalizedOptions { kind, values })
    }
}

/// The option that selects the output format of `kind`, if any.
fn format_spec(kind: OutputKind) -> Option<&'static OptionSpec> {
    let name = match kind {
        OutputKind::Video | OutputKind::Audio => "encoder",
        OutputKind::Thumbnail => "format",
        OutputKind::Gif => return None,
    };
    kind.option_schema().iter().find(|s| s.name == name)
}

fn take_preset(raw: &mut RawOptions) -> Result<Option<String>> {
    let keys: Vec<String> = raw
        .keys()
        .filter(|k| squash(k) == PRESET_KEY)
        .cloned()
        .collect();
    if keys.len() > 1 {
        return Err(TranscodeError::invalid_options("preset given more than once"));
    }
    let Some(key) = keys.into_iter().next() else {
        return Ok(None);
    };
    match raw.remove(&key) {
        Some(Value::String(name)) => Ok(Some(name)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(TranscodeError::invalid_options(format!(
            "preset must be a name, got {}",
            other
        ))),
    }
}

/// Resolve every entry of `raw` against the schema of `kind`.
fn resolve_entries(
    kind: OutputKind,
    raw: &RawOptions,
) -> Result<BTreeMap<&'static str, OptionValue>> {
    let schema = kind.option_schema();
    let mut values = BTreeMap::new();

    for (key, value) in raw {
        let squashed = squash(key);
        let spec = schema.iter().find(|s| s.matches(&squashed)).ok_or_else(|| {
            TranscodeError::invalid_options(format!("unknown {} option {:?}", kind, key))
        })?;

        let parsed = parse_value(spec, value)?;
        if values.insert(spec.name, parsed).is_some() {
            return Err(TranscodeError::invalid_options(format!(
                "option {} given more than once",
                spec.name
            )));
        }
    }

    Ok(values)
}

fn invalid(spec: &OptionSpec, value: &Value, expected: impl fmt::Display) -> TranscodeError {
    TranscodeError::invalid_options(format!(
        "option {}: expected {}, got {}",
        spec.name, expected, value
    ))
}

fn parse_value(spec: &OptionSpec, value: &Value) -> Result<OptionValue> {
    match &spec.ty {
        OptionType::Number { min, max } => {
            let n = as_whole_number(value)
                .filter(|n| (*min..=*max).contains(n))
                .ok_or_else(|| invalid(spec, value, format_args!("a number in {}..={}", min, max)))?;
            Ok(OptionValue::Number(n))
        }
        OptionType::Dimension { max } => {
            if is_auto(value) {
                return Ok(OptionValue::Auto);
            }
            let n = as_whole_number(value)
                .filter(|n| (1..=*max).contains(n))
                .ok_or_else(|| {
                    invalid(spec, value, format_args!("\"auto\" or a size in 1..={}", max))
                })?;
            Ok(OptionValue::Number(n))
        }
        OptionType::Bitrate { max } => {
            let kbps = parse_bitrate(value)
                .filter(|k| (1..=*max).contains(k))
                .ok_or_else(|| {
                    invalid(spec, value, format_args!("a bitrate such as \"800k\" (1..={} kbit/s)", max))
                })?;
            Ok(OptionValue::Number(kbps))
        }
        OptionType::Flag => parse_flag(value)
            .map(OptionValue::Flag)
            .ok_or_else(|| invalid(spec, value, "a boolean")),
        OptionType::Choice(choices) => {
            let token = value
                .as_str()
                .and_then(|s| match_choice(choices, s))
                .ok_or_else(|| {
                    let accepted: Vec<&str> = choices.iter().map(|c| c.token).collect();
                    invalid(spec, value, format_args!("one of {}", accepted.join(", ")))
                })?;
            Ok(OptionValue::Token(token.to_string()))
        }
        OptionType::Color => value
            .as_str()
            .and_then(parse_color)
            .map(OptionValue::Token)
            .ok_or_else(|| invalid(spec, value, "a colour such as \"#000000\" or \"black\"")),
    }
}

fn match_choice(choices: &'static [Choice], input: &str) -> Option<&'static str> {
    let squashed = squash(input);
    choices
        .iter()
        .find(|c| squash(c.token) == squashed || c.aliases.iter().any(|a| squash(a) == squashed))
        .map(|c| c.token)
}

fn is_auto(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("auto")
        }
        Value::Number(n) => n.as_u64() == Some(0),
        _ => false,
    }
}

/// Non-negative whole number from a JSON number or numeric string.
/// Fractional values are rounded.
fn as_whole_number(value: &Value) -> Option<u64> {
    let f = match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                return Some(u);
            }
            n.as_f64()?
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(u) = s.parse::<u64>() {
                return Some(u);
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (f.is_finite() && f >= 0.0).then(|| f.round() as u64)
}

/// Bitrate in kbit/s from `800`, `"800k"`, `"2M"`, `800000` or `"800 kbps"`.
fn parse_bitrate(value: &Value) -> Option<u64> {
    let (amount, unit) = match value {
        Value::Number(n) => (n.as_f64()?, None),
        Value::String(s) => {
            let caps = BITRATE_RE.captures(s.trim())?;
            let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
            (amount, caps.get(2).map(|m| m.as_str().to_ascii_lowercase()))
        }
        _ => return None,
    };
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }

    let kbps = match unit.as_deref() {
        Some("k") => amount,
        Some("m") => amount * 1000.0,
        _ if amount >= BITRATE_BPS_THRESHOLD => amount / 1000.0,
        _ => amount,
    };
    Some(kbps.round() as u64)
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `#rgb`, `#rrggbb`, `0xrrggbb` or a colour name, as `#rrggbb` or lowercase name.
fn parse_color(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(caps) = HEX_COLOR_RE.captures(input) {
        let hex = match (caps.get(1), caps.get(2)) {
            (Some(short), _) => short
                .as_str()
                .to_ascii_lowercase()
                .chars()
                .flat_map(|c| [c, c])
                .collect(),
            (None, Some(full)) => full.as_str().to_ascii_lowercase(),
            (None, None) => return None,
        };
        return Some(format!("#{}", hex));
    }
    NAMED_COLOR_RE
        .is_match(input)
        .then(|| input.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn raw(value: Value) -> RawOptions {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_defaults_fill_every_option() {
        let opts = OptionNormalizer::new()
            .normalize(OutputKind::Video, &RawOptions::new())
            .unwrap();
        assert_eq!(opts.token("encoder"), Some("h264"));
        assert_eq!(opts.get("width"), Some(&OptionValue::Auto));
        assert_eq!(opts.number("bitrate"), Some(800));
        assert_eq!(opts.number("frame_rate"), Some(15));
        assert_eq!(opts.token("aspect_ratio"), Some("letterbox"));
        assert_eq!(opts.token("letterbox_color"), Some("black"));
        assert!(opts.flag("sharpen"));
        assert_eq!(opts.iter().count(), OutputKind::Video.option_schema().len());
    }

    #[test]
    fn test_equivalent_spellings_collapse() {
        let normalizer = OptionNormalizer::new();
        let a = normalizer
            .normalize(
                OutputKind::Video,
                &raw(json!({"videoEncoder": "H.264", "bitRate": "800k", "width": "640"})),
            )
            .unwrap();
        let b = normalizer
            .normalize(
                OutputKind::Video,
                &raw(json!({"width": 640, "encoder": "h264", "bitrate": 800000})),
            )
            .unwrap();
        let c = normalizer
            .normalize(OutputKind::Video, &raw(json!({"format": "mp4", "WIDTH": 640.0})))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.canonical(), c.canonical());
    }

    #[test]
    fn test_canonical_order_is_by_name() {
        let opts = OptionNormalizer::new()
            .normalize(OutputKind::Audio, &raw(json!({"stripMetadata": "yes", "encoder": "libvorbis"})))
            .unwrap();
        assert_eq!(
            opts.canonical(),
            "bitrate=128;channels=2;encoder=ogg;sample_rate=44100;strip_metadata=true"
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let normalizer = OptionNormalizer::new();
        let cases = [
            json!({"bitrate": -800}),
            json!({"bitrate": "fast"}),
            json!({"encoder": "theora"}),
            json!({"width": -640}),
            json!({"width": 100000}),
            json!({"frame_rate": 0}),
            json!({"sharpen": "maybe"}),
            json!({"letterbox_color": "#12"}),
            json!({"no_such_option": 1}),
            json!({"width": 640, "Width": 320}),
        ];
        for case in cases {
            let result = normalizer.normalize(OutputKind::Video, &raw(case.clone()));
            assert_matches!(result, Err(TranscodeError::InvalidOptions(_)), "{}", case);
        }
    }

    #[test]
    fn test_options_are_kind_specific() {
        let normalizer = OptionNormalizer::new();
        let audio_only = raw(json!({"strip_metadata": true}));
        assert!(normalizer.normalize(OutputKind::Audio, &audio_only).is_ok());
        assert_matches!(
            normalizer.normalize(OutputKind::Video, &audio_only),
            Err(TranscodeError::InvalidOptions(_))
        );

        let thumb = normalizer
            .normalize(OutputKind::Thumbnail, &raw(json!({"timeInSecs": 3, "format": "JPEG"})))
            .unwrap();
        assert_eq!(thumb.number("time"), Some(3));
        assert_eq!(thumb.token("format"), Some("jpg"));
        assert_eq!(thumb.number("width"), Some(200));
    }

    #[test]
    fn test_auto_dimensions() {
        let normalizer = OptionNormalizer::new();
        for auto in [json!(null), json!("auto"), json!(""), json!(0)] {
            let opts = normalizer
                .normalize(OutputKind::Gif, &raw(json!({ "height": auto })))
                .unwrap();
            assert_eq!(opts.get("height"), Some(&OptionValue::Auto));
        }
    }

    #[test]
    fn test_colors() {
        assert_eq!(parse_color("#FFF").as_deref(), Some("#ffffff"));
        assert_eq!(parse_color("0x00FF7f").as_deref(), Some("#00ff7f"));
        assert_eq!(parse_color("Black").as_deref(), Some("black"));
        assert_eq!(parse_color("#12345"), None);
        assert_eq!(parse_color("ff0000").as_deref(), Some("#ff0000"));
        // Three hex letters without a prefix are a colour name
        assert_eq!(parse_color("bed").as_deref(), Some("bed"));
        assert_eq!(parse_color("#bed").as_deref(), Some("#bbeedd"));
        assert_eq!(parse_color("0xabc").as_deref(), Some("#aabbcc"));
        assert_eq!(parse_color("abc1"), None);
        assert_eq!(parse_color("red; rm -rf"), None);
    }

    #[test]
    fn test_bitrates() {
        assert_eq!(parse_bitrate(&json!("800k")), Some(800));
        assert_eq!(parse_bitrate(&json!("1.5M")), Some(1500));
        assert_eq!(parse_bitrate(&json!("96 kbps")), Some(96));
        assert_eq!(parse_bitrate(&json!(128)), Some(128));
        assert_eq!(parse_bitrate(&json!(2_000_000)), Some(2000));
        assert_eq!(parse_bitrate(&json!(-1)), None);
        assert_eq!(parse_bitrate(&json!("-800k")), None);
    }

    #[test]
    fn test_presets_merge_under_request() {
        let normalizer = OptionNormalizer::new()
            .with_preset("mobile", raw(json!({"width": 640, "bitrate": "600k"})))
            .unwrap();

        let opts = normalizer
            .normalize(OutputKind::Video, &raw(json!({"preset": "mobile", "bitrate": "700k"})))
            .unwrap();
        assert_eq!(opts.number("width"), Some(640));
        assert_eq!(opts.number("bitrate"), Some(700));

        // A preset and its expansion identify the same artifact
        let expanded = normalizer
            .normalize(OutputKind::Video, &raw(json!({"width": 640, "bitrate": "700k"})))
            .unwrap();
        assert_eq!(opts, expanded);

        assert_matches!(
            normalizer.normalize(OutputKind::Video, &raw(json!({"preset": "desktop"}))),
            Err(TranscodeError::InvalidOptions(_))
        );
    }

    #[test]
    fn test_invalid_presets_rejected() {
        assert_matches!(
            OptionNormalizer::new().with_preset("bad", raw(json!({"width": "wide"}))),
            Err(TranscodeError::Config(_))
        );
        assert_matches!(
            OptionNormalizer::new().with_preset("loop", raw(json!({"preset": "bad"}))),
            Err(TranscodeError::Config(_))
        );
    }

    #[test]
    fn test_allowed_formats() {
        let normalizer = OptionNormalizer::new()
            .with_allowed_formats(OutputKind::Audio, &["MP3"])
            .unwrap();
        assert!(normalizer
            .normalize(OutputKind::Audio, &raw(json!({"encoder": "libmp3lame"})))
            .is_ok());
        assert_matches!(
            normalizer.normalize(OutputKind::Audio, &raw(json!({"encoder": "aac"}))),
            Err(TranscodeError::InvalidOptions(_))
        );
        assert!(OptionNormalizer::new()
            .with_allowed_formats(OutputKind::Gif, &["gif"])
            .is_err());
    }
}

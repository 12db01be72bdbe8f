//! Allow-listed conversion options.
//!
//! Query strings arrive as `String -> String`. Each stage of a pipeline
//! declares the keys it understands and the literal kind of each value;
//! [`ConversionOptions::from_params`] drops everything else and coerces the
//! survivors, so a tool never sees a raw string where it expects a number
//! or a flag.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;

use crate::ConversionError;

/// Declared literal type of an allow-listed option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Number,
    Text,
}

/// One entry of an allow-list: query key, command-line flag, value kind.
///
/// `flag` is empty for options consumed in-process (e.g. CSS tidying) rather
/// than forwarded to a tool.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub flag: &'static str,
    pub kind: OptionKind,
}

impl OptionSpec {
    pub const fn new(name: &'static str, flag: &'static str, kind: OptionKind) -> Self {
        Self { name, flag, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            // Tools reject "2.0" where they expect an integer page number
            OptionValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            OptionValue::Number(n) => write!(f, "{n}"),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

/// Parse a query-string value into its literal type.
///
/// `"true"`/`"false"` become booleans, finite decimal numbers become
/// numbers, anything else stays text.
pub fn auto_parse(raw: &str) -> OptionValue {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return OptionValue::Bool(true),
        "false" => return OptionValue::Bool(false),
        _ => {}
    }
    let looks_numeric = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if looks_numeric {
        if let Ok(n) = trimmed.parse::<f64>() {
            if n.is_finite() {
                return OptionValue::Number(n);
            }
        }
    }
    OptionValue::Text(raw.to_string())
}

fn coerce(spec: &OptionSpec, raw: &str) -> Result<OptionValue, ConversionError> {
    let invalid = |expected: &str| ConversionError::InvalidOption {
        key: spec.name.to_string(),
        reason: format!("expected {expected}, got {raw:?}"),
    };
    match spec.kind {
        // Passwords and encodings must keep their exact spelling ("007")
        OptionKind::Text => Ok(OptionValue::Text(raw.to_string())),
        OptionKind::Bool => match auto_parse(raw) {
            OptionValue::Bool(b) => Ok(OptionValue::Bool(b)),
            _ => Err(invalid("a boolean")),
        },
        OptionKind::Number => match auto_parse(raw) {
            OptionValue::Number(n) => Ok(OptionValue::Number(n)),
            _ => Err(invalid("a number")),
        },
    }
}

/// Immutable option set for one request and one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionOptions {
    values: BTreeMap<String, OptionValue>,
}

impl ConversionOptions {
    /// Build the option set from `defaults`, overlaid by the allow-listed
    /// subset of `params`. Keys not in `allow_list` are dropped silently.
    pub fn from_params<'a, I>(
        allow_list: &[OptionSpec],
        defaults: &[(&str, OptionValue)],
        params: I,
    ) -> Result<Self, ConversionError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut values: BTreeMap<String, OptionValue> = defaults
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();

        for (key, raw) in params {
            let Some(spec) = allow_list.iter().find(|s| s.name == key.as_str()) else {
                continue;
            };
            values.insert(key.clone(), coerce(spec, raw)?);
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Bool(true)))
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render the options as command-line arguments using the flags from
    /// `allow_list`. `false` booleans and flagless options are omitted.
    pub fn to_args(&self, allow_list: &[OptionSpec]) -> Vec<OsString> {
        let mut args = Vec::new();
        for spec in allow_list {
            if spec.flag.is_empty() {
                continue;
            }
            match self.values.get(spec.name) {
                Some(OptionValue::Bool(true)) => args.push(OsString::from(spec.flag)),
                Some(OptionValue::Bool(false)) | None => {}
                Some(value) => {
                    args.push(OsString::from(spec.flag));
                    args.push(OsString::from(value.to_string()));
                }
            }
        }
        args
    }
}

//! Environment variable parsing with type safety.
//!
//! Every getter returns `None` when the variable is unset, so callers apply
//! values as overrides on top of the file configuration. Parse failures are
//! collected instead of returned, so all bad variables are reported at once.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Type-safe `BRINST_*` environment parser.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    /// Parser over the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| env::var(name).ok())
    }

    /// Parser over an arbitrary variable source.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            prefix: "BRINST_",
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Parser over a fixed set of fully-qualified variables.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self::with_lookup(move |name| vars.get(name).cloned())
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn read(&self, name: &str) -> Option<(String, String)> {
        let var_name = self.var_name(name);
        let value = (self.lookup)(&var_name)?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return None;
        }
        Some((var_name, value))
    }

    pub fn get_string(&mut self, name: &str) -> Option<String> {
        self.read(name).map(|(_, value)| value)
    }

    /// Accepts 1/true/yes/on and 0/false/no/off.
    pub fn get_bool(&mut self, name: &str) -> Option<bool> {
        let (var, value) = self.read(name)?;
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    fn get_range<T>(&mut self, name: &str, min: T, max: T, expected: &str) -> Option<T>
    where
        T: FromStr + PartialOrd + Display,
    {
        let (var, value) = self.read(name)?;
        match value.parse::<T>() {
            Ok(n) if n >= min && n <= max => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: expected.to_string(),
                    value,
                });
                None
            }
        }
    }

    pub fn get_u32_range(&mut self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.get_range(name, min, max, "unsigned 32-bit integer")
    }

    pub fn get_u64_range(&mut self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.get_range(name, min, max, "unsigned 64-bit integer")
    }

    pub fn get_f64_range(&mut self, name: &str, min: f64, max: f64) -> Option<f64> {
        self.get_range(name, min, max, "floating-point number")
    }

    /// Parse a value through `FromStr`, e.g. a lowercase enum name.
    pub fn get_parsed<T: FromStr>(&mut self, name: &str, expected: &str) -> Option<T> {
        let (var, value) = self.read(name)?;
        match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: expected.to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Path value with `~/` expanded to the home directory.
    pub fn get_path(&mut self, name: &str) -> Option<PathBuf> {
        let (_, value) = self.read(name)?;
        let expanded = match value.strip_prefix("~/") {
            Some(stripped) => match dirs::home_dir() {
                Some(home) => home.join(stripped),
                None => PathBuf::from(&value),
            },
            None => PathBuf::from(&value),
        };
        Some(expanded)
    }
}

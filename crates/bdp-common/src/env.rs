//! Typed environment readers
//!
//! Unset variables fall back to the supplied default. A variable that is set
//! but cannot be parsed is an error rather than a silent fallback, so a typo in
//! `LOADER_WORKERS=fuor` fails at startup instead of running with defaults.

use std::str::FromStr;

use crate::error::{BdpError, Result};

/// Read a string variable, falling back to `default` when unset
pub fn string_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Read an optional string variable; empty values count as unset
pub fn optional_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a variable, falling back to `default` when unset
pub fn parse_or<T>(var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(var)?.unwrap_or(default))
}

/// Parse an optional variable
pub fn parse_optional<T>(var: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_string(var) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BdpError::invalid_setting(var, raw.clone(), e)),
        None => Ok(None),
    }
}

/// Parse a boolean flag; accepts true/false, 1/0, yes/no, on/off
pub fn flag_or(var: &str, default: bool) -> Result<bool> {
    match optional_string(var) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(BdpError::invalid_setting(var, raw, "expected a boolean")),
        },
        None => Ok(default),
    }
}

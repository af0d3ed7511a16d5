//! Memory and time literals: a raw amount or an `(amount, unit)` pair
use crate::types::{Result, SandboxError};
use std::str::FromStr;
use std::time::Duration;

/// Memory units, powers of 1024
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUnit {
    B,
    KB,
    MB,
    GB,
}

impl MemoryUnit {
    pub fn bytes(self) -> u64 {
        match self {
            MemoryUnit::B => 1,
            MemoryUnit::KB => 1 << 10,
            MemoryUnit::MB => 1 << 20,
            MemoryUnit::GB => 1 << 30,
        }
    }
}

impl FromStr for MemoryUnit {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "B" => Ok(MemoryUnit::B),
            "KB" => Ok(MemoryUnit::KB),
            "MB" => Ok(MemoryUnit::MB),
            "GB" => Ok(MemoryUnit::GB),
            other => Err(SandboxError::Config(format!(
                "Unknown memory unit '{}', expected one of B, KB, MB, GB",
                other
            ))),
        }
    }
}

/// Time units
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    pub fn seconds(self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" => Ok(TimeUnit::Seconds),
            "m" => Ok(TimeUnit::Minutes),
            "h" => Ok(TimeUnit::Hours),
            other => Err(SandboxError::Config(format!(
                "Unknown time unit '{}', expected one of s, m, h",
                other
            ))),
        }
    }
}

/// Anything that can be read as a number of bytes
pub trait IntoBytes {
    fn into_bytes(self) -> Result<u64>;
}

impl IntoBytes for u64 {
    fn into_bytes(self) -> Result<u64> {
        Ok(self)
    }
}

impl IntoBytes for (u64, MemoryUnit) {
    fn into_bytes(self) -> Result<u64> {
        self.0
            .checked_mul(self.1.bytes())
            .ok_or_else(|| SandboxError::Config(format!("Memory amount {:?} overflows", self)))
    }
}

impl IntoBytes for (u64, &str) {
    fn into_bytes(self) -> Result<u64> {
        (self.0, self.1.parse::<MemoryUnit>()?).into_bytes()
    }
}

impl IntoBytes for (f64, &str) {
    fn into_bytes(self) -> Result<u64> {
        let unit: MemoryUnit = self.1.parse()?;
        round_non_negative(self.0 * unit.bytes() as f64, "memory")
    }
}

/// Anything that can be read as a whole number of seconds
pub trait IntoSeconds {
    fn into_seconds(self) -> Result<u64>;
}

impl IntoSeconds for u64 {
    fn into_seconds(self) -> Result<u64> {
        Ok(self)
    }
}

impl IntoSeconds for Duration {
    fn into_seconds(self) -> Result<u64> {
        round_non_negative(self.as_secs_f64(), "time")
    }
}

impl IntoSeconds for (f64, TimeUnit) {
    fn into_seconds(self) -> Result<u64> {
        round_non_negative(self.0 * self.1.seconds(), "time")
    }
}

impl IntoSeconds for (f64, &str) {
    fn into_seconds(self) -> Result<u64> {
        (self.0, self.1.parse::<TimeUnit>()?).into_seconds()
    }
}

impl IntoSeconds for (u64, &str) {
    fn into_seconds(self) -> Result<u64> {
        (self.0 as f64, self.1).into_seconds()
    }
}

fn round_non_negative(value: f64, what: &str) -> Result<u64> {
    if !value.is_finite() || value < 0.0 {
        return Err(SandboxError::Config(format!(
            "Invalid {} amount: {}",
            what, value
        )));
    }
    Ok(value.round() as u64)
}

/// Parse a CLI style literal such as `50MB`, `1.5h`, `2048` or `30s`
pub fn parse_memory(literal: &str) -> Result<u64> {
    let (amount, unit) = split_literal(literal);
    let amount: f64 = amount
        .parse()
        .map_err(|_| SandboxError::Config(format!("Invalid memory literal '{}'", literal)))?;
    (amount, if unit.is_empty() { "B" } else { unit }).into_bytes()
}

pub fn parse_time(literal: &str) -> Result<u64> {
    let (amount, unit) = split_literal(literal);
    let amount: f64 = amount
        .parse()
        .map_err(|_| SandboxError::Config(format!("Invalid time literal '{}'", literal)))?;
    (amount, if unit.is_empty() { "s" } else { unit }).into_seconds()
}

fn split_literal(literal: &str) -> (&str, &str) {
    let literal = literal.trim();
    let split = literal
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(literal.len());
    (literal[..split].trim(), literal[split..].trim())
}

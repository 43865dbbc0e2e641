//! Display units for amounts and their text formatting
//!
//! Amounts are kept in base units everywhere in the engine. This module renders
//! them for people and parses what people type back into base units, without
//! any locale dependence: the decimal marker is always `.` and thousands are
//! grouped with a thin space (U+2009).

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::error::{ConsensusError, Result};
use crate::types::Integer;

/// Thousands separator
pub const THIN_SP: char = '\u{2009}';

/// Width of the integer part plus decimals when justifying
const MAX_DIGITS: usize = 16;

/// Longer digit strings cannot fit in 63 bits
const MAX_PARSE_DIGITS: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Aur,
    MilliAur,
    MicroAur,
    Sat,
}

/// When to group the integer part into thousands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeparatorStyle {
    Never,
    /// Only for integer parts longer than four digits
    #[default]
    Standard,
    Always,
}

impl Unit {
    pub const ALL: [Unit; 4] = [Unit::Aur, Unit::MilliAur, Unit::MicroAur, Unit::Sat];

    pub fn long_name(self) -> &'static str {
        match self {
            Unit::Aur => "AUR",
            Unit::MilliAur => "mAUR",
            Unit::MicroAur => "µAUR (bits)",
            Unit::Sat => "Satoshi (sat)",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Unit::Aur | Unit::MilliAur => self.long_name(),
            Unit::MicroAur => "bits",
            Unit::Sat => "sat",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Unit::Aur => "Aureus",
            Unit::MilliAur => "Milli-Aureus (1 / 1\u{2009}000)",
            Unit::MicroAur => "Micro-Aureus (bits) (1 / 1\u{2009}000\u{2009}000)",
            Unit::Sat => "Satoshi (sat) (1 / 100\u{2009}000\u{2009}000)",
        }
    }

    /// Base units per one of this unit
    pub fn factor(self) -> i64 {
        match self {
            Unit::Aur => 100_000_000,
            Unit::MilliAur => 100_000,
            Unit::MicroAur => 100,
            Unit::Sat => 1,
        }
    }

    pub fn decimals(self) -> usize {
        match self {
            Unit::Aur => 8,
            Unit::MilliAur => 5,
            Unit::MicroAur => 2,
            Unit::Sat => 0,
        }
    }

    /// Stable one-byte code used when a unit preference is persisted
    pub fn to_code(self) -> i8 {
        match self {
            Unit::Aur => 0,
            Unit::MilliAur => 1,
            Unit::MicroAur => 2,
            Unit::Sat => 3,
        }
    }
}

impl TryFrom<i8> for Unit {
    type Error = ConsensusError;

    fn try_from(code: i8) -> Result<Self> {
        match code {
            0 => Ok(Unit::Aur),
            1 => Ok(Unit::MilliAur),
            2 => Ok(Unit::MicroAur),
            3 => Ok(Unit::Sat),
            other => Err(ConsensusError::InvalidArgument(format!("unknown unit code {}", other))),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long_name())
    }
}

/// Render `amount` (base units) in `unit`
///
/// `plus_sign` prefixes positive amounts with `+`. `justify` right-aligns the
/// integer part to a fixed width so that columns of amounts line up.
pub fn format(unit: Unit, amount: Integer, plus_sign: bool, separators: SeparatorStyle, justify: bool) -> String {
    let coin = unit.factor();
    let decimals = unit.decimals();
    let abs = amount.unsigned_abs();
    let quotient = abs / coin as u64;

    let mut digits: Vec<char> = quotient.to_string().chars().collect();
    if justify && digits.len() < MAX_DIGITS - decimals {
        let mut padded = vec![' '; MAX_DIGITS - decimals - digits.len()];
        padded.extend(digits);
        digits = padded;
    }

    let len = digits.len();
    let group = separators == SeparatorStyle::Always || (separators == SeparatorStyle::Standard && len > 4);
    if group {
        let mut i = 3;
        while i < len {
            digits.insert(len - i, THIN_SP);
            i += 3;
        }
    }

    let mut out = String::new();
    if amount < 0 {
        out.push('-');
    } else if plus_sign && amount > 0 {
        out.push('+');
    }
    out.extend(digits);

    if decimals > 0 {
        let remainder = abs % coin as u64;
        out.push('.');
        out.push_str(&format!("{:0width$}", remainder, width = decimals));
    }
    out
}

/// `format` followed by the unit's short name
pub fn format_with_unit(unit: Unit, amount: Integer, plus_sign: bool, separators: SeparatorStyle) -> String {
    format!("{} {}", format(unit, amount, plus_sign, separators, false), unit.short_name())
}

/// Justified rendering that can mask every digit with `#`
pub fn format_with_privacy(unit: Unit, amount: Integer, separators: SeparatorStyle, privacy: bool) -> Result<String> {
    if amount < 0 {
        return Err(ConsensusError::InvalidArgument("amount must not be negative".to_string()));
    }
    let value = if privacy {
        format(unit, 0, false, separators, true).replace('0', "#")
    } else {
        format(unit, amount, false, separators, true)
    };
    Ok(format!("{} {}", value, unit.short_name()))
}

/// Parse a decimal amount expressed in `unit` into base units
///
/// Spaces and thin spaces are ignored. Rejects empty input, more than one
/// decimal point, more decimals than the unit has and numbers with more than
/// eighteen digits.
pub fn parse(unit: Unit, text: &str) -> Result<Integer> {
    let invalid = |reason: &str| ConsensusError::InvalidArgument(format!("cannot parse amount {:?}: {}", text, reason));
    if text.is_empty() {
        return Err(invalid("empty"));
    }
    let cleaned: String = text.chars().filter(|c| *c != ' ' && *c != THIN_SP).collect();
    let parts: Vec<&str> = cleaned.split('.').collect();
    if parts.len() > 2 {
        return Err(invalid("more than one decimal point"));
    }
    let whole = parts[0];
    let fraction = parts.get(1).copied().unwrap_or("");
    let decimals = unit.decimals();
    if fraction.chars().count() > decimals {
        return Err(invalid("too many decimals"));
    }

    let mut digits = String::from(whole);
    digits.push_str(fraction);
    for _ in fraction.chars().count()..decimals {
        digits.push('0');
    }
    if digits.chars().count() > MAX_PARSE_DIGITS {
        return Err(invalid("too many digits"));
    }
    digits.parse::<i64>().map_err(|_| invalid("not a number"))
}

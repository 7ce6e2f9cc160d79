use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ContractViolation;

const KEY_PREFIX: &str = "contract";
const KEY_SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    RiseFall,
    HigherLower,
    TouchNoTouch,
    EndsInOut,
    Multiplier,
    Accumulator,
}

impl TradeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RiseFall => "rise_fall",
            Self::HigherLower => "higher_lower",
            Self::TouchNoTouch => "touch_no_touch",
            Self::EndsInOut => "ends_in_out",
            Self::Multiplier => "multiplier",
            Self::Accumulator => "accumulator",
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "rise_fall" => Ok(Self::RiseFall),
            "higher_lower" => Ok(Self::HigherLower),
            "touch_no_touch" => Ok(Self::TouchNoTouch),
            "ends_in_out" => Ok(Self::EndsInOut),
            "multiplier" => Ok(Self::Multiplier),
            "accumulator" => Ok(Self::Accumulator),
            other => Err(format!("unsupported trade type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationUnit {
    Ticks,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    fn code(self) -> char {
        match self {
            Self::Ticks => 't',
            Self::Seconds => 's',
            Self::Minutes => 'm',
            Self::Hours => 'h',
            Self::Days => 'd',
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "t" | "tick" | "ticks" => Some(Self::Ticks),
            "s" | "sec" | "secs" | "second" | "seconds" => Some(Self::Seconds),
            "m" | "min" | "mins" | "minute" | "minutes" => Some(Self::Minutes),
            "h" | "hr" | "hrs" | "hour" | "hours" => Some(Self::Hours),
            "d" | "day" | "days" => Some(Self::Days),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractDuration {
    pub value: u32,
    pub unit: DurationUnit,
}

impl ContractDuration {
    pub fn new(value: u32, unit: DurationUnit) -> Self {
        Self { value, unit }
    }

    pub fn ticks(value: u32) -> Self {
        Self::new(value, DurationUnit::Ticks)
    }
}

impl fmt::Display for ContractDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.code())
    }
}

impl FromStr for ContractDuration {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let digits_end = trimmed
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(digits_end);

        if digits.is_empty() {
            return Err(format!("duration `{value}` must start with a number"));
        }

        let amount = digits
            .parse::<u32>()
            .map_err(|err| format!("invalid duration amount in `{value}`: {err}"))?;
        let unit = DurationUnit::parse(unit)
            .ok_or_else(|| format!("unsupported duration unit in `{value}`"))?;

        Ok(Self::new(amount, unit))
    }
}

impl Serialize for ContractDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContractDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRequest {
    pub instrument: String,
    pub trade_type: TradeType,
    pub duration: ContractDuration,
    pub currency: String,
    pub payout: f64,
    #[serde(default)]
    pub strike: Option<f64>,
}

impl PriceRequest {
    pub fn new(
        instrument: impl Into<String>,
        trade_type: TradeType,
        duration: ContractDuration,
        currency: impl Into<String>,
        payout: f64,
        strike: Option<f64>,
    ) -> Self {
        Self {
            instrument: instrument.into().trim().to_string(),
            trade_type,
            duration,
            currency: currency.into().trim().to_ascii_uppercase(),
            payout,
            strike,
        }
    }

    pub fn key(&self) -> RequestKey {
        derive_key(self)
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        check_key_field("instrument", &self.instrument)?;
        check_key_field("currency", &self.currency)?;

        if !self.payout.is_finite() || self.payout < 0.0 {
            return Err(ContractViolation::MalformedRequest(format!(
                "`payout` must be a finite, non-negative number (got {})",
                self.payout
            )));
        }

        if let Some(strike) = self.strike {
            if !strike.is_finite() {
                return Err(ContractViolation::MalformedRequest(format!(
                    "`strike` must be finite (got {strike})"
                )));
            }
        }

        if self.duration.value == 0 {
            return Err(ContractViolation::MalformedRequest(
                "`duration` must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_key_field(name: &str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::MalformedRequest(format!(
            "`{name}` cannot be empty"
        )));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(ContractViolation::MalformedRequest(format!(
            "`{name}` cannot contain `{KEY_SEPARATOR}`"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Field order is fixed: duration, instrument, trade_type, currency, payout, strike.
pub fn derive_key(request: &PriceRequest) -> RequestKey {
    let strike = request
        .strike
        .map(canonical_number)
        .unwrap_or_else(|| "none".to_string());

    RequestKey(format!(
        "{KEY_PREFIX}|duration:{}|instrument:{}|trade_type:{}|currency:{}|payout:{}|strike:{}",
        request.duration,
        request.instrument.trim(),
        request.trade_type.as_str(),
        request.currency.trim().to_ascii_uppercase(),
        canonical_number(request.payout),
        strike,
    ))
}

fn canonical_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{value}")
}

//! Key/value configuration strings of the form
//! `key1:value1,key2:value2,flag`.
//!
//! Values are typed on lookup. Durations accept `us`, `ms` and `s` suffixes
//! and default to milliseconds; rates accept `bps` and `kbps` and default to
//! kbps; `inf` stands for plus infinity. A key without a value is a boolean
//! flag set to `true`.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::units::{DataRate, DataSize, TimeDelta};

#[derive(Default, Debug, Clone, PartialEq)]
pub struct FieldTrialParams {
    entries: BTreeMap<String, Option<String>>,
}

impl FieldTrialParams {
    pub fn parse(trial: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in trial.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = match entry.split_once(':') {
                Some((key, value)) => (key.trim(), Some(value.trim().to_owned())),
                None => (entry, None),
            };
            if key.is_empty() {
                return Err(Error::ErrFieldTrialMalformed(entry.to_owned()));
            }
            entries.insert(key.to_owned(), value);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys present in the trial but not listed in `known`.
    pub fn unknown_keys<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(|k| !known.contains(k))
            .collect()
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_deref())
    }

    fn invalid(key: &str, value: &str) -> Error {
        Error::ErrFieldTrialValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(None) => Ok(Some(true)),
            Some(Some(v)) => match v.as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(Self::invalid(key, v)),
            },
        }
    }

    pub fn f64(&self, key: &str) -> Result<Option<f64>> {
        match self.value(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<f64>()
                .map(Some)
                .map_err(|_| Self::invalid(key, v)),
        }
    }

    pub fn i64(&self, key: &str) -> Result<Option<i64>> {
        match self.value(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Self::invalid(key, v)),
        }
    }

    pub fn time_delta(&self, key: &str) -> Result<Option<TimeDelta>> {
        let Some(v) = self.value(key) else {
            return Ok(None);
        };
        if v == "inf" || v == "+inf" {
            return Ok(Some(TimeDelta::plus_infinity()));
        }
        let (number, unit_us) = if let Some(n) = v.strip_suffix("us") {
            (n, 1.0)
        } else if let Some(n) = v.strip_suffix("ms") {
            (n, 1_000.0)
        } else if let Some(n) = v.strip_suffix('s') {
            (n, 1_000_000.0)
        } else {
            (v, 1_000.0)
        };
        let number: f64 = number.trim().parse().map_err(|_| Self::invalid(key, v))?;
        Ok(Some(TimeDelta::from_micros((number * unit_us).round() as i64)))
    }

    pub fn data_rate(&self, key: &str) -> Result<Option<DataRate>> {
        let Some(v) = self.value(key) else {
            return Ok(None);
        };
        if v == "inf" || v == "+inf" {
            return Ok(Some(DataRate::plus_infinity()));
        }
        let (number, unit_bps) = if let Some(n) = v.strip_suffix("kbps") {
            (n, 1_000.0)
        } else if let Some(n) = v.strip_suffix("bps") {
            (n, 1.0)
        } else {
            (v, 1_000.0)
        };
        let number: f64 = number.trim().parse().map_err(|_| Self::invalid(key, v))?;
        Ok(Some(DataRate::from_bps((number * unit_bps).round() as i64)))
    }

    pub fn data_size(&self, key: &str) -> Result<Option<DataSize>> {
        let Some(v) = self.value(key) else {
            return Ok(None);
        };
        let number = v.strip_suffix("bytes").unwrap_or(v).trim();
        let bytes: i64 = number.parse().map_err(|_| Self::invalid(key, v))?;
        Ok(Some(DataSize::from_bytes(bytes)))
    }
}

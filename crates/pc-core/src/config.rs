//! # config
//!
//! why: hold the tunables of a primary-component instance and parse them from key/value pairs
//! relations: read by proto.rs at construction and by set_param at runtime
//! what: PcConfig, Overrides, parameter keys, parsing helpers

use serde::{Deserialize, Serialize};

use crate::error::PcError;
use crate::node::{SegmentId, DEFAULT_WEIGHT};

pub const PARAM_NPVO: &str = "pc.npvo";
pub const PARAM_IGNORE_QUORUM: &str = "pc.ignore_quorum";
pub const PARAM_IGNORE_SB: &str = "pc.ignore_sb";
pub const PARAM_CHECKSUM: &str = "pc.checksum";
pub const PARAM_WEIGHT: &str = "pc.weight";
pub const PARAM_MTU: &str = "pc.mtu";
pub const PARAM_SEGMENT: &str = "pc.segment";
pub const PARAM_BOOTSTRAP: &str = "pc.bootstrap";

pub const DEFAULT_MTU: usize = i32::MAX as usize;

/// Administrative overrides of the primary-component decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    /// Newer primary view overrides an older one
    pub npvo: bool,
    /// Declare primary even without quorum
    pub ignore_quorum: bool,
    /// Declare primary on an exact weight split
    pub ignore_sb: bool,
}

impl Overrides {
    /// Flags set in every one of `all`; nothing is set for an empty input
    pub fn unanimous<'a>(all: impl IntoIterator<Item = &'a Overrides>) -> Overrides {
        let mut iter = all.into_iter();
        let Some(first) = iter.next() else {
            return Overrides::default();
        };
        iter.fold(*first, |acc, o| Overrides {
            npvo: acc.npvo && o.npvo,
            ignore_quorum: acc.ignore_quorum && o.ignore_quorum,
            ignore_sb: acc.ignore_sb && o.ignore_sb,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcConfig {
    pub npvo: bool,
    pub ignore_quorum: bool,
    /// Falls back to `ignore_quorum` when unset
    pub ignore_sb: Option<bool>,
    pub checksum: bool,
    pub weight: u8,
    pub mtu: usize,
    pub segment: SegmentId,
}

impl Default for PcConfig {
    fn default() -> Self {
        Self {
            npvo: false,
            ignore_quorum: false,
            ignore_sb: None,
            checksum: false,
            weight: DEFAULT_WEIGHT,
            mtu: DEFAULT_MTU,
            segment: 0,
        }
    }
}

impl PcConfig {
    /// Build a config from `pc.*` key/value pairs on top of the defaults
    pub fn from_params<'a, I>(params: I) -> Result<Self, PcError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in params {
            config.apply(key, value)?;
        }
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, PcError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn ignore_sb(&self) -> bool {
        self.ignore_sb.unwrap_or(self.ignore_quorum)
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            npvo: self.npvo,
            ignore_quorum: self.ignore_quorum,
            ignore_sb: self.ignore_sb(),
        }
    }

    /// Parse and assign one parameter. Nothing changes on error.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), PcError> {
        match key {
            PARAM_NPVO => self.npvo = parse_bool(key, value)?,
            PARAM_IGNORE_QUORUM => self.ignore_quorum = parse_bool(key, value)?,
            PARAM_IGNORE_SB => self.ignore_sb = Some(parse_bool(key, value)?),
            PARAM_CHECKSUM => self.checksum = parse_bool(key, value)?,
            PARAM_WEIGHT => self.weight = parse_weight(value)?,
            PARAM_MTU => self.mtu = parse_ranged(key, value, 1, i64::from(i32::MAX))? as usize,
            PARAM_SEGMENT => self.segment = parse_ranged(key, value, 0, 255)? as SegmentId,
            _ => return Err(PcError::UnknownParam(key.to_string())),
        }
        Ok(())
    }
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool, PcError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PcError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

pub fn parse_weight(value: &str) -> Result<u8, PcError> {
    parse_ranged(PARAM_WEIGHT, value, 0, 255).map(|w| w as u8)
}

fn parse_ranged(key: &str, value: &str, min: i64, max: i64) -> Result<i64, PcError> {
    let parsed: i64 = value.trim().parse().map_err(|_| PcError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    if parsed < min || parsed > max {
        return Err(PcError::OutOfRange {
            key: key.to_string(),
            value: parsed,
            min,
            max,
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = PcConfig::default();
        assert!(!config.npvo);
        assert!(!config.ignore_quorum);
        assert!(!config.ignore_sb());
        assert!(!config.checksum);
        assert_eq!(config.weight, 1);
        assert_eq!(config.mtu, i32::MAX as usize);
        assert_eq!(config.segment, 0);
    }

    #[test]
    fn ignore_sb_follows_ignore_quorum_unless_set() {
        let config = PcConfig::from_params([(PARAM_IGNORE_QUORUM, "yes")]).unwrap();
        assert!(config.ignore_sb());

        let config =
            PcConfig::from_params([(PARAM_IGNORE_QUORUM, "1"), (PARAM_IGNORE_SB, "off")]).unwrap();
        assert!(config.ignore_quorum);
        assert!(!config.ignore_sb());
    }

    #[test]
    fn weight_out_of_range_is_rejected() {
        let err = PcConfig::from_params([(PARAM_WEIGHT, "256")]).unwrap_err();
        assert!(matches!(err, PcError::OutOfRange { value: 256, max: 255, .. }));

        let err = PcConfig::from_params([(PARAM_WEIGHT, "-1")]).unwrap_err();
        assert!(matches!(err, PcError::OutOfRange { value: -1, min: 0, .. }));
    }

    #[test]
    fn failed_apply_leaves_config_untouched() {
        let mut config = PcConfig::default();
        assert!(config.apply(PARAM_WEIGHT, "1000").is_err());
        assert!(config.apply(PARAM_CHECKSUM, "maybe").is_err());
        assert_eq!(config, PcConfig::default());
    }

    #[test]
    fn unknown_key_is_reported() {
        let err = PcConfig::from_params([("pc.nope", "1")]).unwrap_err();
        assert!(matches!(err, PcError::UnknownParam(key) if key == "pc.nope"));
    }

    #[test]
    fn json_config_uses_defaults_for_missing_fields() {
        let config = PcConfig::from_json(r#"{ "weight": 3, "checksum": true }"#).unwrap();
        assert_eq!(config.weight, 3);
        assert!(config.checksum);
        assert_eq!(config.mtu, DEFAULT_MTU);
    }

    #[test]
    fn json_weight_above_range_fails() {
        assert!(PcConfig::from_json(r#"{ "weight": 300 }"#).is_err());
    }

    #[test]
    fn unanimous_overrides_need_every_member() {
        let a = Overrides { npvo: true, ignore_quorum: true, ignore_sb: false };
        let b = Overrides { npvo: true, ignore_quorum: false, ignore_sb: false };
        let merged = Overrides::unanimous([&a, &b]);
        assert!(merged.npvo);
        assert!(!merged.ignore_quorum);
        assert_eq!(Overrides::unanimous(std::iter::empty()), Overrides::default());
    }
}

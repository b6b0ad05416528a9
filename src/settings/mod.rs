use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{OtaError, Result};

/// Placeholder the device returns instead of the real pool password.
pub const MASKED_PASSWORD: &str = "*****";

const INTEGER_SETTINGS: [&str; 2] = ["frequency", "coreVoltage"];
const SWITCH_SETTINGS: [&str; 3] = ["flipscreen", "invertscreen", "autofanspeed"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "ASICModel")]
    pub asic_model: String,
    #[serde(default)]
    pub frequency: Option<f64>,
    #[serde(default, rename = "coreVoltage")]
    pub core_voltage: Option<f64>,
    #[serde(default, rename = "hashRate")]
    pub hash_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotuneSettings {
    pub power_limit: f64,
    pub fan_limit: f64,
    pub osh_pow_limit: f64,
    pub osh_fan_limit: f64,
    pub max_volt_asic: f64,
    pub max_freq_asic: f64,
    pub max_temp_asic: f64,
    pub vf_ratio_max: f64,
    pub vf_ratio_min: f64,
    pub auto_tune: bool,
}

/// Allowed range for one numeric autotune field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderRange {
    pub key: &'static str,
    pub label: &'static str,
    pub min: f64,
    pub max: f64,
    pub unit: &'static str,
}

pub const AUTOTUNE_RANGES: [SliderRange; 9] = [
    SliderRange { key: "power_limit", label: "Power Limit", min: 10.0, max: 40.0, unit: "W" },
    SliderRange { key: "fan_limit", label: "Fan Limit", min: 0.0, max: 100.0, unit: "%" },
    SliderRange { key: "osh_pow_limit", label: "Overshoot Power Limit", min: 0.0, max: 2.2, unit: "W" },
    SliderRange { key: "osh_fan_limit", label: "Overshoot Fanspeed", min: 0.0, max: 100.0, unit: "%" },
    SliderRange { key: "max_volt_asic", label: "Max Voltage ASIC", min: 1000.0, max: 1400.0, unit: "mV" },
    SliderRange { key: "max_freq_asic", label: "Max Frequency ASIC", min: 400.0, max: 1000.0, unit: "MHz" },
    SliderRange { key: "max_temp_asic", label: "Max Temperature ASIC", min: 20.0, max: 80.0, unit: "°C" },
    SliderRange { key: "vf_ratio_max", label: "Max V/F Ratio", min: 2.0, max: 2.2, unit: "" },
    SliderRange { key: "vf_ratio_min", label: "Min V/F Ratio", min: 1.6, max: 2.0, unit: "" },
];

impl AutotuneSettings {
    pub fn value(&self, key: &str) -> Option<f64> {
        Some(match key {
            "power_limit" => self.power_limit,
            "fan_limit" => self.fan_limit,
            "osh_pow_limit" => self.osh_pow_limit,
            "osh_fan_limit" => self.osh_fan_limit,
            "max_volt_asic" => self.max_volt_asic,
            "max_freq_asic" => self.max_freq_asic,
            "max_temp_asic" => self.max_temp_asic,
            "vf_ratio_max" => self.vf_ratio_max,
            "vf_ratio_min" => self.vf_ratio_min,
            _ => return None,
        })
    }

    fn slot(&mut self, key: &str) -> Option<&mut f64> {
        Some(match key {
            "power_limit" => &mut self.power_limit,
            "fan_limit" => &mut self.fan_limit,
            "osh_pow_limit" => &mut self.osh_pow_limit,
            "osh_fan_limit" => &mut self.osh_fan_limit,
            "max_volt_asic" => &mut self.max_volt_asic,
            "max_freq_asic" => &mut self.max_freq_asic,
            "max_temp_asic" => &mut self.max_temp_asic,
            "vf_ratio_max" => &mut self.vf_ratio_max,
            "vf_ratio_min" => &mut self.vf_ratio_min,
            _ => return None,
        })
    }

    /// Set one field from user input, enforcing the slider range.
    pub fn apply(&mut self, key: &str, raw: &str) -> Result<()> {
        if key == "auto_tune" {
            self.auto_tune = parse_switch(key, raw)?;
            return Ok(());
        }
        let range = AUTOTUNE_RANGES
            .iter()
            .find(|range| range.key == key)
            .ok_or_else(|| OtaError::InvalidSetting(format!("unknown autotune key {key:?}")))?;
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| OtaError::InvalidSetting(format!("{key}: {raw:?} is not a number")))?;
        if !(range.min..=range.max).contains(&value) {
            return Err(OtaError::InvalidSetting(format!(
                "{key}: {value} is outside {}..={} {}",
                range.min, range.max, range.unit
            )));
        }
        if let Some(slot) = self.slot(key) {
            *slot = value;
        }
        Ok(())
    }
}

/// Check autotune assignments without touching the device.
pub fn validate_autotune(pairs: &[(String, String)]) -> Result<()> {
    let mut scratch = AutotuneSettings::default();
    pairs
        .iter()
        .try_for_each(|(key, value)| scratch.apply(key, value))
}

/// Split `KEY=VALUE` arguments.
pub fn parse_assignments(args: &[String]) -> Result<Vec<(String, String)>> {
    if args.is_empty() {
        return Err(OtaError::InvalidSetting("no settings given".into()));
    }
    args.iter()
        .map(|arg| {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| OtaError::InvalidSetting(format!("expected KEY=VALUE, got {arg:?}")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(OtaError::InvalidSetting(format!("missing key in {arg:?}")));
            }
            Ok((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Build the body for `PATCH /api/system` the way the device expects it.
pub fn system_settings_payload(pairs: &[(String, String)]) -> Result<Map<String, Value>> {
    let mut payload = Map::new();
    for (key, raw) in pairs {
        let value = if INTEGER_SETTINGS.contains(&key.as_str()) {
            Value::from(parse_integer(key, raw)?)
        } else if SWITCH_SETTINGS.contains(&key.as_str()) {
            Value::from(u8::from(parse_switch(key, raw)?))
        } else if key == "stratumPassword" && raw == MASKED_PASSWORD {
            continue;
        } else {
            loose_value(raw)
        };
        payload.insert(key.clone(), value);
    }
    if payload.is_empty() {
        return Err(OtaError::InvalidSetting("nothing to update".into()));
    }
    Ok(payload)
}

fn parse_integer(key: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| value.trunc() as i64)
        .ok_or_else(|| OtaError::InvalidSetting(format!("{key}: {raw:?} is not a number")))
}

fn parse_switch(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(OtaError::InvalidSetting(format!(
            "{key}: {raw:?} is not a switch value"
        ))),
    }
}

fn loose_value(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    if let Some(number) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn parses_key_value_arguments() {
        let args = vec!["frequency=525".to_owned(), "hostname=bitaxe=1".to_owned()];
        let parsed = parse_assignments(&args).unwrap();
        assert_eq!(parsed[0], ("frequency".into(), "525".into()));
        assert_eq!(parsed[1], ("hostname".into(), "bitaxe=1".into()));
        assert!(parse_assignments(&["frequency".to_owned()]).is_err());
        assert!(parse_assignments(&["=5".to_owned()]).is_err());
        assert!(parse_assignments(&[]).is_err());
    }

    #[test]
    fn normalizes_system_settings_payload() {
        let payload = system_settings_payload(&pairs(&[
            ("frequency", "525.7"),
            ("coreVoltage", "1200"),
            ("flipscreen", "true"),
            ("autofanspeed", "off"),
            ("stratumPassword", MASKED_PASSWORD),
            ("stratumPort", "3333"),
            ("stratumURL", "public-pool.io"),
        ]))
        .unwrap();

        assert_eq!(payload["frequency"], Value::from(525));
        assert_eq!(payload["coreVoltage"], Value::from(1200));
        assert_eq!(payload["flipscreen"], Value::from(1));
        assert_eq!(payload["autofanspeed"], Value::from(0));
        assert_eq!(payload["stratumPort"], Value::from(3333));
        assert_eq!(payload["stratumURL"], Value::from("public-pool.io"));
        assert!(!payload.contains_key("stratumPassword"));
    }

    #[test]
    fn keeps_real_password_and_rejects_bad_numbers() {
        let payload = system_settings_payload(&pairs(&[("stratumPassword", "x")])).unwrap();
        assert_eq!(payload["stratumPassword"], Value::from("x"));

        assert!(system_settings_payload(&pairs(&[("frequency", "fast")])).is_err());
        assert!(system_settings_payload(&pairs(&[("invertscreen", "maybe")])).is_err());
        assert!(system_settings_payload(&pairs(&[("stratumPassword", MASKED_PASSWORD)])).is_err());
    }

    #[test]
    fn parses_device_info_and_keeps_unknown_fields() {
        let body = r#"{"hostname":"bitaxe","version":"v2.4.9","ASICModel":"BM1366",
            "frequency":485,"coreVoltage":1200,"hashRate":512.3,"fanspeed":60}"#;
        let info: SystemInfo = serde_json::from_str(body).unwrap();
        assert_eq!(info.asic_model, "BM1366");
        assert_eq!(info.core_voltage, Some(1200.0));
        assert_eq!(info.extra["fanspeed"], Value::from(60));
    }

    #[test]
    fn autotune_changes_respect_slider_ranges() {
        let mut settings = AutotuneSettings::default();
        settings.apply("power_limit", "20").unwrap();
        settings.apply("vf_ratio_min", "1.85").unwrap();
        settings.apply("auto_tune", "on").unwrap();
        assert_eq!(settings.power_limit, 20.0);
        assert_eq!(settings.value("vf_ratio_min"), Some(1.85));
        assert!(settings.auto_tune);

        assert!(settings.apply("power_limit", "41").is_err());
        assert!(settings.apply("max_freq_asic", "399").is_err());
        assert!(settings.apply("max_temp_asic", "hot").is_err());
        assert!(settings.apply("turbo", "1").is_err());
        assert_eq!(settings.power_limit, 20.0);
    }

    #[test]
    fn autotune_assignments_are_checked_up_front() {
        assert!(validate_autotune(&pairs(&[("power_limit", "25"), ("auto_tune", "off")])).is_ok());
        assert_eq!(
            validate_autotune(&pairs(&[("fan_limit", "50"), ("power_limit", "99")])),
            Err(OtaError::InvalidSetting(
                "power_limit: 99 is outside 10..=40 W".into()
            ))
        );
        assert!(matches!(
            validate_autotune(&pairs(&[("turbo", "1")])),
            Err(OtaError::InvalidSetting(_))
        ));
    }

    #[test]
    fn autotune_round_trips_device_json() {
        let body = r#"{"power_limit":20,"fan_limit":75,"max_volt_asic":1200,
            "max_freq_asic":600,"max_temp_asic":65,"auto_tune":true}"#;
        let settings: AutotuneSettings = serde_json::from_str(body).unwrap();
        assert_eq!(settings.fan_limit, 75.0);
        assert_eq!(settings.vf_ratio_max, 0.0);
        assert!(settings.auto_tune);
    }
}

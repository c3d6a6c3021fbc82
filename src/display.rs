//! Status LEDs and the optional SSD1306 OLED panel.
//!
//! The RGB LEDs mirror the current alert level; the panel (absent on some
//! builds) shows rotating status screens. A missing panel degrades
//! silently, it never fails the display system.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{lock_bus, DigitalOutput, SharedI2c};
use crate::error::{Error, Result};

/// On/off half-period of the critical-alert blink.
const BLINK_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Colors & alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayColor {
    Off,
    Red,
    Green,
    Blue,
    Yellow,
    Magenta,
    Cyan,
    White,
}

impl DisplayColor {
    /// (red, green, blue) channel levels.
    fn channels(self) -> (bool, bool, bool) {
        match self {
            Self::Off => (false, false, false),
            Self::Red => (true, false, false),
            Self::Green => (false, true, false),
            Self::Blue => (false, false, true),
            Self::Yellow => (true, true, false),
            Self::Magenta => (true, false, true),
            Self::Cyan => (false, true, true),
            Self::White => (true, true, true),
        }
    }
}

/// Alert severity, ordered from quiet to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAlert {
    None,
    Info,
    Warning,
    Error,
    Critical,
}

/// Map current readings to an alert level: most severe condition wins.
pub fn classify_alert(
    water_level: f64,
    temperature: f64,
    soil_moisture: f64,
    humidity: f64,
) -> SystemAlert {
    if water_level < 10.0 || temperature > 35.0 || temperature < 5.0 {
        return SystemAlert::Critical;
    }
    if water_level < 20.0 || soil_moisture < 20.0 || temperature > 30.0 || temperature < 10.0 {
        return SystemAlert::Error;
    }
    if soil_moisture < 40.0 || humidity < 40.0 || humidity > 80.0 {
        return SystemAlert::Warning;
    }
    SystemAlert::None
}

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LedState {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisplayStatus {
    pub status_leds: LedState,
    pub oled_enabled: bool,
    pub current_screen: String,
    pub current_alert: SystemAlert,
    pub brightness: u8,
    pub last_update: Option<DateTime<Utc>>,
}

/// A rotating screen: a title plus up to six lines of text.
#[derive(Debug, Clone, Serialize)]
pub struct Screen {
    pub name: String,
    pub title: String,
    pub lines: Vec<String>,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Status LEDs (three discrete GPIO lines)
// ---------------------------------------------------------------------------

struct StatusLeds {
    red: DigitalOutput,
    green: DigitalOutput,
    blue: DigitalOutput,
    state: LedState,
}

impl StatusLeds {
    fn new(red_pin: u8, green_pin: u8, blue_pin: u8, mock: bool) -> Result<Self> {
        Ok(Self {
            red: DigitalOutput::new(red_pin, mock)?,
            green: DigitalOutput::new(green_pin, mock)?,
            blue: DigitalOutput::new(blue_pin, mock)?,
            state: LedState::default(),
        })
    }

    fn set_color(&mut self, color: DisplayColor) -> Result<()> {
        let (red, green, blue) = color.channels();
        self.red.write(red)?;
        self.green.write(green)?;
        self.blue.write(blue)?;
        self.state = LedState { red, green, blue };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OLED panel (SSD1306, 128x64, I2C)
// ---------------------------------------------------------------------------

const SSD1306_INIT: &[u8] = &[
    0x00, // command stream
    0xAE, // display off
    0xD5, 0x80, // clock divide
    0xA8, 0x3F, // multiplex 64
    0xD3, 0x00, // display offset
    0x40, // start line 0
    0x8D, 0x14, // charge pump on
    0x20, 0x00, // horizontal addressing
    0xA1, // segment remap
    0xC8, // COM scan direction
    0xDA, 0x12, // COM pins
    0x81, 0xCF, // contrast
    0xD9, 0xF1, // precharge
    0xDB, 0x40, // VCOM detect
    0xA4, // resume from RAM
    0xA6, // normal (non-inverted)
    0xAF, // display on
];

struct OledDisplay {
    i2c: SharedI2c,
    addr: u16,
    mock: bool,
}

impl OledDisplay {
    fn new(i2c: SharedI2c, addr: u16, mock: bool) -> Self {
        Self { i2c, addr, mock }
    }

    fn init(&self) -> Result<()> {
        if self.mock {
            return Ok(());
        }
        lock_bus(&self.i2c)?.write(self.addr, SSD1306_INIT)
    }

    /// Render a title plus at most five content lines.
    fn show_screen(&self, title: &str, lines: &[String]) -> Result<()> {
        if self.mock {
            debug!(title, ?lines, "oled screen");
            return Ok(());
        }

        self.clear()?;
        self.write_text(0, 0, title)?;
        for (i, line) in lines.iter().take(5).enumerate() {
            self.write_text(0, (i + 1) * 10, line)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut bus = lock_bus(&self.i2c)?;
        // Full-frame addressing window, then zero all 1024 bytes of GDDRAM.
        bus.write(self.addr, &[0x00, 0x21, 0x00, 0x7F])?;
        bus.write(self.addr, &[0x00, 0x22, 0x00, 0x07])?;
        let mut frame = [0u8; 1025];
        frame[0] = 0x40; // data stream
        bus.write(self.addr, &frame)
    }

    #[allow(unused_variables)]
    fn write_text(&self, x: usize, y: usize, text: &str) -> Result<()> {
        // TODO: blit a 5x7 font into the addressing window; the panel
        // currently only shows the cleared frame in real mode.
        Ok(())
    }

    fn set_contrast(&self, brightness: u8) -> Result<()> {
        if self.mock {
            return Ok(());
        }
        lock_bus(&self.i2c)?.write(self.addr, &[0x00, 0x81, brightness])
    }

    fn off(&self) -> Result<()> {
        if self.mock {
            debug!("oled powered off");
            return Ok(());
        }
        lock_bus(&self.i2c)?.write(self.addr, &[0x00, 0xAE])
    }
}

// ---------------------------------------------------------------------------
// DisplaySystem
// ---------------------------------------------------------------------------

struct DisplayInner {
    leds: Option<StatusLeds>,
    oled: Option<OledDisplay>,
    current_alert: SystemAlert,
    screens: Vec<Screen>,
    screen_index: usize,
    current_screen: String,
    brightness: u8,
    last_update: Option<DateTime<Utc>>,
    blink: Option<JoinHandle<()>>,
    rotate: Option<JoinHandle<()>>,
    initialized: bool,
}

impl Default for DisplayInner {
    fn default() -> Self {
        Self {
            leds: None,
            oled: None,
            current_alert: SystemAlert::None,
            screens: Vec::new(),
            screen_index: 0,
            current_screen: String::new(),
            brightness: 0xCF,
            last_update: None,
            blink: None,
            rotate: None,
            initialized: false,
        }
    }
}

pub struct DisplaySystem {
    inner: Arc<RwLock<DisplayInner>>,
    mock: bool,
}

impl DisplaySystem {
    pub fn new(mock: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(DisplayInner::default())),
            mock,
        }
    }

    /// Bring up the LEDs (required) and the OLED panel (optional; a failed
    /// panel is logged and skipped). `i2c` is the shared bus handle; absent
    /// in real mode it also just disables the panel.
    pub async fn initialize(&self, config: &Config, i2c: Option<SharedI2c>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.initialized {
            return Ok(());
        }

        inner.leds = Some(
            StatusLeds::new(
                config.pins.led_red,
                config.pins.led_green,
                config.pins.led_blue,
                self.mock,
            )
            .map_err(|e| Error::Init {
                subsystem: "display",
                reason: format!("status LEDs: {e}"),
            })?,
        );

        inner.oled = i2c.and_then(|bus| {
            let oled = OledDisplay::new(bus, config.i2c.display_addr, self.mock);
            match oled.init() {
                Ok(()) => Some(oled),
                Err(e) => {
                    warn!("OLED panel not available: {e}");
                    None
                }
            }
        });

        inner.screens = default_screens();
        inner.initialized = true;
        Self::render_welcome(&mut inner)?;

        info!(
            oled = inner.oled.is_some(),
            mock = self.mock,
            "display system initialized"
        );
        Ok(())
    }

    /// Set the alert level and drive the LEDs accordingly. Critical blinks
    /// red; a new alert always cancels a blink already in flight.
    pub async fn set_alert(&self, alert: SystemAlert) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.initialized {
            return Err(Error::NotInitialized);
        }

        if let Some(blink) = inner.blink.take() {
            blink.abort();
        }
        inner.current_alert = alert;

        match alert {
            SystemAlert::None => Self::set_color_locked(&mut inner, DisplayColor::Green)?,
            SystemAlert::Info => Self::set_color_locked(&mut inner, DisplayColor::Blue)?,
            SystemAlert::Warning => Self::set_color_locked(&mut inner, DisplayColor::Yellow)?,
            SystemAlert::Error => Self::set_color_locked(&mut inner, DisplayColor::Red)?,
            SystemAlert::Critical => {
                Self::set_color_locked(&mut inner, DisplayColor::Red)?;
                inner.blink = Some(self.spawn_blink(DisplayColor::Red));
            }
        }
        Ok(())
    }

    pub async fn get_alert(&self) -> SystemAlert {
        self.inner.read().await.current_alert
    }

    /// Classify the readings, update the LEDs, and render the status screen.
    pub async fn show_system_status(
        &self,
        water_level: f64,
        temperature: f64,
        soil_moisture: f64,
        humidity: f64,
        lighting_on: bool,
    ) -> Result<()> {
        let alert = classify_alert(water_level, temperature, soil_moisture, humidity);
        self.set_alert(alert).await?;

        let mut inner = self.inner.write().await;
        let lines = vec![
            format!("Temp: {temperature:.1}°C"),
            format!("Humidity: {humidity:.1}%"),
            format!("Soil: {soil_moisture:.1}%"),
            format!("Water: {water_level:.1}%"),
            format!("Light: {}", if lighting_on { "ON" } else { "OFF" }),
            Local::now().format("%H:%M:%S").to_string(),
        ];
        Self::render(&mut inner, "Status", &lines, "system_status")
    }

    pub async fn show_welcome_screen(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.initialized {
            return Err(Error::NotInitialized);
        }
        Self::render_welcome(&mut inner)
    }

    pub async fn show_custom_screen(&self, title: &str, lines: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.initialized {
            return Err(Error::NotInitialized);
        }
        let name = format!("custom_{title}");
        Self::render(&mut inner, title, lines, &name)
    }

    pub async fn set_brightness(&self, brightness: u8) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(oled) = inner.oled.as_ref() {
            oled.set_contrast(brightness)?;
        }
        inner.brightness = brightness;
        Ok(())
    }

    /// Start cycling through the rotation screens, showing each for its own
    /// `duration`. Restarting replaces the previous rotation task.
    pub async fn start_auto_rotate(&self) {
        let mut inner = self.inner.write().await;
        if let Some(rotate) = inner.rotate.take() {
            rotate.abort();
        }

        let shared = Arc::clone(&self.inner);
        inner.rotate = Some(tokio::spawn(async move {
            loop {
                let dwell = {
                    let guard = shared.read().await;
                    guard
                        .screens
                        .get(guard.screen_index)
                        .map_or(Duration::from_secs(10), |s| s.duration)
                };
                tokio::time::sleep(dwell).await;
                let mut guard = shared.write().await;
                if guard.screens.is_empty() {
                    continue;
                }
                guard.screen_index = (guard.screen_index + 1) % guard.screens.len();
                let screen = guard.screens[guard.screen_index].clone();
                if let Err(e) = Self::render(&mut guard, &screen.title, &screen.lines, &screen.name)
                {
                    warn!("screen rotation failed: {e}");
                }
            }
        }));
        info!("screen rotation started");
    }

    pub async fn stop_auto_rotate(&self) {
        let mut inner = self.inner.write().await;
        if let Some(rotate) = inner.rotate.take() {
            rotate.abort();
            info!("screen rotation stopped");
        }
    }

    pub async fn get_status(&self) -> DisplayStatus {
        let inner = self.inner.read().await;
        DisplayStatus {
            status_leds: inner.leds.as_ref().map_or_else(LedState::default, |l| l.state),
            oled_enabled: inner.oled.is_some(),
            current_screen: inner.current_screen.clone(),
            current_alert: inner.current_alert,
            brightness: inner.brightness,
            last_update: inner.last_update,
        }
    }

    /// Shutdown screen, LEDs off, panel off. Safe to call twice.
    pub async fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.initialized {
            return Ok(());
        }
        if let Some(blink) = inner.blink.take() {
            blink.abort();
        }
        if let Some(rotate) = inner.rotate.take() {
            rotate.abort();
        }

        let mut errors = Vec::new();

        let lines = vec![
            "Plant Wall Control".to_string(),
            String::new(),
            "Shutting down...".to_string(),
            String::new(),
            "Safe to power off".to_string(),
            Local::now().format("%H:%M:%S").to_string(),
        ];
        if let Err(e) = Self::render(&mut inner, "Shutdown", &lines, "shutdown") {
            errors.push(e);
        }

        if let Err(e) = Self::set_color_locked(&mut inner, DisplayColor::Off) {
            errors.push(e);
        }
        if let Some(oled) = inner.oled.as_ref() {
            if let Err(e) = oled.off() {
                errors.push(e);
            }
        }

        *inner = DisplayInner::default();
        debug!("display system cleaned up");
        Error::aggregate("display cleanup", errors)
    }

    // -- internals ---------------------------------------------------------

    fn set_color_locked(inner: &mut DisplayInner, color: DisplayColor) -> Result<()> {
        inner
            .leds
            .as_mut()
            .ok_or(Error::NotInitialized)?
            .set_color(color)
    }

    /// Render to the panel when one is present; always record the screen
    /// change. A system without a panel is not an error.
    fn render(inner: &mut DisplayInner, title: &str, lines: &[String], name: &str) -> Result<()> {
        if let Some(oled) = inner.oled.as_ref() {
            oled.show_screen(title, lines)
                .map_err(|e| Error::Device(format!("OLED update: {e}")))?;
        }
        inner.current_screen = name.to_string();
        inner.last_update = Some(Utc::now());
        Ok(())
    }

    fn render_welcome(inner: &mut DisplayInner) -> Result<()> {
        Self::set_color_locked(inner, DisplayColor::Blue)?;
        let lines = vec![
            "Plant Wall Control".to_string(),
            "System Starting...".to_string(),
            String::new(),
            format!("v1.0 - {}", Local::now().format("%Y-%m-%d")),
            String::new(),
            "Initializing...".to_string(),
        ];
        Self::render(inner, "Welcome", &lines, "welcome")
    }

    fn spawn_blink(&self, color: DisplayColor) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // The interval's first tick is immediate. Start lit so the alert
            // color holds for a full half-period before the first blank.
            let mut on = true;
            let mut tick = tokio::time::interval(BLINK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let mut guard = inner.write().await;
                let target = if on { color } else { DisplayColor::Off };
                if let Err(e) = Self::set_color_locked(&mut guard, target) {
                    warn!("blink update failed: {e}");
                    return;
                }
                on = !on;
            }
        })
    }
}

fn default_screens() -> Vec<Screen> {
    vec![
        Screen {
            name: "status".into(),
            title: "System Status".into(),
            lines: vec!["Loading...".into()],
            duration: Duration::from_secs(10),
        },
        Screen {
            name: "network".into(),
            title: "Network Info".into(),
            lines: vec![
                "WiFi: Connected".into(),
                "IP: 192.168.1.100".into(),
                "API: :5000".into(),
                String::new(),
                "Web: :3000".into(),
            ],
            duration: Duration::from_secs(5),
        },
        Screen {
            name: "uptime".into(),
            title: "System Info".into(),
            lines: vec![
                "Plant Wall v1.0".into(),
                "Raspberry Pi Zero 2W".into(),
                format!("Started: {}", Local::now().format("%H:%M")),
                String::new(),
                "All systems ready".into(),
            ],
            duration: Duration::from_secs(5),
        },
    ]
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::device::I2cBus;

    async fn system() -> DisplaySystem {
        let system = DisplaySystem::new(true);
        let i2c: SharedI2c = Arc::new(Mutex::new(I2cBus::open(true).unwrap()));
        system
            .initialize(&Config::default(), Some(i2c))
            .await
            .unwrap();
        system
    }

    // -- Alert classification ----------------------------------------------

    #[test]
    fn very_low_water_is_critical() {
        assert_eq!(classify_alert(5.0, 20.0, 50.0, 50.0), SystemAlert::Critical);
    }

    #[test]
    fn extreme_temperature_is_critical() {
        assert_eq!(classify_alert(50.0, 36.0, 50.0, 50.0), SystemAlert::Critical);
        assert_eq!(classify_alert(50.0, 4.0, 50.0, 50.0), SystemAlert::Critical);
    }

    #[test]
    fn healthy_readings_are_quiet() {
        assert_eq!(classify_alert(50.0, 20.0, 50.0, 50.0), SystemAlert::None);
    }

    #[test]
    fn dry_soil_is_an_error() {
        assert_eq!(classify_alert(50.0, 20.0, 15.0, 50.0), SystemAlert::Error);
    }

    #[test]
    fn drying_soil_is_a_warning() {
        assert_eq!(classify_alert(50.0, 20.0, 35.0, 50.0), SystemAlert::Warning);
    }

    #[test]
    fn humidity_band_is_a_warning() {
        assert_eq!(classify_alert(50.0, 20.0, 50.0, 30.0), SystemAlert::Warning);
        assert_eq!(classify_alert(50.0, 20.0, 50.0, 85.0), SystemAlert::Warning);
    }

    #[test]
    fn severity_is_ordered() {
        assert!(SystemAlert::Critical > SystemAlert::Error);
        assert!(SystemAlert::Error > SystemAlert::Warning);
        assert!(SystemAlert::Warning > SystemAlert::Info);
        assert!(SystemAlert::Info > SystemAlert::None);
    }

    // -- System behaviour --------------------------------------------------

    #[tokio::test]
    async fn welcome_screen_shown_on_init() {
        let system = system().await;
        let status = system.get_status().await;
        assert_eq!(status.current_screen, "welcome");
        assert!(status.oled_enabled);
        assert!(status.status_leds.blue);
        assert!(status.last_update.is_some());
    }

    #[tokio::test]
    async fn alerts_drive_led_colors() {
        let system = system().await;

        system.set_alert(SystemAlert::None).await.unwrap();
        let leds = system.get_status().await.status_leds;
        assert!(!leds.red && leds.green && !leds.blue);

        system.set_alert(SystemAlert::Warning).await.unwrap();
        let leds = system.get_status().await.status_leds;
        assert!(leds.red && leds.green && !leds.blue);

        system.set_alert(SystemAlert::Error).await.unwrap();
        let leds = system.get_status().await.status_leds;
        assert!(leds.red && !leds.green && !leds.blue);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_alert_starts_lit() {
        let system = system().await;
        system.set_alert(SystemAlert::Critical).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let leds = system.get_status().await.status_leds;
        assert!(leds.red, "alert color must hold before the first blank");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!system.get_status().await.status_leds.red);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(system.get_status().await.status_leds.red);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_blink_cancelled_by_new_alert() {
        let system = system().await;
        system.set_alert(SystemAlert::Critical).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1600)).await;

        system.set_alert(SystemAlert::None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1600)).await;

        // After the blink task is aborted the LEDs must hold steady green.
        let leds = system.get_status().await.status_leds;
        assert!(!leds.red && leds.green && !leds.blue);
    }

    #[tokio::test]
    async fn status_screen_reflects_readings() {
        let system = system().await;
        system
            .show_system_status(75.5, 23.4, 45.2, 65.8, true)
            .await
            .unwrap();

        let status = system.get_status().await;
        assert_eq!(status.current_screen, "system_status");
        assert_eq!(status.current_alert, SystemAlert::None);
    }

    #[tokio::test]
    async fn custom_screen_names_itself() {
        let system = system().await;
        system
            .show_custom_screen("Maintenance", &["Draining".to_string()])
            .await
            .unwrap();
        assert_eq!(
            system.get_status().await.current_screen,
            "custom_Maintenance"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_honors_per_screen_durations() {
        let system = system().await;
        system.start_auto_rotate().await;

        // The status screen dwells for 10s, the others for 5s each.
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(system.get_status().await.current_screen, "network");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(system.get_status().await.current_screen, "uptime");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(system.get_status().await.current_screen, "status");

        system.stop_auto_rotate().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(system.get_status().await.current_screen, "status");
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let system = system().await;
        system.cleanup().await.unwrap();
        system.cleanup().await.unwrap();
        assert!(matches!(
            system.set_alert(SystemAlert::Info).await,
            Err(Error::NotInitialized)
        ));
    }
}

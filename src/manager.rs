//! Top-level coordinator: owns the four subsystems, brings them up in
//! dependency order, and runs the status monitor that keeps the display in
//! sync with the sensors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::display::{DisplayStatus, DisplaySystem, SystemAlert};
use crate::error::{Error, Result};
use crate::lighting::{LightingStatus, LightingSystem};
use crate::sensors::{SensorManager, SensorSnapshot};
use crate::watering::{WateringStatus, WateringSystem};

/// Cadence of the display-refresh monitor.
const MONITOR_TICK: Duration = Duration::from_secs(30);

/// Consolidated status of every subsystem, taken in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensors: Option<SensorSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_error: Option<String>,
    pub watering: WateringStatus,
    pub lighting: LightingStatus,
    pub display: DisplayStatus,
    pub timestamp: DateTime<Utc>,
    pub mock_mode: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub sensors: bool,
    pub watering: bool,
    pub lighting: bool,
    pub display: bool,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.sensors && self.watering && self.lighting && self.display
    }
}

pub struct HardwareManager {
    config: Config,
    sensors: Arc<SensorManager>,
    watering: Arc<WateringSystem>,
    lighting: Arc<LightingSystem>,
    display: Arc<DisplaySystem>,
    shutdown: watch::Sender<bool>,
    initialized: RwLock<bool>,
    mock: bool,
}

impl HardwareManager {
    pub fn new(config: Config, mock: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            sensors: Arc::new(SensorManager::new(mock)),
            watering: Arc::new(WateringSystem::new(mock)),
            lighting: Arc::new(LightingSystem::new(mock)),
            display: Arc::new(DisplaySystem::new(mock)),
            shutdown,
            initialized: RwLock::new(false),
            mock,
        }
    }

    /// Bring up every subsystem. Sensors come first so the watering system
    /// and display can share its bus handles; any subsystem failing aborts
    /// the whole initialization.
    pub async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return Ok(());
        }

        self.sensors.initialize(&self.config).await?;
        let adc = self.sensors.adc().await;
        let i2c = self.sensors.i2c().await;

        self.watering.initialize(&self.config, adc).await?;
        self.lighting.initialize(&self.config).await?;
        self.display.initialize(&self.config, i2c).await?;

        self.spawn_monitor();
        *initialized = true;
        info!(mock = self.mock, "hardware manager initialized");
        Ok(())
    }

    pub fn sensors(&self) -> Arc<SensorManager> {
        Arc::clone(&self.sensors)
    }

    pub fn watering(&self) -> Arc<WateringSystem> {
        Arc::clone(&self.watering)
    }

    pub fn lighting(&self) -> Arc<LightingSystem> {
        Arc::clone(&self.lighting)
    }

    pub fn display(&self) -> Arc<DisplaySystem> {
        Arc::clone(&self.display)
    }

    /// Snapshot of every subsystem. A sensor failure is reported in-band;
    /// only an uninitialized manager fails the call.
    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        if !*self.initialized.read().await {
            return Err(Error::NotInitialized);
        }

        let (sensors, sensor_error) = match self.sensors.read_all().await {
            Ok(snapshot) => (Some(snapshot), None),
            Err(e) => (None, Some(e.to_string())),
        };

        Ok(SystemStatus {
            sensors,
            sensor_error,
            watering: self.watering.get_status().await,
            lighting: self.lighting.get_status().await,
            display: self.display.get_status().await,
            timestamp: Utc::now(),
            mock_mode: self.mock,
        })
    }

    /// Halt all actuation at once: watering stops and latches, lights go
    /// dark, and the display flags the condition. Every step is attempted
    /// regardless of earlier failures.
    pub async fn emergency_stop(&self) -> Result<()> {
        warn!("emergency stop requested");
        let mut errors = Vec::new();

        if let Err(e) = self.watering.emergency_stop().await {
            errors.push(e);
        }
        if let Err(e) = self.lighting.turn_off().await {
            errors.push(e);
        }

        if let Err(e) = self.display.set_alert(SystemAlert::Critical).await {
            errors.push(e);
        }
        let lines = vec![
            "EMERGENCY STOP".to_string(),
            "All systems halted".to_string(),
            String::new(),
            "Check system status".to_string(),
            "Manual reset required".to_string(),
            chrono::Local::now().format("%H:%M:%S").to_string(),
        ];
        if let Err(e) = self.display.show_custom_screen("EMERGENCY", &lines).await {
            errors.push(e);
        }

        Error::aggregate("emergency stop", errors)
    }

    pub async fn perform_health_check(&self) -> HealthReport {
        let sensors = self.sensors.read_all().await.is_ok();
        let watering = !self.watering.get_status().await.emergency_stop;
        let lighting = self.lighting.get_status().await.power_watts >= 0.0;
        let display = self.display.get_status().await.last_update.is_some();

        HealthReport {
            sensors,
            watering,
            lighting,
            display,
        }
    }

    /// Shut down in reverse initialization order, attempting every
    /// subsystem even when earlier ones fail. Safe to call twice.
    pub async fn cleanup(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut initialized = self.initialized.write().await;

        let mut errors = Vec::new();
        if let Err(e) = self.display.cleanup().await {
            errors.push(e);
        }
        if let Err(e) = self.lighting.cleanup().await {
            errors.push(e);
        }
        if let Err(e) = self.watering.cleanup().await {
            errors.push(e);
        }
        if let Err(e) = self.sensors.cleanup().await {
            errors.push(e);
        }

        *initialized = false;
        info!("hardware manager cleaned up");
        Error::aggregate("hardware cleanup", errors)
    }

    /// Periodic refresh of the status display from live readings. A failed
    /// sensor pass skips the cycle rather than rendering stale numbers.
    fn spawn_monitor(&self) {
        let sensors = Arc::clone(&self.sensors);
        let watering = Arc::clone(&self.watering);
        let lighting = Arc::clone(&self.lighting);
        let display = Arc::clone(&self.display);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let snapshot = match sensors.read_all().await {
                            Ok(snapshot) => snapshot,
                            Err(e) => {
                                warn!("monitor skipping cycle: {e}");
                                continue;
                            }
                        };

                        let soil_avg = if snapshot.soil_moisture.is_empty() {
                            0.0
                        } else {
                            snapshot.soil_moisture.iter().map(|r| r.value).sum::<f64>()
                                / snapshot.soil_moisture.len() as f64
                        };
                        let water_level = watering.get_status().await.water_level;
                        let lighting_on = lighting.get_status().await.is_on;

                        if let Err(e) = display
                            .show_system_status(
                                water_level,
                                snapshot.temperature.value,
                                soil_avg,
                                snapshot.humidity.value,
                                lighting_on,
                            )
                            .await
                        {
                            error!("status display update failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> HardwareManager {
        let manager = HardwareManager::new(Config::default(), true);
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn status_requires_initialize() {
        let manager = HardwareManager::new(Config::default(), true);
        assert!(matches!(
            manager.get_system_status().await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let manager = manager().await;
        manager.initialize().await.unwrap();
        assert!(manager.get_system_status().await.is_ok());
    }

    #[tokio::test]
    async fn status_covers_every_subsystem() {
        let manager = manager().await;
        let status = manager.get_system_status().await.unwrap();

        assert!(status.mock_mode);
        assert!(status.sensor_error.is_none());
        let sensors = status.sensors.expect("sensor snapshot");
        assert_eq!(sensors.soil_moisture.len(), 4);
        assert!(!status.watering.emergency_stop);
        assert!(!status.lighting.is_on);
        assert!(status.display.oled_enabled);
    }

    #[tokio::test]
    async fn emergency_stop_cascades() {
        let manager = manager().await;
        manager
            .watering()
            .start_watering(0, Some(Duration::from_secs(300)))
            .await
            .unwrap();
        manager.lighting().turn_on(255).await.unwrap();

        manager.emergency_stop().await.unwrap();

        let status = manager.get_system_status().await.unwrap();
        assert!(status.watering.emergency_stop);
        assert!(!status.watering.pump_active);
        assert!(!status.lighting.is_on);
        assert_eq!(status.display.current_alert, SystemAlert::Critical);
        assert_eq!(status.display.current_screen, "custom_EMERGENCY");
    }

    #[tokio::test]
    async fn health_check_tracks_emergency() {
        let manager = manager().await;
        assert!(manager.perform_health_check().await.all_healthy());

        manager.emergency_stop().await.unwrap();
        let health = manager.perform_health_check().await;
        assert!(!health.watering);
        assert!(health.sensors);
        assert!(!health.all_healthy());

        manager.watering().reset_emergency_stop().await;
        assert!(manager.perform_health_check().await.all_healthy());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let manager = manager().await;
        manager.cleanup().await.unwrap();
        manager.cleanup().await.unwrap();
        assert!(matches!(
            manager.get_system_status().await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn status_serializes_to_json() {
        let manager = manager().await;
        let status = manager.get_system_status().await.unwrap();

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mock_mode"], true);
        assert_eq!(json["sensors"]["soil_moisture"].as_array().unwrap().len(), 4);
        assert_eq!(json["watering"]["water_level"], 75.5);
        assert!(json.get("sensor_error").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_watering_runs_without_extra_calls() {
        let manager = manager().await;

        let mut schedule = manager.watering().get_schedules().await[0].clone();
        schedule.next_watering = Utc::now() - chrono::Duration::minutes(1);
        schedule.duration = Duration::from_secs(600);
        manager.watering().update_schedule(0, schedule).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        let status = manager.get_system_status().await.unwrap();
        assert!(status.watering.schedule_active);
        assert!(
            status.watering.valve_open[0],
            "due module should water after initialize alone"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_refreshes_status_screen() {
        let manager = manager().await;
        assert_eq!(
            manager.get_system_status().await.unwrap().display.current_screen,
            "welcome"
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        let status = manager.get_system_status().await.unwrap();
        assert_eq!(status.display.current_screen, "system_status");
    }
}

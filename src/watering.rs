//! Pump, per-module valves, flow metering, and the watering scheduler.
//!
//! Safety invariants enforced here: the pump never runs with every valve
//! closed, a module cannot be double-watered, and nothing waters while the
//! emergency stop is latched or the reservoir is below its floor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::{lock_bus, DigitalOutput, PulseCounter, SharedAdc};
use crate::error::{Error, Result};
use crate::sensors::ADC_CH_WATER_LEVEL;

/// How often the scheduler re-checks due modules.
const SCHEDULE_TICK: Duration = Duration::from_secs(60);
/// How often the flow meter is resampled.
const FLOW_TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Status & schedule types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WateringStatus {
    pub pump_active: bool,
    pub valve_open: Vec<bool>,
    pub water_level: f64,
    pub flow_rate: f64,
    pub last_watering_time: Option<DateTime<Utc>>,
    pub total_volume_today: f64,
    pub emergency_stop: bool,
    pub schedule_active: bool,
}

/// Per-module watering plan. `next_watering` is absolute so a restart
/// does not double-water modules that just ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WateringSchedule {
    pub module_id: usize,
    pub enabled: bool,
    pub duration: Duration,
    pub interval: Duration,
    pub moisture_target: f64,
    pub last_watered: Option<DateTime<Utc>>,
    pub next_watering: DateTime<Utc>,
}

impl WateringSchedule {
    fn default_for(module_id: usize) -> Self {
        Self {
            module_id,
            enabled: true,
            duration: Duration::from_secs(30),
            interval: Duration::from_secs(6 * 3600),
            moisture_target: 60.0,
            last_watered: None,
            next_watering: Utc::now() + chrono::Duration::hours(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuators & probes
// ---------------------------------------------------------------------------

struct Pump {
    output: DigitalOutput,
    active: bool,
}

impl Pump {
    fn new(pin: u8, mock: bool) -> Result<Self> {
        Ok(Self {
            output: DigitalOutput::new(pin, mock)?,
            active: false,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.output.write(true)?;
        self.active = true;
        info!("pump started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.output.write(false)?;
        self.active = false;
        info!("pump stopped");
        Ok(())
    }
}

struct Valve {
    module: usize,
    output: DigitalOutput,
    open: bool,
}

impl Valve {
    fn new(module: usize, pin: u8, mock: bool) -> Result<Self> {
        Ok(Self {
            module,
            output: DigitalOutput::new(pin, mock)?,
            open: false,
        })
    }

    fn open(&mut self) -> Result<()> {
        self.output.write(true)?;
        self.open = true;
        debug!(module = self.module, "valve opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.output.write(false)?;
        self.open = false;
        debug!(module = self.module, "valve closed");
        Ok(())
    }
}

/// Hall-effect flow meter. Pulses accumulate in an interrupt counter and
/// are folded into a rate no more often than once a second.
struct FlowSensor {
    counter: PulseCounter,
    pulses_per_liter: f64,
    last_sample: Instant,
    rate_lpm: f64,
    mock: bool,
}

impl FlowSensor {
    fn new(pin: u8, pulses_per_liter: f64, mock: bool) -> Result<Self> {
        Ok(Self {
            counter: PulseCounter::new(pin, mock)?,
            pulses_per_liter,
            last_sample: Instant::now(),
            rate_lpm: 0.0,
            mock,
        })
    }

    /// Fold accumulated pulses into the current rate. Returns the liters
    /// delivered since the previous sample (0 when called again within
    /// the sampling window).
    fn sample(&mut self, pump_active: bool) -> f64 {
        let elapsed = self.last_sample.elapsed();
        if elapsed < Duration::from_secs(1) {
            return 0.0;
        }
        self.last_sample = Instant::now();

        if self.mock {
            self.rate_lpm = if pump_active { 1.2 } else { 0.0 };
            return self.rate_lpm / 60.0 * elapsed.as_secs_f64();
        }

        let pulses = self.counter.take() as f64;
        let liters = pulses / self.pulses_per_liter;
        self.rate_lpm = liters / elapsed.as_secs_f64() * 60.0;
        liters
    }
}

/// Reservoir level probe on the shared MCP3008, reported in percent.
struct WaterLevelSensor {
    adc: Option<SharedAdc>,
    mock_level: f64,
    mock: bool,
}

impl WaterLevelSensor {
    fn new(adc: Option<SharedAdc>, mock: bool) -> Result<Self> {
        if !mock && adc.is_none() {
            return Err(Error::Init {
                subsystem: "watering",
                reason: "no ADC handle for the water level probe".into(),
            });
        }
        Ok(Self {
            adc,
            mock_level: 75.5,
            mock,
        })
    }

    fn read_percent(&self) -> Result<f64> {
        if self.mock {
            return Ok(self.mock_level);
        }
        let adc = self.adc.as_ref().ok_or(Error::NotInitialized)?;
        let raw = lock_bus(adc)?.read_channel(ADC_CH_WATER_LEVEL)?;
        Ok(f64::from(raw) / 1023.0 * 100.0)
    }
}

// ---------------------------------------------------------------------------
// WateringSystem
// ---------------------------------------------------------------------------

struct WateringInner {
    pump: Option<Pump>,
    valves: Vec<Valve>,
    flow: Option<FlowSensor>,
    level: Option<WaterLevelSensor>,
    schedules: Vec<WateringSchedule>,
    in_flight: Vec<bool>,
    min_water_level: f64,
    water_level: f64,
    emergency_stop: bool,
    last_watering_time: Option<DateTime<Utc>>,
    total_volume_today: f64,
    volume_day: u32,
    schedule_active: bool,
    initialized: bool,
}

impl Default for WateringInner {
    fn default() -> Self {
        Self {
            pump: None,
            valves: Vec::new(),
            flow: None,
            level: None,
            schedules: Vec::new(),
            in_flight: Vec::new(),
            min_water_level: 20.0,
            water_level: 0.0,
            emergency_stop: false,
            last_watering_time: None,
            total_volume_today: 0.0,
            volume_day: 0,
            schedule_active: false,
            initialized: false,
        }
    }
}

pub struct WateringSystem {
    inner: Arc<RwLock<WateringInner>>,
    shutdown: watch::Sender<bool>,
    mock: bool,
}

impl WateringSystem {
    pub fn new(mock: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RwLock::new(WateringInner::default())),
            shutdown,
            mock,
        }
    }

    /// Build the pump, one valve per configured module, the flow meter and
    /// the level probe, then start the background flow sampler and the
    /// watering scheduler.
    ///
    /// `adc` is the shared MCP3008 handle owned by the sensor layer; the
    /// level probe shares its bus lock. In mock mode it may be absent.
    pub async fn initialize(&self, config: &Config, adc: Option<SharedAdc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.initialized {
            return Ok(());
        }

        let init_err = |reason: String| Error::Init {
            subsystem: "watering",
            reason,
        };

        inner.pump = Some(
            Pump::new(config.pins.pump, self.mock).map_err(|e| init_err(format!("pump: {e}")))?,
        );
        inner.valves = config
            .pins
            .valves
            .iter()
            .enumerate()
            .map(|(module, &pin)| Valve::new(module, pin, self.mock))
            .collect::<Result<_>>()
            .map_err(|e| init_err(format!("valves: {e}")))?;
        inner.flow = Some(
            FlowSensor::new(config.pins.flow, config.watering.pulses_per_liter, self.mock)
                .map_err(|e| init_err(format!("flow meter: {e}")))?,
        );
        inner.level = Some(WaterLevelSensor::new(adc, self.mock)?);

        inner.schedules = (0..config.module_count())
            .map(WateringSchedule::default_for)
            .collect();
        inner.in_flight = vec![false; config.module_count()];
        inner.min_water_level = config.watering.min_water_level;
        inner.volume_day = Utc::now().ordinal();
        inner.water_level = Self::refresh_level(&mut inner);
        inner.initialized = true;
        drop(inner);

        self.spawn_flow_sampler();
        self.start_schedule().await;

        info!(mock = self.mock, "watering system initialized");
        Ok(())
    }

    /// Open `module`'s valve and run the pump for `duration` (the module's
    /// scheduled duration when `None`). Returns once watering has started;
    /// a background task performs the timed stop.
    pub async fn start_watering(&self, module: usize, duration: Option<Duration>) -> Result<()> {
        let duration =
            Self::begin_watering(&self.inner, module, duration).await?;

        // Timed stop, cancelled by shutdown.
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if let Err(e) = Self::finish_watering(&inner, module).await {
                        error!(module, "timed stop failed: {e}");
                    }
                }
                _ = shutdown.changed() => {}
            }
        });

        Ok(())
    }

    /// Stop watering `module` immediately and reschedule its next run.
    pub async fn stop_watering(&self, module: usize) -> Result<()> {
        Self::finish_watering(&self.inner, module).await
    }

    /// Latch the emergency stop: close every valve and stop the pump,
    /// attempting all of it even if individual actuators fail.
    pub async fn emergency_stop(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.emergency_stop = true;
        warn!("watering emergency stop");

        let mut errors = Vec::new();
        for valve in &mut inner.valves {
            if let Err(e) = valve.close() {
                errors.push(e);
            }
        }
        if let Some(pump) = inner.pump.as_mut() {
            if let Err(e) = pump.stop() {
                errors.push(e);
            }
        }
        inner.in_flight.iter_mut().for_each(|f| *f = false);

        Error::aggregate("watering emergency stop", errors)
    }

    /// Clear the emergency latch. Watering stays off until requested again.
    pub async fn reset_emergency_stop(&self) {
        self.inner.write().await.emergency_stop = false;
        info!("watering emergency stop reset");
    }

    pub async fn get_status(&self) -> WateringStatus {
        let mut inner = self.inner.write().await;
        inner.water_level = Self::refresh_level(&mut inner);
        Self::sample_flow(&mut inner);

        WateringStatus {
            pump_active: inner.pump.as_ref().is_some_and(|p| p.active),
            valve_open: inner.valves.iter().map(|v| v.open).collect(),
            water_level: inner.water_level,
            flow_rate: inner.flow.as_ref().map_or(0.0, |f| f.rate_lpm),
            last_watering_time: inner.last_watering_time,
            total_volume_today: inner.total_volume_today,
            emergency_stop: inner.emergency_stop,
            schedule_active: inner.schedule_active,
        }
    }

    /// Zero the dispensed-volume counter (it also rolls over at midnight).
    pub async fn reset_total_volume(&self) {
        let mut inner = self.inner.write().await;
        inner.total_volume_today = 0.0;
        inner.volume_day = Utc::now().ordinal();
        info!("total volume counter reset");
    }

    pub async fn get_schedules(&self) -> Vec<WateringSchedule> {
        self.inner.read().await.schedules.clone()
    }

    pub async fn update_schedule(&self, module: usize, mut schedule: WateringSchedule) -> Result<()> {
        let mut inner = self.inner.write().await;
        if module >= inner.schedules.len() {
            return Err(Error::InvalidModule(module));
        }
        schedule.module_id = module;
        info!(
            module,
            enabled = schedule.enabled,
            duration_s = schedule.duration.as_secs(),
            interval_s = schedule.interval.as_secs(),
            "watering schedule updated"
        );
        inner.schedules[module] = schedule;
        Ok(())
    }

    /// Start the background scheduler that waters each enabled module when
    /// its `next_watering` comes due. Runs automatically from `initialize`;
    /// calling it again after `stop_schedule` resumes scheduling.
    pub async fn start_schedule(&self) {
        {
            let mut inner = self.inner.write().await;
            if inner.schedule_active {
                return;
            }
            inner.schedule_active = true;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if !inner.read().await.schedule_active {
                            break;
                        }
                        Self::run_due_schedules(&inner).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("watering scheduler stopped");
        });
        info!("watering scheduler started");
    }

    pub async fn stop_schedule(&self) {
        self.inner.write().await.schedule_active = false;
        info!("watering scheduler stopping");
    }

    /// Stop everything and release the hardware. Safe to call twice.
    pub async fn cleanup(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let mut inner = self.inner.write().await;
        if !inner.initialized {
            return Ok(());
        }

        let mut errors = Vec::new();
        for valve in &mut inner.valves {
            if let Err(e) = valve.close() {
                errors.push(e);
            }
        }
        if let Some(pump) = inner.pump.as_mut() {
            if let Err(e) = pump.stop() {
                errors.push(e);
            }
        }
        *inner = WateringInner::default();
        debug!("watering system cleaned up");

        Error::aggregate("watering cleanup", errors)
    }

    // -- internals ---------------------------------------------------------

    /// Validate and actuate the start of a watering run. Returns the run
    /// duration on success.
    async fn begin_watering(
        inner: &Arc<RwLock<WateringInner>>,
        module: usize,
        duration: Option<Duration>,
    ) -> Result<Duration> {
        let mut inner = inner.write().await;
        if !inner.initialized {
            return Err(Error::NotInitialized);
        }
        if inner.emergency_stop {
            return Err(Error::EmergencyStopActive);
        }
        if module >= inner.valves.len() {
            return Err(Error::InvalidModule(module));
        }
        if inner.in_flight[module] {
            return Err(Error::AlreadyWatering(module));
        }

        let level = Self::refresh_level(&mut inner);
        inner.water_level = level;
        if level < inner.min_water_level {
            return Err(Error::WaterLevelLow(level));
        }

        let duration = duration.unwrap_or(inner.schedules[module].duration);

        let pump_was_active = inner.pump.as_ref().is_some_and(|p| p.active);
        if !pump_was_active {
            inner
                .pump
                .as_mut()
                .ok_or(Error::NotInitialized)?
                .start()?;
        }

        if let Err(e) = inner.valves[module].open() {
            // Roll back the pump, but only if no other module still needs it.
            let any_open = inner.valves.iter().any(|v| v.open);
            if !any_open {
                if let Some(pump) = inner.pump.as_mut() {
                    if let Err(stop_err) = pump.stop() {
                        error!("pump stop after valve failure also failed: {stop_err}");
                    }
                }
            }
            return Err(e);
        }

        inner.in_flight[module] = true;
        inner.last_watering_time = Some(Utc::now());
        info!(module, duration_s = duration.as_secs(), "watering started");
        Ok(duration)
    }

    /// Close the module's valve, stop the pump when it was the last open
    /// valve, and advance the module's schedule.
    async fn finish_watering(inner: &Arc<RwLock<WateringInner>>, module: usize) -> Result<()> {
        let mut inner = inner.write().await;
        if module >= inner.valves.len() {
            return Err(Error::InvalidModule(module));
        }
        if !inner.in_flight[module] && !inner.valves[module].open {
            return Ok(());
        }

        inner.valves[module].close()?;
        inner.in_flight[module] = false;

        let any_open = inner.valves.iter().any(|v| v.open);
        if !any_open {
            if let Some(pump) = inner.pump.as_mut() {
                pump.stop()?;
            }
        }

        let now = Utc::now();
        if let Some(schedule) = inner.schedules.get_mut(module) {
            schedule.last_watered = Some(now);
            schedule.next_watering = now
                + chrono::Duration::from_std(schedule.interval)
                    .unwrap_or_else(|_| chrono::Duration::hours(6));
        }
        info!(module, "watering stopped");
        Ok(())
    }

    async fn run_due_schedules(inner: &Arc<RwLock<WateringInner>>) {
        let due: Vec<(usize, Duration)> = {
            let guard = inner.read().await;
            if guard.emergency_stop {
                return;
            }
            let now = Utc::now();
            guard
                .schedules
                .iter()
                .filter(|s| {
                    s.enabled
                        && now >= s.next_watering
                        && !guard.in_flight.get(s.module_id).copied().unwrap_or(true)
                })
                .map(|s| (s.module_id, s.duration))
                .collect()
        };

        for (module, duration) in due {
            match Self::begin_watering(inner, module, Some(duration)).await {
                Ok(duration) => {
                    let inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        if let Err(e) = Self::finish_watering(&inner, module).await {
                            error!(module, "scheduled stop failed: {e}");
                        }
                    });
                }
                Err(e) => warn!(module, "scheduled watering skipped: {e}"),
            }
        }
    }

    /// Read the reservoir probe, falling back to the last known level on a
    /// failed read.
    fn refresh_level(inner: &mut WateringInner) -> f64 {
        match inner.level.as_ref().map(|l| l.read_percent()) {
            Some(Ok(level)) => level,
            Some(Err(e)) => {
                warn!("water level read failed: {e}");
                inner.water_level
            }
            None => inner.water_level,
        }
    }

    fn sample_flow(inner: &mut WateringInner) {
        let pump_active = inner.pump.as_ref().is_some_and(|p| p.active);

        // Daily volume counter rolls over at midnight UTC.
        let today = Utc::now().ordinal();
        if today != inner.volume_day {
            inner.volume_day = today;
            inner.total_volume_today = 0.0;
        }

        if let Some(flow) = inner.flow.as_mut() {
            inner.total_volume_today += flow.sample(pump_active);
        }
    }

    fn spawn_flow_sampler(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLOW_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut guard = inner.write().await;
                        if !guard.initialized {
                            break;
                        }
                        Self::sample_flow(&mut guard);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn set_mock_water_level(&self, level: f64) {
        if let Some(sensor) = self.inner.write().await.level.as_mut() {
            sensor.mock_level = level;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

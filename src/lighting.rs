//! LED strip control: manual brightness, fades, preset programs, and a
//! daily schedule with a dimming curve.
//!
//! All brightness changers go through one generation counter. Every direct
//! command bumps it, and any fade or program still running under an older
//! generation stops at its next step, so the most recent caller always
//! wins and stale tasks never fight over the strip.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{DigitalOutput, PwmOutput};
use crate::error::{Error, Result};

/// Cadence of the power/temperature monitor.
const MONITOR_TICK: Duration = Duration::from_secs(30);
/// Cadence of the schedule checker.
const SCHEDULE_TICK: Duration = Duration::from_secs(60);
/// Number of intermediate steps in a fade.
const FADE_STEPS: u32 = 50;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightingMode {
    Manual,
    Scheduled,
    /// Sensor-driven brightness; not wired up yet and rejected by
    /// [`LightingSystem::set_mode`].
    Automatic,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightingStatus {
    pub is_on: bool,
    pub brightness: u8,
    pub mode: LightingMode,
    pub current_program: Option<String>,
    pub power_watts: f64,
    pub temperature: f64,
    pub runtime: Duration,
    pub schedule: LightSchedule,
}

/// A point on the daily dimming curve, offset from the schedule's on time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimPoint {
    pub offset: Duration,
    pub brightness: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightSchedule {
    pub enabled: bool,
    pub on_time: NaiveTime,
    pub duration: Duration,
    pub dimming_curve: Vec<DimPoint>,
    pub weekdays_only: bool,
}

impl Default for LightSchedule {
    fn default() -> Self {
        let hour = |h: u64| Duration::from_secs(h * 3600);
        Self {
            enabled: false,
            on_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            duration: hour(12),
            dimming_curve: vec![
                DimPoint { offset: Duration::ZERO, brightness: 50 },
                DimPoint { offset: hour(1), brightness: 255 },
                DimPoint { offset: hour(10), brightness: 255 },
                DimPoint { offset: hour(11), brightness: 100 },
                DimPoint { offset: hour(12), brightness: 0 },
            ],
            weekdays_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LightStep {
    pub duration: Duration,
    pub brightness: u8,
    /// Fade time into this step's brightness; zero means an instant jump.
    pub transition: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightingProgram {
    pub name: String,
    pub description: String,
    pub duration: Duration,
    pub steps: Vec<LightStep>,
}

/// What the schedule wants right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTarget {
    /// Inside the on-window; carries the curve brightness.
    Inside(u8),
    /// Outside the on-window; lights should be off.
    Outside,
    /// Weekend with `weekdays_only` set; leave the strip alone.
    Skip,
}

// ---------------------------------------------------------------------------
// Pure schedule math
// ---------------------------------------------------------------------------

/// Brightness at `elapsed` into the on-window. An empty curve means full
/// brightness; before the first point the first point's value holds, past
/// the last point the last value holds, and between points the value is
/// linearly interpolated.
pub fn brightness_from_curve(curve: &[DimPoint], elapsed: Duration) -> u8 {
    if curve.is_empty() {
        return 255;
    }

    for (i, point) in curve.iter().enumerate() {
        if elapsed <= point.offset {
            if i == 0 {
                return point.brightness;
            }
            let prev = curve[i - 1];
            let span = point.offset.saturating_sub(prev.offset);
            if span.is_zero() {
                return prev.brightness;
            }
            let ratio = elapsed.saturating_sub(prev.offset).as_secs_f64() / span.as_secs_f64();
            let delta = f64::from(point.brightness) - f64::from(prev.brightness);
            return (f64::from(prev.brightness) + delta * ratio).clamp(0.0, 255.0) as u8;
        }
    }

    curve[curve.len() - 1].brightness
}

/// Evaluate the schedule against a wall-clock instant. Comparisons are done
/// in naive local time so a DST transition cannot make the window vanish.
pub fn schedule_target(schedule: &LightSchedule, now: DateTime<Local>) -> ScheduleTarget {
    if schedule.weekdays_only
        && matches!(now.weekday(), Weekday::Sat | Weekday::Sun)
    {
        return ScheduleTarget::Skip;
    }

    let now_naive = now.naive_local();
    let on = now.date_naive().and_time(schedule.on_time);
    let off = on + chrono::Duration::seconds(schedule.duration.as_secs() as i64);

    if now_naive >= on && now_naive < off {
        let elapsed = Duration::from_secs((now_naive - on).num_seconds().max(0) as u64);
        ScheduleTarget::Inside(brightness_from_curve(&schedule.dimming_curve, elapsed))
    } else {
        ScheduleTarget::Outside
    }
}

// ---------------------------------------------------------------------------
// LED strip hardware
// ---------------------------------------------------------------------------

/// 24 V LED strip: hardware PWM for dimming plus a driver-enable line.
struct LedStrip {
    pwm: PwmOutput,
    enable: DigitalOutput,
    brightness: u8,
}

impl LedStrip {
    fn new(pwm_channel: u8, enable_pin: u8, mock: bool) -> Result<Self> {
        Ok(Self {
            pwm: PwmOutput::new(pwm_channel, mock)?,
            enable: DigitalOutput::new(enable_pin, mock)?,
            brightness: 0,
        })
    }

    fn set_brightness(&mut self, brightness: u8) -> Result<()> {
        if brightness == 0 {
            self.enable.write(false)?;
            self.pwm.set_duty(0.0)?;
        } else {
            self.enable.write(true)?;
            self.pwm.set_duty(f64::from(brightness) / 255.0)?;
        }
        self.brightness = brightness;
        Ok(())
    }

    /// Simplified electrical model: 100 W at full brightness.
    fn power_watts(&self) -> f64 {
        f64::from(self.brightness) / 255.0 * 100.0
    }

    /// LED junction temperature estimate from dissipated power.
    fn temperature(&self) -> f64 {
        25.0 + self.power_watts() * 0.3
    }
}

// ---------------------------------------------------------------------------
// LightingSystem
// ---------------------------------------------------------------------------

struct LightingInner {
    strip: Option<LedStrip>,
    mode: LightingMode,
    current_program: Option<String>,
    schedule: LightSchedule,
    programs: BTreeMap<String, LightingProgram>,
    lit_since: Option<Instant>,
    runtime_total: Duration,
    /// Bumped by every direct brightness command; fades and programs carry
    /// the generation they were started under and stop once it is stale.
    generation: u64,
    checker_running: bool,
    initialized: bool,
}

impl Default for LightingInner {
    fn default() -> Self {
        Self {
            strip: None,
            mode: LightingMode::Manual,
            current_program: None,
            schedule: LightSchedule::default(),
            programs: default_programs(),
            lit_since: None,
            runtime_total: Duration::ZERO,
            generation: 0,
            checker_running: false,
            initialized: false,
        }
    }
}

pub struct LightingSystem {
    inner: Arc<RwLock<LightingInner>>,
    shutdown: watch::Sender<bool>,
    mock: bool,
}

impl LightingSystem {
    pub fn new(mock: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RwLock::new(LightingInner::default())),
            shutdown,
            mock,
        }
    }

    pub async fn initialize(&self, config: &Config) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.initialized {
            return Ok(());
        }

        inner.strip = Some(
            LedStrip::new(
                config.pins.strip_pwm_channel,
                config.pins.strip_enable,
                self.mock,
            )
            .map_err(|e| Error::Init {
                subsystem: "lighting",
                reason: format!("LED strip: {e}"),
            })?,
        );
        inner.initialized = true;
        drop(inner);

        self.spawn_monitor();
        info!(mock = self.mock, "lighting system initialized");
        Ok(())
    }

    /// Set brightness immediately, cancelling any fade or program in flight.
    pub async fn set_brightness(&self, brightness: u8) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.generation += 1;
        inner.current_program = None;
        Self::apply_brightness(&mut inner, brightness)
    }

    /// Turn the lights on; zero requests full brightness.
    pub async fn turn_on(&self, brightness: u8) -> Result<()> {
        let brightness = if brightness == 0 { 255 } else { brightness };
        self.set_brightness(brightness).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.set_brightness(0).await
    }

    /// Fade to `target` over `duration`. Returns once the fade is underway;
    /// a later brightness command cancels it mid-ramp.
    pub async fn fade_to(&self, target: u8, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.set_brightness(target).await;
        }

        let generation = {
            let mut inner = self.inner.write().await;
            if !inner.initialized {
                return Err(Error::NotInitialized);
            }
            inner.generation += 1;
            inner.current_program = None;
            inner.generation
        };

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            Self::run_fade(&inner, &mut shutdown, generation, target, duration).await;
        });
        Ok(())
    }

    /// Run a preset program in the background. Starting a second program
    /// (or issuing any direct brightness command) cancels the first.
    pub async fn start_program(&self, name: &str) -> Result<()> {
        let (generation, program) = {
            let mut inner = self.inner.write().await;
            if !inner.initialized {
                return Err(Error::NotInitialized);
            }
            let program = inner
                .programs
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownProgram(name.to_string()))?;
            inner.generation += 1;
            inner.current_program = Some(name.to_string());
            inner.mode = LightingMode::Manual;
            (inner.generation, program)
        };
        info!(program = name, "lighting program started");

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            for step in &program.steps {
                if !step.transition.is_zero() {
                    if !Self::run_fade(&inner, &mut shutdown, generation, step.brightness, step.transition).await {
                        return;
                    }
                } else {
                    let mut guard = inner.write().await;
                    if guard.generation != generation {
                        return;
                    }
                    if let Err(e) = Self::apply_brightness(&mut guard, step.brightness) {
                        warn!("program step failed: {e}");
                        return;
                    }
                }

                let hold = step.duration.saturating_sub(step.transition);
                if !hold.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(hold) => {}
                        _ = shutdown.changed() => return,
                    }
                    if inner.read().await.generation != generation {
                        return;
                    }
                }
            }

            let mut guard = inner.write().await;
            if guard.generation == generation {
                guard.current_program = None;
                debug!(program = %program.name, "lighting program finished");
            }
        });
        Ok(())
    }

    /// Switch operating mode. Scheduled mode enables the schedule and its
    /// checker; manual mode disables both. Automatic mode is not available.
    pub async fn set_mode(&self, mode: LightingMode) -> Result<()> {
        let start_checker = {
            let mut inner = self.inner.write().await;
            if !inner.initialized {
                return Err(Error::NotInitialized);
            }
            match mode {
                LightingMode::Automatic => return Err(Error::UnsupportedMode),
                LightingMode::Scheduled => {
                    inner.mode = mode;
                    inner.schedule.enabled = true;
                    let start = !inner.checker_running;
                    inner.checker_running = true;
                    start
                }
                LightingMode::Manual => {
                    inner.mode = mode;
                    inner.schedule.enabled = false;
                    inner.checker_running = false;
                    false
                }
            }
        };

        if start_checker {
            self.spawn_schedule_checker();
        }
        info!(?mode, "lighting mode set");
        Ok(())
    }

    pub async fn update_schedule(&self, schedule: LightSchedule) -> Result<()> {
        if schedule
            .dimming_curve
            .windows(2)
            .any(|pair| pair[0].offset > pair[1].offset)
        {
            return Err(Error::Config(
                "dimming curve offsets must be non-decreasing".into(),
            ));
        }

        let start_checker = {
            let mut inner = self.inner.write().await;
            if !inner.initialized {
                return Err(Error::NotInitialized);
            }
            let need = inner.mode == LightingMode::Scheduled
                && schedule.enabled
                && !inner.checker_running;
            inner.schedule = schedule;
            if need {
                inner.checker_running = true;
            }
            need
        };

        if start_checker {
            self.spawn_schedule_checker();
        }
        info!("lighting schedule updated");
        Ok(())
    }

    pub async fn get_status(&self) -> LightingStatus {
        let inner = self.inner.read().await;
        let runtime = inner.runtime_total
            + inner
                .lit_since
                .map_or(Duration::ZERO, |since| since.elapsed());

        LightingStatus {
            is_on: inner.strip.as_ref().is_some_and(|s| s.brightness > 0),
            brightness: inner.strip.as_ref().map_or(0, |s| s.brightness),
            mode: inner.mode,
            current_program: inner.current_program.clone(),
            power_watts: inner.strip.as_ref().map_or(0.0, |s| s.power_watts()),
            temperature: inner.strip.as_ref().map_or(0.0, |s| s.temperature()),
            runtime,
            schedule: inner.schedule.clone(),
        }
    }

    pub async fn get_programs(&self) -> Vec<LightingProgram> {
        self.inner.read().await.programs.values().cloned().collect()
    }

    /// Turn the strip off and release the hardware. Safe to call twice.
    pub async fn cleanup(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let mut inner = self.inner.write().await;
        if !inner.initialized {
            return Ok(());
        }
        let result = Self::apply_brightness(&mut inner, 0);
        *inner = LightingInner::default();
        debug!("lighting system cleaned up");
        result
    }

    // -- internals ---------------------------------------------------------

    /// Drive the strip and keep the on-time ledger. Does not touch the
    /// generation counter; callers decide whether they are cancelling.
    fn apply_brightness(inner: &mut LightingInner, brightness: u8) -> Result<()> {
        let strip = inner.strip.as_mut().ok_or(Error::NotInitialized)?;
        strip.set_brightness(brightness)?;

        if brightness > 0 {
            if inner.lit_since.is_none() {
                inner.lit_since = Some(Instant::now());
            }
        } else if let Some(since) = inner.lit_since.take() {
            inner.runtime_total += since.elapsed();
        }
        Ok(())
    }

    /// Step a fade to `target` over `duration`, bailing out if the
    /// generation goes stale or shutdown is signalled. Returns whether the
    /// fade ran to completion.
    async fn run_fade(
        inner: &Arc<RwLock<LightingInner>>,
        shutdown: &mut watch::Receiver<bool>,
        generation: u64,
        target: u8,
        duration: Duration,
    ) -> bool {
        let from = {
            let guard = inner.read().await;
            if guard.generation != generation {
                return false;
            }
            guard.strip.as_ref().map_or(0, |s| s.brightness)
        };

        let step_duration = duration / FADE_STEPS;
        let step_size = (f64::from(target) - f64::from(from)) / f64::from(FADE_STEPS);

        for i in 1..=FADE_STEPS {
            tokio::select! {
                _ = tokio::time::sleep(step_duration) => {}
                _ = shutdown.changed() => return false,
            }

            let mut guard = inner.write().await;
            if guard.generation != generation {
                return false;
            }
            let value = (f64::from(from) + step_size * f64::from(i)).clamp(0.0, 255.0) as u8;
            if let Err(e) = Self::apply_brightness(&mut guard, value) {
                warn!("fade step failed: {e}");
                return false;
            }
        }

        // Land exactly on target regardless of rounding.
        let mut guard = inner.write().await;
        if guard.generation != generation {
            return false;
        }
        if let Err(e) = Self::apply_brightness(&mut guard, target) {
            warn!("fade completion failed: {e}");
            return false;
        }
        true
    }

    /// Persistent checker: one interval task that evaluates the schedule
    /// every minute and exits when scheduled mode is left.
    fn spawn_schedule_checker(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut guard = inner.write().await;
                        if !guard.checker_running {
                            break;
                        }
                        if !guard.schedule.enabled {
                            continue;
                        }

                        let current = guard.strip.as_ref().map_or(0, |s| s.brightness);
                        match schedule_target(&guard.schedule, Local::now()) {
                            ScheduleTarget::Inside(brightness) if brightness != current => {
                                guard.generation += 1;
                                if let Err(e) = Self::apply_brightness(&mut guard, brightness) {
                                    warn!("scheduled brightness failed: {e}");
                                }
                            }
                            ScheduleTarget::Outside if current > 0 => {
                                guard.generation += 1;
                                if let Err(e) = Self::apply_brightness(&mut guard, 0) {
                                    warn!("scheduled off failed: {e}");
                                }
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("lighting schedule checker stopped");
        });
    }

    fn spawn_monitor(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let guard = inner.read().await;
                        if !guard.initialized {
                            break;
                        }
                        if let Some(strip) = guard.strip.as_ref() {
                            debug!(
                                brightness = strip.brightness,
                                power_watts = strip.power_watts(),
                                temperature = strip.temperature(),
                                "lighting monitor"
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

fn default_programs() -> BTreeMap<String, LightingProgram> {
    let min = |m: u64| Duration::from_secs(m * 60);
    let hour = |h: u64| Duration::from_secs(h * 3600);
    let step = |duration: Duration, brightness: u8, transition: Duration| LightStep {
        duration,
        brightness,
        transition,
    };

    let mut programs = BTreeMap::new();
    programs.insert(
        "sunrise".to_string(),
        LightingProgram {
            name: "Sunrise".into(),
            description: "Gradual sunrise simulation over 30 minutes".into(),
            duration: min(30),
            steps: vec![
                step(min(5), 0, Duration::ZERO),
                step(min(10), 50, min(5)),
                step(min(10), 150, min(5)),
                step(min(5), 255, min(5)),
            ],
        },
    );
    programs.insert(
        "sunset".to_string(),
        LightingProgram {
            name: "Sunset".into(),
            description: "Gradual sunset simulation over 30 minutes".into(),
            duration: min(30),
            steps: vec![
                step(min(5), 255, Duration::ZERO),
                step(min(10), 150, min(5)),
                step(min(10), 50, min(5)),
                step(min(5), 0, min(5)),
            ],
        },
    );
    programs.insert(
        "growth".to_string(),
        LightingProgram {
            name: "Growth Cycle".into(),
            description: "14-hour growth lighting with natural dimming curve".into(),
            duration: hour(14),
            steps: vec![
                step(hour(1), 100, min(30)),
                step(hour(6), 255, min(30)),
                step(hour(6), 200, hour(1)),
                step(hour(1), 0, min(30)),
            ],
        },
    );
    programs.insert(
        "test".to_string(),
        LightingProgram {
            name: "Test".into(),
            description: "Quick brightness test cycle".into(),
            duration: min(2),
            steps: vec![
                step(Duration::from_secs(30), 255, Duration::from_secs(5)),
                step(Duration::from_secs(30), 128, Duration::from_secs(5)),
                step(Duration::from_secs(30), 64, Duration::from_secs(5)),
                step(Duration::from_secs(30), 0, Duration::from_secs(5)),
            ],
        },
    );
    programs
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn system() -> LightingSystem {
        let system = LightingSystem::new(true);
        system.initialize(&Config::default()).await.unwrap();
        system
    }

    fn hour(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    // -- Dimming curve -----------------------------------------------------

    #[test]
    fn empty_curve_is_full_brightness() {
        assert_eq!(brightness_from_curve(&[], hour(3)), 255);
    }

    #[test]
    fn curve_start_uses_first_point() {
        let curve = LightSchedule::default().dimming_curve;
        assert_eq!(brightness_from_curve(&curve, Duration::ZERO), 50);
    }

    #[test]
    fn curve_interpolates_between_points() {
        let curve = LightSchedule::default().dimming_curve;
        // Halfway up the 50→255 ramp.
        let b = brightness_from_curve(&curve, Duration::from_secs(1800));
        assert!((151..=153).contains(&b), "got {b}");
    }

    #[test]
    fn curve_plateau_holds() {
        let curve = LightSchedule::default().dimming_curve;
        assert_eq!(brightness_from_curve(&curve, hour(5)), 255);
        assert_eq!(brightness_from_curve(&curve, hour(10)), 255);
    }

    #[test]
    fn curve_past_end_uses_last_point() {
        let curve = LightSchedule::default().dimming_curve;
        assert_eq!(brightness_from_curve(&curve, hour(13)), 0);
    }

    // -- Schedule window ---------------------------------------------------

    #[test]
    fn schedule_inside_window() {
        let mut schedule = LightSchedule::default();
        schedule.enabled = true;
        // Monday 10:00, two hours into the window: plateau brightness.
        let now = Local.with_ymd_and_hms(2026, 8, 31, 10, 0, 0).unwrap();
        assert_eq!(schedule_target(&schedule, now), ScheduleTarget::Inside(255));
    }

    #[test]
    fn schedule_outside_window() {
        let schedule = LightSchedule::default();
        let now = Local.with_ymd_and_hms(2026, 8, 31, 22, 0, 0).unwrap();
        assert_eq!(schedule_target(&schedule, now), ScheduleTarget::Outside);
    }

    #[test]
    fn schedule_skips_weekends_when_asked() {
        let mut schedule = LightSchedule::default();
        schedule.weekdays_only = true;
        // Saturday noon.
        let now = Local.with_ymd_and_hms(2026, 8, 29, 12, 0, 0).unwrap();
        assert_eq!(schedule_target(&schedule, now), ScheduleTarget::Skip);

        schedule.weekdays_only = false;
        assert!(matches!(
            schedule_target(&schedule, now),
            ScheduleTarget::Inside(_)
        ));
    }

    // -- System behaviour --------------------------------------------------

    #[tokio::test]
    async fn on_off_and_power_model() {
        let system = system().await;
        system.turn_on(0).await.unwrap();

        let status = system.get_status().await;
        assert!(status.is_on);
        assert_eq!(status.brightness, 255);
        assert_eq!(status.power_watts, 100.0);
        assert_eq!(status.temperature, 55.0);

        system.turn_off().await.unwrap();
        let status = system.get_status().await;
        assert!(!status.is_on);
        assert_eq!(status.power_watts, 0.0);
        assert_eq!(status.temperature, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_accumulates_while_on() {
        let system = system().await;
        system.turn_on(128).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        system.turn_off().await.unwrap();

        let status = system.get_status().await;
        assert!(status.runtime >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn unknown_program_rejected() {
        let system = system().await;
        match system.start_program("disco").await {
            Err(Error::UnknownProgram(name)) => assert_eq!(name, "disco"),
            other => panic!("expected UnknownProgram, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn automatic_mode_rejected() {
        let system = system().await;
        assert!(matches!(
            system.set_mode(LightingMode::Automatic).await,
            Err(Error::UnsupportedMode)
        ));
        // Mode is unchanged after the rejection.
        assert_eq!(system.get_status().await.mode, LightingMode::Manual);
    }

    #[tokio::test]
    async fn scheduled_mode_enables_schedule() {
        let system = system().await;
        system.set_mode(LightingMode::Scheduled).await.unwrap();
        assert!(system.get_status().await.schedule.enabled);

        system.set_mode(LightingMode::Manual).await.unwrap();
        assert!(!system.get_status().await.schedule.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_reaches_target() {
        let system = system().await;
        system
            .fade_to(200, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(system.get_status().await.brightness, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_command_cancels_fade() {
        let system = system().await;
        system
            .fade_to(255, Duration::from_secs(10))
            .await
            .unwrap();
        system.set_brightness(10).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(system.get_status().await.brightness, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn program_runs_to_completion() {
        let system = system().await;
        system.start_program("test").await.unwrap();
        assert_eq!(
            system.get_status().await.current_program.as_deref(),
            Some("test")
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        let status = system.get_status().await;
        assert_eq!(status.brightness, 0);
        assert!(status.current_program.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_program_supersedes_first() {
        let system = system().await;
        system.start_program("growth").await.unwrap();
        system.start_program("test").await.unwrap();

        tokio::time::sleep(Duration::from_secs(150)).await;
        let status = system.get_status().await;
        // "test" ends dark; "growth" at this point would be mid-ramp.
        assert_eq!(status.brightness, 0);
        assert!(status.current_program.is_none());
    }

    #[tokio::test]
    async fn unordered_curve_rejected() {
        let system = system().await;
        let mut schedule = LightSchedule::default();
        schedule.dimming_curve.swap(1, 3);
        assert!(matches!(
            system.update_schedule(schedule).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn presets_present() {
        let system = system().await;
        let programs = system.get_programs().await;
        let names: Vec<&str> = programs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(programs.len(), 4);
        assert!(names.contains(&"Sunrise"));
        assert!(names.contains(&"Sunset"));
        assert!(names.contains(&"Growth Cycle"));
        assert!(names.contains(&"Test"));
    }

    #[tokio::test]
    async fn cleanup_turns_off_and_is_idempotent() {
        let system = system().await;
        system.turn_on(200).await.unwrap();
        system.cleanup().await.unwrap();
        system.cleanup().await.unwrap();
        assert!(matches!(
            system.set_brightness(10).await,
            Err(Error::NotInitialized)
        ));
    }
}

//! GPIO, PWM, and serial-bus primitives with a runtime mock path.
//!
//! Every primitive is an enum over a mock variant (in-memory state, always
//! available) and a real variant backed by rppal, gated behind the
//! `hardware` feature. Mock mode is selected per device at construction so
//! the full control flow runs unchanged without a Raspberry Pi; only the
//! underlying I/O differs. Asking for a real device in a build without the
//! feature is an error, never a silent fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};

#[cfg(feature = "hardware")]
use rppal::{
    gpio::{Gpio, InputPin, IoPin, Mode, Trigger},
    i2c::I2c,
    pwm::{Channel, Polarity, Pwm},
    spi::{Bus, Mode as SpiMode, SlaveSelect, Spi},
};

/// Shared MCP3008 handle. The SPI bus carries several sensor channels and is
/// not safe for concurrent transactions; this lock is dedicated to bus
/// access and distinct from every subsystem's status lock.
pub type SharedAdc = Arc<Mutex<SpiAdc>>;

/// Shared I2C bus handle (light sensor + OLED panel), same locking rule.
pub type SharedI2c = Arc<Mutex<I2cBus>>;

/// Lock a shared bus, mapping poisoning to a device error instead of
/// panicking in a control path.
pub fn lock_bus<T>(bus: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    bus.lock()
        .map_err(|_| Error::Device("bus lock poisoned".into()))
}

// ---------------------------------------------------------------------------
// Digital output (pump relay, valves, status LEDs, strip enable)
// ---------------------------------------------------------------------------

pub enum DigitalOutput {
    Mock { pin: u8, high: bool },
    #[cfg(feature = "hardware")]
    Real(rppal::gpio::OutputPin),
}

impl DigitalOutput {
    /// Claim `pin` as an output, driven low. Everything wired to these
    /// lines is active-high, so low is the fail-safe "off" state.
    pub fn new(pin: u8, mock: bool) -> Result<Self> {
        if mock {
            tracing::debug!(pin, "mock gpio output registered");
            return Ok(Self::Mock { pin, high: false });
        }

        #[cfg(feature = "hardware")]
        {
            let mut out = Gpio::new()?.get(pin)?.into_output();
            out.set_low();
            Ok(Self::Real(out))
        }
        #[cfg(not(feature = "hardware"))]
        Err(Error::HardwareUnavailable)
    }

    pub fn write(&mut self, high: bool) -> Result<()> {
        match self {
            Self::Mock { pin, high: state } => {
                *state = high;
                tracing::trace!(pin = *pin, high, "mock gpio write");
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Self::Real(out) => {
                if high {
                    out.set_high();
                } else {
                    out.set_low();
                }
                Ok(())
            }
        }
    }

    pub fn is_high(&self) -> bool {
        match self {
            Self::Mock { high, .. } => *high,
            #[cfg(feature = "hardware")]
            Self::Real(out) => out.is_set_high(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hardware PWM (LED strip brightness)
// ---------------------------------------------------------------------------

pub enum PwmOutput {
    Mock { duty: f64, enabled: bool },
    #[cfg(feature = "hardware")]
    Real(Pwm),
}

impl PwmOutput {
    /// 1 kHz carrier, matching the LED driver's rated dimming frequency.
    pub const FREQUENCY_HZ: f64 = 1000.0;

    /// `channel` is the SoC PWM channel index (0 = GPIO 18, 1 = GPIO 19).
    pub fn new(channel: u8, mock: bool) -> Result<Self> {
        if mock {
            tracing::debug!(channel, "mock pwm channel registered");
            return Ok(Self::Mock {
                duty: 0.0,
                enabled: false,
            });
        }

        #[cfg(feature = "hardware")]
        {
            let ch = match channel {
                0 => Channel::Pwm0,
                1 => Channel::Pwm1,
                other => {
                    return Err(Error::Device(format!("invalid PWM channel: {other}")));
                }
            };
            let pwm = Pwm::with_frequency(ch, Self::FREQUENCY_HZ, 0.0, Polarity::Normal, false)?;
            Ok(Self::Real(pwm))
        }
        #[cfg(not(feature = "hardware"))]
        Err(Error::HardwareUnavailable)
    }

    /// Set the duty cycle in `[0.0, 1.0]`. Zero disables the output
    /// entirely rather than idling the carrier.
    pub fn set_duty(&mut self, duty: f64) -> Result<()> {
        let duty = duty.clamp(0.0, 1.0);
        match self {
            Self::Mock {
                duty: state,
                enabled,
            } => {
                *state = duty;
                *enabled = duty > 0.0;
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Self::Real(pwm) => {
                if duty > 0.0 {
                    pwm.set_duty_cycle(duty)?;
                    pwm.enable()?;
                } else {
                    pwm.set_duty_cycle(0.0)?;
                    pwm.disable()?;
                }
                Ok(())
            }
        }
    }

    pub fn duty(&self) -> f64 {
        match self {
            Self::Mock { duty, .. } => *duty,
            #[cfg(feature = "hardware")]
            Self::Real(pwm) => pwm.duty_cycle().unwrap_or(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Falling-edge pulse counter (flow sensor)
// ---------------------------------------------------------------------------

/// Counts falling edges on an input line. The real variant hooks an async
/// GPIO interrupt that bumps an atomic; the sampling task drains it with
/// [`PulseCounter::take`] so no edge is lost between samples.
pub enum PulseCounter {
    Mock {
        count: Arc<AtomicU64>,
    },
    #[cfg(feature = "hardware")]
    Real {
        // Held so the interrupt registration stays alive.
        _pin: InputPin,
        count: Arc<AtomicU64>,
    },
}

impl PulseCounter {
    pub fn new(pin: u8, mock: bool) -> Result<Self> {
        let count = Arc::new(AtomicU64::new(0));
        if mock {
            tracing::debug!(pin, "mock pulse counter registered");
            return Ok(Self::Mock { count });
        }

        #[cfg(feature = "hardware")]
        {
            let mut input = Gpio::new()?.get(pin)?.into_input_pullup();
            let edges = Arc::clone(&count);
            input.set_async_interrupt(Trigger::FallingEdge, move |_| {
                edges.fetch_add(1, Ordering::Relaxed);
            })?;
            Ok(Self::Real { _pin: input, count })
        }
        #[cfg(not(feature = "hardware"))]
        Err(Error::HardwareUnavailable)
    }

    /// Drain and return the pulses accumulated since the last call.
    pub fn take(&self) -> u64 {
        match self {
            Self::Mock { count } => count.swap(0, Ordering::Relaxed),
            #[cfg(feature = "hardware")]
            Self::Real { count, .. } => count.swap(0, Ordering::Relaxed),
        }
    }

    /// Inject synthetic pulses (mock flow model and tests only).
    pub fn inject(&self, pulses: u64) {
        match self {
            Self::Mock { count } => {
                count.fetch_add(pulses, Ordering::Relaxed);
            }
            #[cfg(feature = "hardware")]
            Self::Real { count, .. } => {
                count.fetch_add(pulses, Ordering::Relaxed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bidirectional line (DHT22 single-wire handshake)
// ---------------------------------------------------------------------------

pub enum IoLine {
    Mock { pin: u8 },
    #[cfg(feature = "hardware")]
    Real(IoPin),
}

impl IoLine {
    pub fn new(pin: u8, mock: bool) -> Result<Self> {
        if mock {
            return Ok(Self::Mock { pin });
        }

        #[cfg(feature = "hardware")]
        {
            let io = Gpio::new()?.get(pin)?.into_io(Mode::Output);
            Ok(Self::Real(io))
        }
        #[cfg(not(feature = "hardware"))]
        Err(Error::HardwareUnavailable)
    }

    /// Drive the line low for `low`, release it high for `high`, then leave
    /// it in input mode. This is the DHT22 start-signal shape; the sensor's
    /// reply follows on the same wire.
    pub fn pulse_low_high(&mut self, low: Duration, high: Duration) -> Result<()> {
        match self {
            Self::Mock { pin } => {
                tracing::trace!(pin = *pin, ?low, ?high, "mock start pulse");
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Self::Real(io) => {
                io.set_mode(Mode::Output);
                io.set_low();
                std::thread::sleep(low);
                io.set_high();
                std::thread::sleep(high);
                io.set_mode(Mode::Input);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// I2C bus (TSL2591 light sensor + SSD1306 panel)
// ---------------------------------------------------------------------------

pub enum I2cBus {
    Mock,
    #[cfg(feature = "hardware")]
    Real(I2c),
}

impl I2cBus {
    pub fn open(mock: bool) -> Result<Self> {
        if mock {
            tracing::debug!("mock i2c bus opened");
            return Ok(Self::Mock);
        }

        #[cfg(feature = "hardware")]
        {
            Ok(Self::Real(I2c::new()?))
        }
        #[cfg(not(feature = "hardware"))]
        Err(Error::HardwareUnavailable)
    }

    pub fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Mock => Ok(()),
            #[cfg(feature = "hardware")]
            Self::Real(i2c) => {
                i2c.set_slave_address(addr)?;
                i2c.write(bytes)?;
                Ok(())
            }
        }
    }

    pub fn write_read(&mut self, addr: u16, cmd: &[u8], buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Mock => {
                buf.fill(0);
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Self::Real(i2c) => {
                i2c.set_slave_address(addr)?;
                i2c.write_read(cmd, buf)?;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MCP3008 10-bit ADC over SPI (soil, pH/EC, water level)
// ---------------------------------------------------------------------------

pub enum SpiAdc {
    Mock,
    #[cfg(feature = "hardware")]
    Real(Spi),
}

/// Highest single-ended channel index on the MCP3008.
pub const ADC_MAX_CHANNEL: u8 = 7;

impl SpiAdc {
    /// Open SPI0/CE0 at 1 MHz, mode 0 — the MCP3008 wiring on this board.
    pub fn open(mock: bool) -> Result<Self> {
        if mock {
            tracing::debug!("mock spi adc opened");
            return Ok(Self::Mock);
        }

        #[cfg(feature = "hardware")]
        {
            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_000_000, SpiMode::Mode0)?;
            Ok(Self::Real(spi))
        }
        #[cfg(not(feature = "hardware"))]
        Err(Error::HardwareUnavailable)
    }

    /// Single-ended 10-bit conversion on `channel` (0–7).
    ///
    /// Mock reads return 0; mock sensors synthesize values before they
    /// reach the bus, so this path only runs against real silicon.
    pub fn read_channel(&mut self, channel: u8) -> Result<u16> {
        if channel > ADC_MAX_CHANNEL {
            return Err(Error::Device(format!("invalid MCP3008 channel: {channel}")));
        }

        match self {
            Self::Mock => Ok(0),
            #[cfg(feature = "hardware")]
            Self::Real(spi) => {
                // Start bit, single-ended + channel select, clock-out byte.
                let tx = [0x01, 0x80 | (channel << 4), 0x00];
                let mut rx = [0u8; 3];
                spi.transfer(&mut rx, &tx)?;
                Ok((u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2]))
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digital_output_starts_low() {
        let out = DigitalOutput::new(20, true).unwrap();
        assert!(!out.is_high());
    }

    #[test]
    fn digital_output_tracks_writes() {
        let mut out = DigitalOutput::new(21, true).unwrap();
        out.write(true).unwrap();
        assert!(out.is_high());
        out.write(false).unwrap();
        assert!(!out.is_high());
    }

    #[test]
    fn pwm_duty_clamped_and_tracked() {
        let mut pwm = PwmOutput::new(0, true).unwrap();
        pwm.set_duty(1.5).unwrap();
        assert_eq!(pwm.duty(), 1.0);
        pwm.set_duty(-0.2).unwrap();
        assert_eq!(pwm.duty(), 0.0);
    }

    #[test]
    fn pulse_counter_take_drains() {
        let counter = PulseCounter::new(17, true).unwrap();
        counter.inject(15);
        assert_eq!(counter.take(), 15);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn adc_rejects_out_of_range_channel() {
        let mut adc = SpiAdc::open(true).unwrap();
        assert!(adc.read_channel(8).is_err());
        assert_eq!(adc.read_channel(7).unwrap(), 0);
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn real_devices_unavailable_without_feature() {
        assert!(matches!(
            DigitalOutput::new(20, false),
            Err(Error::HardwareUnavailable)
        ));
        assert!(matches!(SpiAdc::open(false), Err(Error::HardwareUnavailable)));
    }
}

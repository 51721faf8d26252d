//! GPIO port abstraction
//!
//! The sampler talks to pins through the [`GpioPort`] trait so boards without
//! a wired backend (development hosts, unit tests) run against [`NullGpio`],
//! which reads 0 and swallows writes.

/// Physical pins carrying the board's controls, in control-index order.
pub const PIN_MAP: [u8; 3] = [40, 38, 36];

/// Pin modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    PwmOutput,
    GpioClock,
}

/// Pin pull modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    Up,
    Down,
}

/// Digital/analog pin access.
pub trait GpioPort: Send {
    fn set_pin_mode(&mut self, pin: u8, mode: PinMode);

    fn set_pull_mode(&mut self, pin: u8, mode: PullMode);

    /// Read a digital pin, 0 or 1.
    fn digital_read(&mut self, pin: u8) -> u8;

    fn digital_write(&mut self, pin: u8, value: u8);

    fn analog_read(&mut self, pin: u8) -> i32;

    fn analog_write(&mut self, pin: u8, value: i32);

    fn pwm_write(&mut self, pin: u8, value: i32);
}

/// No-hardware shim: reads return 0, writes are dropped.
#[derive(Default)]
pub struct NullGpio;

impl NullGpio {
    pub fn new() -> Self {
        NullGpio
    }
}

impl GpioPort for NullGpio {
    fn set_pin_mode(&mut self, _pin: u8, _mode: PinMode) {}

    fn set_pull_mode(&mut self, _pin: u8, _mode: PullMode) {}

    fn digital_read(&mut self, _pin: u8) -> u8 {
        0
    }

    fn digital_write(&mut self, _pin: u8, _value: u8) {}

    fn analog_read(&mut self, _pin: u8) -> i32 {
        0
    }

    fn analog_write(&mut self, _pin: u8, _value: i32) {}

    fn pwm_write(&mut self, _pin: u8, _value: i32) {}
}

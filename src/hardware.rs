//! Hardware module: input sampling
//!
//! Samples the board's controls once per tick and turns level changes into
//! [`InputEvent`]s. All mapped pins are buttons wired active-low against a
//! pull-up, so a pressed pad reads 0 on the pin and is reported as 1.
//!
//! The event queue is emptied at the start of every connected tick and
//! consumed by the network module later in the same tick.

use std::time::Duration;

use crate::gpio::{GpioPort, PinMode, PullMode, PIN_MAP};
use crate::protocol::InputEvent;
use crate::scheduler::State;

/// Cadence of the hardware discovery hook.
pub const HARDWARE_DISCOVERY_RATE: Duration = Duration::from_secs(1);

/// Kinds of control a pin can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Button,
}

/// Last observed state of one control.
#[derive(Debug, Clone, Copy)]
pub struct Control {
    pub kind: ControlKind,
    pub value: u8,
}

/// Board module responsible for hardware sampling.
pub struct HardwareModule {
    gpio: Box<dyn GpioPort>,
    controls: Vec<Control>,
    events: Vec<InputEvent>,
}

impl HardwareModule {
    /// Build the sampler and configure every mapped pin as a pulled-up
    /// input.
    pub fn new(mut gpio: Box<dyn GpioPort>) -> Self {
        for &pin in PIN_MAP.iter() {
            gpio.set_pin_mode(pin, PinMode::Input);
            gpio.set_pull_mode(pin, PullMode::Up);
        }
        HardwareModule {
            gpio,
            controls: vec![
                Control {
                    kind: ControlKind::Button,
                    value: 0,
                };
                PIN_MAP.len()
            ],
            events: Vec::with_capacity(PIN_MAP.len()),
        }
    }

    pub fn discovery_rate(&self) -> Duration {
        HARDWARE_DISCOVERY_RATE
    }

    /// Number of controls on this board.
    pub fn control_count(&self) -> usize {
        self.controls.len()
    }

    /// Events sampled by the latest tick.
    pub fn input_events(&self) -> &[InputEvent] {
        &self.events
    }

    /// Sample every control and queue an event per level change.
    pub fn tick(&mut self, state: State) {
        if state != State::Connected {
            return;
        }
        self.events.clear();
        for (index, &pin) in PIN_MAP.iter().enumerate() {
            // Pull-up wiring: pressed pulls the pin low.
            let value = if self.gpio.digital_read(pin) == 0 { 1 } else { 0 };
            let control = &mut self.controls[index];
            if value == control.value {
                continue;
            }
            control.value = value;
            self.events.push(InputEvent {
                index: index as u8,
                value,
            });
        }
    }

    /// Discovery hook, reserved for hardware that needs periodic probing.
    pub fn discover(&mut self, state: State) {
        if state != State::Connected {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Scripted pin levels for hardware-free sampling tests.
    #[derive(Clone, Default)]
    struct ScriptedGpio {
        inner: Arc<Mutex<ScriptedGpioInner>>,
    }

    #[derive(Default)]
    struct ScriptedGpioInner {
        levels: HashMap<u8, u8>,
        input_pins: Vec<u8>,
        pulled_up_pins: Vec<u8>,
    }

    impl ScriptedGpio {
        fn set_level(&self, pin: u8, level: u8) {
            self.inner.lock().unwrap().levels.insert(pin, level);
        }

        fn input_pins(&self) -> Vec<u8> {
            self.inner.lock().unwrap().input_pins.clone()
        }

        fn pulled_up_pins(&self) -> Vec<u8> {
            self.inner.lock().unwrap().pulled_up_pins.clone()
        }
    }

    impl GpioPort for ScriptedGpio {
        fn set_pin_mode(&mut self, pin: u8, mode: PinMode) {
            if mode == PinMode::Input {
                self.inner.lock().unwrap().input_pins.push(pin);
            }
        }

        fn set_pull_mode(&mut self, pin: u8, mode: PullMode) {
            if mode == PullMode::Up {
                self.inner.lock().unwrap().pulled_up_pins.push(pin);
            }
        }

        fn digital_read(&mut self, pin: u8) -> u8 {
            // Idle pull-up level is high.
            self.inner.lock().unwrap().levels.get(&pin).copied().unwrap_or(1)
        }

        fn digital_write(&mut self, _pin: u8, _value: u8) {}

        fn analog_read(&mut self, _pin: u8) -> i32 {
            0
        }

        fn analog_write(&mut self, _pin: u8, _value: i32) {}

        fn pwm_write(&mut self, _pin: u8, _value: i32) {}
    }

    #[test]
    fn test_construction_configures_all_pins() {
        let gpio = ScriptedGpio::default();
        let module = HardwareModule::new(Box::new(gpio.clone()));
        assert_eq!(module.control_count(), PIN_MAP.len());
        assert_eq!(gpio.input_pins(), PIN_MAP.to_vec());
        assert_eq!(gpio.pulled_up_pins(), PIN_MAP.to_vec());
    }

    #[test]
    fn test_tick_is_gated_on_connection() {
        let gpio = ScriptedGpio::default();
        gpio.set_level(PIN_MAP[0], 0);
        let mut module = HardwareModule::new(Box::new(gpio));
        module.tick(State::Disconnected);
        assert!(module.input_events().is_empty());
    }

    #[test]
    fn test_press_and_release_produce_edges() {
        let gpio = ScriptedGpio::default();
        let mut module = HardwareModule::new(Box::new(gpio.clone()));

        // Idle high reads as released, matching the initial control state.
        module.tick(State::Connected);
        assert!(module.input_events().is_empty());

        gpio.set_level(PIN_MAP[1], 0);
        module.tick(State::Connected);
        assert_eq!(module.input_events(), &[InputEvent { index: 1, value: 1 }]);

        // Held: level unchanged, no further event.
        module.tick(State::Connected);
        assert!(module.input_events().is_empty());

        gpio.set_level(PIN_MAP[1], 1);
        module.tick(State::Connected);
        assert_eq!(module.input_events(), &[InputEvent { index: 1, value: 0 }]);
    }

    #[test]
    fn test_simultaneous_edges_report_in_pin_order() {
        let gpio = ScriptedGpio::default();
        let mut module = HardwareModule::new(Box::new(gpio.clone()));
        module.tick(State::Connected);

        gpio.set_level(PIN_MAP[0], 0);
        gpio.set_level(PIN_MAP[2], 0);
        module.tick(State::Connected);
        assert_eq!(
            module.input_events(),
            &[
                InputEvent { index: 0, value: 1 },
                InputEvent { index: 2, value: 1 },
            ]
        );
    }
}

//! Scheduler: single-threaded cooperative driver for all modules
//!
//! One thread owns the hardware and network modules and runs them off two
//! independent cadences: a fast tick for sampling and the network pipeline,
//! and a per-module discovery period for beaconing and election. The loop
//! polls a shared atomic run flag; `main` binds SIGINT to the same flag so a
//! signal and [`Scheduler::stop`] take the identical path.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ConfigTable;
use crate::error::Result;
use crate::gpio::{GpioPort, NullGpio};
use crate::hardware::HardwareModule;
use crate::network::NetworkModule;

/// Path of the configuration file when `--config-path` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "Config.conf";

/// Default tick period.
pub const DEFAULT_TICK_RATE: Duration = Duration::from_nanos(10_000);

/// Global connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connected,
}

/// Connection state and tick period, owned by the scheduler and handed to
/// the modules each cycle.
pub struct SchedulerCache {
    state: State,
    tick_rate: Duration,
}

impl SchedulerCache {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        if self.state != state {
            log::info!("connection state: {:?}", state);
        }
        self.state = state;
    }

    pub fn tick_rate(&self) -> Duration {
        self.tick_rate
    }
}

/// The scheduler coordinates each module in time. Not thread safe beyond
/// its run flag.
pub struct Scheduler {
    cache: SchedulerCache,
    hardware: HardwareModule,
    network: NetworkModule,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    /// Build the scheduler from program arguments. Only `--config-path` is
    /// recognised.
    pub fn new(arguments: Vec<String>) -> Result<Self> {
        Self::with_gpio(arguments, Box::new(NullGpio::new()))
    }

    /// Build the scheduler against a specific GPIO backend.
    pub fn with_gpio(arguments: Vec<String>, gpio: Box<dyn GpioPort>) -> Result<Self> {
        let config_path = config_path_from_arguments(&arguments);
        let config = if Path::new(config_path).exists() {
            let config = ConfigTable::load(config_path)?;
            log::info!("loaded {} from {}", config, config_path);
            config
        } else {
            log::warn!("config file {} not found, using defaults", config_path);
            ConfigTable::default()
        };

        Ok(Scheduler {
            cache: SchedulerCache {
                state: State::Disconnected,
                tick_rate: DEFAULT_TICK_RATE,
            },
            hardware: HardwareModule::new(gpio),
            network: NetworkModule::new(&config)?,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn state(&self) -> State {
        self.cache.state()
    }

    /// Shared run flag, for wiring a signal handler to the loop.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Clear the run flag; the loop exits at its next iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Run in blocking mode until the run flag clears.
    pub fn run(&mut self) {
        log::info!("board running");

        let Scheduler {
            cache,
            hardware,
            network,
            running,
        } = self;

        let mut last_tick: Option<Instant> = None;
        let mut last_hardware_discovery: Option<Instant> = None;
        let mut last_network_discovery: Option<Instant> = None;

        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            let mut worked = false;

            // Per-module discovery cadence.
            if due(&mut last_hardware_discovery, hardware.discovery_rate(), now) {
                hardware.discover(cache.state());
                worked = true;
            }
            if due(&mut last_network_discovery, network.discovery_rate(), now) {
                network.discover(cache);
                worked = true;
            }

            // Tick cadence.
            if due(&mut last_tick, cache.tick_rate(), now) {
                hardware.tick(cache.state());
                network.tick(cache, hardware.input_events());
                worked = true;
            }

            if !worked {
                thread::yield_now();
            }
        }

        log::info!("board stopped");
    }
}

/// Fire when `rate` has elapsed since the last firing; the first call always
/// fires.
fn due(last: &mut Option<Instant>, rate: Duration, now: Instant) -> bool {
    let fire = match *last {
        Some(at) => now.duration_since(at) >= rate,
        None => true,
    };
    if fire {
        *last = Some(now);
    }
    fire
}

/// Extract the `--config-path` argument, falling back to the default path.
fn config_path_from_arguments(arguments: &[String]) -> &str {
    let mut iter = arguments.iter();
    while let Some(argument) = iter.next() {
        if argument == "--config-path" {
            if let Some(path) = iter.next() {
                return path;
            }
            log::warn!("--config-path given without a value, using default");
        }
    }
    DEFAULT_CONFIG_PATH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_defaults() {
        assert_eq!(config_path_from_arguments(&[]), DEFAULT_CONFIG_PATH);
        let unrelated = vec!["--verbose".to_string()];
        assert_eq!(config_path_from_arguments(&unrelated), DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn test_config_path_argument_wins() {
        let arguments = vec!["--config-path".to_string(), "/tmp/board.conf".to_string()];
        assert_eq!(config_path_from_arguments(&arguments), "/tmp/board.conf");
    }

    #[test]
    fn test_config_path_without_value_falls_back() {
        let arguments = vec!["--config-path".to_string()];
        assert_eq!(config_path_from_arguments(&arguments), DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn test_due_fires_immediately_then_respects_rate() {
        let rate = Duration::from_millis(50);
        let mut last = None;
        let start = Instant::now();
        assert!(due(&mut last, rate, start));
        assert!(!due(&mut last, rate, start + Duration::from_millis(10)));
        assert!(due(&mut last, rate, start + Duration::from_millis(60)));
        assert!(!due(&mut last, rate, start + Duration::from_millis(70)));
    }
}

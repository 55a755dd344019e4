//! One physical test-box half: the bus connection plus the gas gauge and
//! digital I/O devices that live on it.

use log::warn;

use crate::bus::{BusPort, Transactor};
use crate::error::Result;
use crate::gas_gauge::GasGauge;
use crate::gpio::Gpio;

/// Everything the FSM needs from one test-box connection. Each instance
/// owns its own devices, so independent boxes never share register caches.
pub struct TestBox {
    pub bus: Transactor,
    pub gas_gauge: GasGauge,
    pub gpio: Gpio,
}

impl TestBox {
    /// Bind the devices to a bus port and push their default register
    /// values to the hardware.
    pub fn new(port: Box<dyn BusPort>) -> Result<Self> {
        let mut bus = Transactor::new(port);
        let gas_gauge = GasGauge::new();
        let mut gpio = Gpio::new();
        gpio.hw_init(&mut bus)?;
        Ok(TestBox {
            bus,
            gas_gauge,
            gpio,
        })
    }

    /// A battery (with its gauge) is talking on the bus.
    pub fn battery_present(&mut self) -> bool {
        self.gas_gauge.status_reg(&mut self.bus).is_ok()
    }
}

impl Drop for TestBox {
    fn drop(&mut self) {
        // leave no current path enabled
        if let Err(e) = self.gpio.all_outputs_low(&mut self.bus) {
            warn!("failed to drive outputs low on shutdown: {}", e);
        }
    }
}

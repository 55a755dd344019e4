//! Digital I/O expander on the test-box half: relay-style charge and
//! discharge enables, three status LEDs and the battery-present input.
//!
//! The charge and discharge outputs drive mutually exclusive current
//! paths; enabling one while the other is active is rejected before any
//! bus write happens.

use crate::bus::Transactor;
use crate::constants::{DEFAULT_RETRIES, GPIO_ADDR};
use crate::error::{BenchError, Result};
use crate::registers::{Access, Register, RegisterMap};

// register addresses
const REG_INPUT_PORT0: u8 = 0x00;
const REG_INPUT_PORT1: u8 = 0x01;
const REG_OUTPUT_PORT0: u8 = 0x02;
const REG_OUTPUT_PORT1: u8 = 0x03;
const REG_POLARITY_PORT0: u8 = 0x04;
const REG_POLARITY_PORT1: u8 = 0x05;
const REG_CONFIG_PORT0: u8 = 0x06;
const REG_CONFIG_PORT1: u8 = 0x07;

// pin assignments
const BATTERY_PRESENT_BIT: u8 = 7; // input port 0, active low
const DISCHARGE_ENABLE_BIT: u8 = 0; // output port 0
const CHARGE_ENABLE_BIT: u8 = 0; // output port 1
const LED_ERROR_BIT: u8 = 1; // output port 1
const LED_RUN_BIT: u8 = 2; // output port 1
const LED_DONE_BIT: u8 = 3; // output port 1

/// The discrete-output device of one test-box half.
pub struct Gpio {
    regs: RegisterMap,
}

impl Gpio {
    pub fn new() -> Self {
        Self::with_address(GPIO_ADDR)
    }

    pub fn with_address(address: u8) -> Self {
        let registers = vec![
            Register::new(REG_INPUT_PORT0, Access::ReadOnly, 1, 0x00),
            Register::new(REG_INPUT_PORT1, Access::ReadOnly, 1, 0x00),
            Register::new(REG_OUTPUT_PORT0, Access::ReadWrite, 1, 0x00),
            Register::new(REG_OUTPUT_PORT1, Access::ReadWrite, 1, 0x00),
            Register::new(REG_POLARITY_PORT0, Access::ReadWrite, 1, 0x00),
            Register::new(REG_POLARITY_PORT1, Access::ReadWrite, 1, 0x00),
            Register::new(REG_CONFIG_PORT0, Access::ReadWrite, 1, 0xDA),
            Register::new(REG_CONFIG_PORT1, Access::ReadWrite, 1, 0xF0),
        ];
        Gpio {
            regs: RegisterMap::new(address, registers),
        }
    }

    /// Push the default register values to the device.
    pub fn hw_init(&mut self, bus: &mut Transactor) -> Result<()> {
        self.regs.write_all(bus, DEFAULT_RETRIES)
    }

    /// Output-pin state for the interlock check. The cached value is
    /// authoritative while known; an invalidated cache (after a failed
    /// read) is unsafe to assume low, so it is re-read from the device and
    /// a persistent read failure propagates instead of permitting the
    /// write.
    fn output_bit(&mut self, bus: &mut Transactor, reg: u8, bit: u8) -> Result<bool> {
        match self.regs.cached(reg)? {
            Some(word) => Ok(word & (1u32 << bit) != 0),
            None => self.regs.read_bit(bus, reg, bit, DEFAULT_RETRIES),
        }
    }

    /// Battery-present input (active low on the wire).
    pub fn battery_present(&mut self, bus: &mut Transactor) -> Result<bool> {
        Ok(!self
            .regs
            .read_bit(bus, REG_INPUT_PORT0, BATTERY_PRESENT_BIT, DEFAULT_RETRIES)?)
    }

    /// Charge-enable output state.
    pub fn charge_enable(&mut self, bus: &mut Transactor) -> Result<bool> {
        self.regs
            .read_bit(bus, REG_OUTPUT_PORT1, CHARGE_ENABLE_BIT, DEFAULT_RETRIES)
    }

    /// Drive the charge-enable output. Rejected before any output write if
    /// the discharge path is active or its state cannot be confirmed.
    pub fn set_charge_enable(&mut self, bus: &mut Transactor, enable: bool) -> Result<()> {
        if enable && self.output_bit(bus, REG_OUTPUT_PORT0, DISCHARGE_ENABLE_BIT)? {
            return Err(BenchError::MutualExclusion);
        }
        self.regs
            .write_bit(bus, REG_OUTPUT_PORT1, CHARGE_ENABLE_BIT, enable, DEFAULT_RETRIES)
    }

    /// Discharge-enable output state.
    pub fn discharge_enable(&mut self, bus: &mut Transactor) -> Result<bool> {
        self.regs
            .read_bit(bus, REG_OUTPUT_PORT0, DISCHARGE_ENABLE_BIT, DEFAULT_RETRIES)
    }

    /// Drive the discharge-enable output. Rejected before any output write
    /// if the charge path is active or its state cannot be confirmed.
    pub fn set_discharge_enable(&mut self, bus: &mut Transactor, enable: bool) -> Result<()> {
        if enable && self.output_bit(bus, REG_OUTPUT_PORT1, CHARGE_ENABLE_BIT)? {
            return Err(BenchError::MutualExclusion);
        }
        self.regs.write_bit(
            bus,
            REG_OUTPUT_PORT0,
            DISCHARGE_ENABLE_BIT,
            enable,
            DEFAULT_RETRIES,
        )
    }

    pub fn set_led_run(&mut self, bus: &mut Transactor, enable: bool) -> Result<()> {
        self.regs
            .write_bit(bus, REG_OUTPUT_PORT1, LED_RUN_BIT, enable, DEFAULT_RETRIES)
    }

    pub fn set_led_done(&mut self, bus: &mut Transactor, enable: bool) -> Result<()> {
        self.regs
            .write_bit(bus, REG_OUTPUT_PORT1, LED_DONE_BIT, enable, DEFAULT_RETRIES)
    }

    pub fn set_led_error(&mut self, bus: &mut Transactor, enable: bool) -> Result<()> {
        self.regs
            .write_bit(bus, REG_OUTPUT_PORT1, LED_ERROR_BIT, enable, DEFAULT_RETRIES)
    }

    /// Intended charge-enable state from the cached output register.
    pub fn charge_enable_cached(&self) -> bool {
        self.regs
            .cached_bit(REG_OUTPUT_PORT1, CHARGE_ENABLE_BIT)
            .unwrap_or(false)
    }

    /// Intended discharge-enable state from the cached output register.
    pub fn discharge_enable_cached(&self) -> bool {
        self.regs
            .cached_bit(REG_OUTPUT_PORT0, DISCHARGE_ENABLE_BIT)
            .unwrap_or(false)
    }

    /// Fail-safe: drive every output low so no charge or discharge current
    /// path is left enabled.
    pub fn all_outputs_low(&mut self, bus: &mut Transactor) -> Result<()> {
        self.regs
            .write_reg(bus, REG_OUTPUT_PORT0, 0x00, DEFAULT_RETRIES)?;
        self.regs
            .write_reg(bus, REG_OUTPUT_PORT1, 0x00, DEFAULT_RETRIES)
    }
}

impl Default for Gpio {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimOutcome};

    fn gpio_and_bus() -> (Gpio, Transactor) {
        let mut bus = Transactor::new(Box::new(SimBus::new()));
        let mut gpio = Gpio::new();
        gpio.hw_init(&mut bus).unwrap();
        (gpio, bus)
    }

    #[test]
    fn charge_and_discharge_are_mutually_exclusive() {
        let (mut gpio, mut bus) = gpio_and_bus();

        gpio.set_discharge_enable(&mut bus, true).unwrap();
        let err = gpio.set_charge_enable(&mut bus, true).unwrap_err();
        assert!(matches!(err, BenchError::MutualExclusion));
        // no bus write happened
        assert!(!gpio.charge_enable(&mut bus).unwrap());

        gpio.set_discharge_enable(&mut bus, false).unwrap();
        gpio.set_charge_enable(&mut bus, true).unwrap();
        let err = gpio.set_discharge_enable(&mut bus, true).unwrap_err();
        assert!(matches!(err, BenchError::MutualExclusion));
    }

    #[test]
    fn disabling_is_always_allowed() {
        let (mut gpio, mut bus) = gpio_and_bus();
        gpio.set_charge_enable(&mut bus, true).unwrap();
        gpio.set_charge_enable(&mut bus, false).unwrap();
        gpio.set_discharge_enable(&mut bus, true).unwrap();
        gpio.set_discharge_enable(&mut bus, false).unwrap();
    }

    #[test]
    fn led_bits_do_not_disturb_charge_enable() {
        let (mut gpio, mut bus) = gpio_and_bus();
        gpio.set_charge_enable(&mut bus, true).unwrap();
        gpio.set_led_run(&mut bus, true).unwrap();
        gpio.set_led_error(&mut bus, true).unwrap();
        gpio.set_led_done(&mut bus, true).unwrap();
        assert!(gpio.charge_enable(&mut bus).unwrap());
        gpio.set_led_run(&mut bus, false).unwrap();
        assert!(gpio.charge_enable(&mut bus).unwrap());
    }

    #[test]
    fn interlock_holds_after_peer_cache_invalidated() {
        let sim = SimBus::new();
        let mut bus = Transactor::new(Box::new(sim.clone()));
        let mut gpio = Gpio::new();
        gpio.hw_init(&mut bus).unwrap();
        gpio.set_discharge_enable(&mut bus, true).unwrap();

        // a failed readback invalidates the cached output state
        sim.script_outcomes(&[SimOutcome::Error, SimOutcome::Error, SimOutcome::Error]);
        assert!(gpio.discharge_enable(&mut bus).is_err());

        // the interlock re-reads the live output state and still refuses
        let err = gpio.set_charge_enable(&mut bus, true).unwrap_err();
        assert!(matches!(err, BenchError::MutualExclusion));
        assert_eq!(sim.reg(GPIO_ADDR, REG_OUTPUT_PORT0) & 0x01, 0x01);
        assert_eq!(sim.reg(GPIO_ADDR, REG_OUTPUT_PORT1) & 0x01, 0x00);
    }

    #[test]
    fn unconfirmable_peer_state_blocks_enable() {
        let sim = SimBus::new();
        let mut bus = Transactor::new(Box::new(sim.clone()));
        let mut gpio = Gpio::new();
        gpio.hw_init(&mut bus).unwrap();
        gpio.set_discharge_enable(&mut bus, true).unwrap();

        // enough faults to fail the readback and the interlock's re-read
        sim.script_outcomes(&[SimOutcome::Error; 6]);
        assert!(gpio.discharge_enable(&mut bus).is_err());

        assert!(gpio.set_charge_enable(&mut bus, true).is_err());
        assert_eq!(sim.reg(GPIO_ADDR, REG_OUTPUT_PORT1) & 0x01, 0x00);
    }

    #[test]
    fn battery_present_is_active_low() {
        let sim = SimBus::new();
        sim.set_battery_present(true);
        let mut bus = Transactor::new(Box::new(sim));
        let mut gpio = Gpio::new();
        gpio.hw_init(&mut bus).unwrap();
        assert!(gpio.battery_present(&mut bus).unwrap());
    }

    #[test]
    fn all_outputs_low_clears_both_ports() {
        let (mut gpio, mut bus) = gpio_and_bus();
        gpio.set_discharge_enable(&mut bus, true).unwrap();
        gpio.set_led_run(&mut bus, true).unwrap();
        gpio.all_outputs_low(&mut bus).unwrap();
        assert!(!gpio.charge_enable(&mut bus).unwrap());
        assert!(!gpio.discharge_enable(&mut bus).unwrap());
        assert!(!gpio.charge_enable_cached());
        assert!(!gpio.discharge_enable_cached());
    }
}

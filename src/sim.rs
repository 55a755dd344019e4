//! Simulated bus port for development and tests.
//!
//! Hosts register images for the gas gauge and the I/O expander behind a
//! [`BusPort`] implementation. A `SimBus` is a cheap clone of a shared
//! inner state, so a test can keep one handle to steer telemetry while the
//! transactor owns another.
//!
//! Faults are injected two ways: a per-transaction outcome queue for exact
//! retry patterns, and a blanket `fail_reads` switch that fails every read
//! while leaving writes working.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::bus::{BusPort, BusStatus};
use crate::constants::{GAS_GAUGE_ADDR, GPIO_ADDR, R_SENSE_MOHM, T_FS_K, V_BAT_FS, V_SENSE_FS_MV};

// gas gauge register addresses, as seen on the wire
const GG_CONTROL: u8 = 0x01;
const GG_CHARGE_MSB: u8 = 0x02;
const GG_VOLTAGE_MSB: u8 = 0x08;
const GG_CURRENT_MSB: u8 = 0x0E;
const GG_TEMP_MSB: u8 = 0x14;

// I/O expander input port 0, battery-present pin (active low)
const IO_INPUT_PORT0: u8 = 0x00;
const BATTERY_PRESENT_MASK: u8 = 0x80;

/// Scripted outcome of one bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOutcome {
    Ok,
    AddressNack,
    DataNack,
    Error,
}

impl SimOutcome {
    fn status(self) -> BusStatus {
        match self {
            SimOutcome::Ok => BusStatus::idle(),
            SimOutcome::AddressNack => BusStatus(BusStatus::ADDRESS_NACK),
            SimOutcome::DataNack => BusStatus(BusStatus::DATA_NACK),
            SimOutcome::Error => BusStatus(BusStatus::ERROR),
        }
    }
}

#[derive(Default)]
struct SimState {
    regs: HashMap<(u8, u8), u8>,
    devices: Vec<u8>,
    outcomes: VecDeque<SimOutcome>,
    fail_reads: bool,
    attempts: usize,
    status: BusStatus,
}

impl SimState {
    fn next_outcome(&mut self) -> SimOutcome {
        self.outcomes.pop_front().unwrap_or(SimOutcome::Ok)
    }
}

/// Handle to one simulated bus. Clones share the same state.
#[derive(Clone)]
pub struct SimBus {
    inner: Rc<RefCell<SimState>>,
}

impl SimBus {
    /// A bus with both devices present: gauge registers at their power-on
    /// values, expander inputs reporting a battery attached.
    pub fn new() -> Self {
        let mut state = SimState {
            devices: vec![GAS_GAUGE_ADDR, GPIO_ADDR],
            status: BusStatus::idle(),
            ..Default::default()
        };
        state.regs.insert((GAS_GAUGE_ADDR, GG_CONTROL), 0x3C);
        state.regs.insert((GAS_GAUGE_ADDR, GG_CHARGE_MSB), 0x7F);
        state.regs.insert((GAS_GAUGE_ADDR, GG_CHARGE_MSB + 1), 0xFF);
        SimBus {
            inner: Rc::new(RefCell::new(state)),
        }
    }

    /// Set a raw device register.
    pub fn set_reg(&self, device: u8, reg: u8, value: u8) {
        self.inner.borrow_mut().regs.insert((device, reg), value);
    }

    /// Read back a raw device register (0 if never written).
    pub fn reg(&self, device: u8, reg: u8) -> u8 {
        *self.inner.borrow().regs.get(&(device, reg)).unwrap_or(&0)
    }

    /// Fail every read transaction with a generic bus error; writes keep
    /// working.
    pub fn fail_reads(&self, fail: bool) {
        self.inner.borrow_mut().fail_reads = fail;
    }

    /// Queue scripted outcomes for the next transactions, in order. Once
    /// drained, transactions succeed again.
    pub fn script_outcomes(&self, outcomes: &[SimOutcome]) {
        self.inner.borrow_mut().outcomes.extend(outcomes.iter().copied());
    }

    /// Total bus transactions seen so far.
    pub fn attempts(&self) -> usize {
        self.inner.borrow().attempts
    }

    pub fn set_battery_present(&self, present: bool) {
        let mut state = self.inner.borrow_mut();
        let port = state
            .regs
            .entry((GPIO_ADDR, IO_INPUT_PORT0))
            .or_insert(0);
        if present {
            *port &= !BATTERY_PRESENT_MASK;
        } else {
            *port |= BATTERY_PRESENT_MASK;
        }
    }

    fn set_u16(&self, device: u8, msb_reg: u8, raw: f64) {
        let raw = raw.round().clamp(0.0, 0xFFFF as f64) as u16;
        let mut state = self.inner.borrow_mut();
        state.regs.insert((device, msb_reg), (raw >> 8) as u8);
        state.regs.insert((device, msb_reg + 1), (raw & 0xFF) as u8);
    }

    /// Present a battery voltage, in millivolts.
    pub fn set_voltage_mv(&self, mv: f64) {
        self.set_u16(
            GAS_GAUGE_ADDR,
            GG_VOLTAGE_MSB,
            mv / (1000.0 * V_BAT_FS) * 0xFFFF as f64,
        );
    }

    /// Present a battery current, in milliamps (positive charging).
    pub fn set_current_ma(&self, ma: f64) {
        let i_fs_ma = 1000.0 * V_SENSE_FS_MV / R_SENSE_MOHM;
        self.set_u16(
            GAS_GAUGE_ADDR,
            GG_CURRENT_MSB,
            0x7FFF as f64 + ma / i_fs_ma * 0x7FFF as f64,
        );
    }

    /// Present a charge level, as a percentage of accumulator full scale.
    pub fn set_charge_level_pct(&self, pct: f64) {
        self.set_u16(GAS_GAUGE_ADDR, GG_CHARGE_MSB, pct / 100.0 * 0xFFFF as f64);
    }

    /// Present a die temperature, in degrees Celsius.
    pub fn set_temperature_c(&self, c: f64) {
        self.set_u16(
            GAS_GAUGE_ADDR,
            GG_TEMP_MSB,
            (c + 273.15) / T_FS_K * 0xFFFF as f64,
        );
    }

    /// Gauge control register as last written by the device driver.
    pub fn gauge_control(&self) -> u8 {
        self.reg(GAS_GAUGE_ADDR, GG_CONTROL)
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPort for SimBus {
    fn write(&mut self, address: u8, data: &[u8]) {
        let mut state = self.inner.borrow_mut();
        state.attempts += 1;
        let outcome = state.next_outcome();
        if outcome != SimOutcome::Ok {
            state.status = outcome.status();
            return;
        }
        if !state.devices.contains(&address) || data.is_empty() {
            state.status = BusStatus(BusStatus::ADDRESS_NACK);
            return;
        }
        let reg = data[0];
        for (i, byte) in data[1..].iter().enumerate() {
            state.regs.insert((address, reg.wrapping_add(i as u8)), *byte);
        }
        state.status = BusStatus::idle();
    }

    fn read(&mut self, address: u8, reg: u8, len: usize) -> Vec<u8> {
        let mut state = self.inner.borrow_mut();
        state.attempts += 1;
        let outcome = state.next_outcome();
        if outcome != SimOutcome::Ok {
            state.status = outcome.status();
            return vec![0; len];
        }
        if state.fail_reads {
            state.status = BusStatus(BusStatus::ERROR);
            return vec![0; len];
        }
        if !state.devices.contains(&address) {
            state.status = BusStatus(BusStatus::ADDRESS_NACK);
            return vec![0; len];
        }
        let data = (0..len)
            .map(|i| {
                *state
                    .regs
                    .get(&(address, reg.wrapping_add(i as u8)))
                    .unwrap_or(&0)
            })
            .collect();
        state.status = BusStatus::idle();
        data
    }

    fn status(&self) -> BusStatus {
        self.inner.borrow().status
    }
}

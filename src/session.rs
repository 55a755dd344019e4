//! Battery-test session: one state machine bound to one test box.
//!
//! This is the surface an external shell or UI consumes. Control calls
//! only latch a request; the owning loop must keep calling [`BatteryTest::
//! tick`] at a steady cadence for anything to happen.

use std::time::Duration;

use serde::Serialize;

use crate::fsm::{Fsm, FsmConfig, StateName};
use crate::test_box::TestBox;
use crate::test_log::TelemetrySample;

/// Status snapshot of a running session, serializable for external
/// consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: StateName,
    pub done: bool,
    pub test_pass: bool,
    pub charge_setpoint: f64,
    pub battery_present: bool,
    /// Elapsed test time of the newest logged sample, in seconds
    pub test_time_s: Option<u64>,
    pub last_sample: Option<TelemetrySample>,
    /// Raw gauge config readback, for diagnostics
    pub config_reg_raw: Option<u32>,
}

/// One battery test session.
pub struct BatteryTest {
    tbox: TestBox,
    fsm: Fsm,
}

impl BatteryTest {
    pub fn new(tbox: TestBox) -> Self {
        Self::with_config(tbox, FsmConfig::default())
    }

    pub fn with_config(tbox: TestBox, config: FsmConfig) -> Self {
        BatteryTest {
            tbox,
            fsm: Fsm::new(config),
        }
    }

    /// Request a full charge/discharge test ending at `charge_setpoint`
    /// percent. A short test only charges to a token level first.
    pub fn start_test(&mut self, charge_setpoint: f64, short_test: bool) {
        self.fsm.start(charge_setpoint, short_test);
    }

    /// Request a charge (or discharge) to `charge_setpoint` percent with no
    /// verdict.
    pub fn start_quickcharge(&mut self, charge_setpoint: f64) {
        self.fsm.start_quickcharge(charge_setpoint);
    }

    /// Resume an interrupted run, keeping its telemetry log.
    pub fn resume(&mut self) {
        self.fsm.resume();
    }

    /// Stop the active run on the next tick.
    pub fn stop(&mut self) {
        self.fsm.stop();
    }

    /// Advance the state machine one step. Call at ~1 Hz.
    pub fn tick(&mut self) {
        self.fsm.tick(&mut self.tbox);
    }

    pub fn state_name(&self) -> StateName {
        self.fsm.state_name()
    }

    pub fn done(&self) -> bool {
        self.fsm.done()
    }

    pub fn test_pass(&self) -> bool {
        self.fsm.test_pass()
    }

    /// Elapsed test time of the newest logged sample.
    pub fn test_time(&self) -> Option<Duration> {
        self.fsm.test_time()
    }

    pub fn last_sample(&self) -> Option<TelemetrySample> {
        self.fsm.last_sample()
    }

    /// A battery (with its gauge) is responding on the bus.
    pub fn battery_present(&mut self) -> bool {
        self.tbox.battery_present()
    }

    pub fn status(&mut self) -> SessionStatus {
        SessionStatus {
            state: self.fsm.state_name(),
            done: self.fsm.done(),
            test_pass: self.fsm.test_pass(),
            charge_setpoint: self.fsm.charge_setpoint(),
            battery_present: self.tbox.battery_present(),
            test_time_s: self.fsm.test_time().map(|d| d.as_secs()),
            last_sample: self.fsm.last_sample(),
            config_reg_raw: self.tbox.gas_gauge.cached_config(),
        }
    }

    /// Direct access to the underlying devices, for diagnostics.
    pub fn test_box(&mut self) -> &mut TestBox {
        &mut self.tbox
    }
}

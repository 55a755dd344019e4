//! # Battery Bench Library
//!
//! A Rust library for running automated charge/discharge tests on battery
//! packs through an I2C-attached test box. Each test-box half carries a
//! coulomb-counting gas gauge and a digital I/O expander that switches the
//! charge and discharge current paths; this library drives both through a
//! retrying bus transaction layer and sequences a full test with a
//! tick-driven state machine.
//!
//! ## Features
//!
//! - Classified, retryable register transactions over a pluggable bus port
//! - Gas-gauge telemetry decoded to physical units (mV, mA, mAh, °C)
//! - Mutually exclusive charge/discharge switching with status LEDs
//! - Durable CSV telemetry logs with phase segmentation and a
//!   limit-band pass/fail verdict
//! - Full, short, quickcharge and resumable test sequences
//! - A simulated bus for development and testing without hardware
//!
//! ## Example
//!
//! ```no_run
//! use batbench::{BatteryTest, SimBus, TestBox};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tbox = TestBox::new(Box::new(SimBus::new()))?;
//!     let mut session = BatteryTest::new(tbox);
//!     session.start_test(35.0, false);
//!     loop {
//!         session.tick();
//!         if session.done() {
//!             break;
//!         }
//!         std::thread::sleep(std::time::Duration::from_secs(1));
//!     }
//!     println!("verdict: {}", if session.test_pass() { "PASS" } else { "FAIL" });
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod constants;
pub mod error;
pub mod fsm;
pub mod gas_gauge;
pub mod gpio;
pub mod registers;
pub mod session;
pub mod sim;
pub mod test_box;
pub mod test_log;

pub use bus::{BusPort, BusStatus, Transactor};
pub use error::{BenchError, Result};
pub use fsm::{Fsm, FsmConfig, StateName};
pub use gas_gauge::GasGauge;
pub use gpio::Gpio;
pub use session::{BatteryTest, SessionStatus};
pub use sim::{SimBus, SimOutcome};
pub use test_box::TestBox;
pub use test_log::{PhaseBoundaries, PhaseLimits, PhaseStats, TelemetrySample, TestLog};

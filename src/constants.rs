//! Named constants for the battery test bench.
//!
//! This module collects every tuned number in one place: device addresses,
//! gas-gauge scaling factors, phase thresholds, state timeouts and the
//! per-phase limit bands used for pass/fail checking.

use std::time::Duration;

use crate::test_log::PhaseLimits;

// --- bus addresses -------------------------------------------------------

/// Bus address of the coulomb-counting gas gauge
pub const GAS_GAUGE_ADDR: u8 = 0x64;

/// Bus address of the digital I/O expander
pub const GPIO_ADDR: u8 = 0x27;

/// Default retry count for routine register transactions
pub const DEFAULT_RETRIES: u32 = 2;

/// Retry count for charge-accumulator calibration writes
pub const CHARGE_WRITE_RETRIES: u32 = 5;

// --- gas gauge scaling (datasheet full-scale values) ---------------------

/// Charge LSB scale in mAh * mohm per max prescaler
pub const Q_SCALE: f64 = 0.340 * 50.0 / 4096.0;

/// Coulomb-counter prescaler setting
pub const PRESCALER: f64 = 64.0;

/// Sense resistor in milliohms
pub const R_SENSE_MOHM: f64 = 5.0;

/// Full-scale battery voltage in volts
pub const V_BAT_FS: f64 = 23.6;

/// Full-scale sense voltage in millivolts
pub const V_SENSE_FS_MV: f64 = 60.0;

/// Full-scale temperature in kelvin
pub const T_FS_K: f64 = 510.0;

/// Control register value for manual ADC mode (used while a test is running)
pub const CONTROL_MANUAL: u32 = 0b1001_1010;

/// Control register value for automatic ADC mode (idle / pretest)
pub const CONTROL_AUTO: u32 = 0b1101_1010;

/// Config readback meaning "fully discharged, needs recalibration"
pub const CONFIG_DISCHARGED_SENTINEL: u32 = 0x3C;

/// Calibrated zero point for the charge accumulator register pair
pub const CHARGE_ZERO_POINT: u32 = 0x1999;

// --- phase thresholds ----------------------------------------------------

/// End-of-precharge battery voltage in mV.
/// VFB = Vbat * 30k/(205k + 30k), precharge ends at VFB = 1550 mV.
pub const PRECHRG_END_VFB_THRESH_MV: f64 = 1550.0 * 235.0 / 30.0;

/// Battery voltage below which a precharge pass is required, in mV
pub const PRECHARGE_REQUIRED_MV: f64 = 5000.0;

/// Discharge considered finished when |current| stays below this, in mA
pub const DISCHARGE_DONE_THRESH_MA: f64 = 25.0;

/// Consecutive below-threshold ticks before discharge is called done.
/// Empirically tuned, no documented derivation.
pub const DISCHARGE_DEBOUNCE_TICKS: u32 = 10;

/// Overall-vs-rolling average current divergence marking the start of the
/// constant-voltage region, in mA. Empirically tuned.
pub const CONST_V_DIVERGENCE_MA: f64 = 10.0;

/// Window length of the rolling current average used for the
/// constant-voltage boundary
pub const ROLLING_AVG_SAMPLES: usize = 10;

/// Consecutive negative-current samples marking the start of discharge
pub const DISCHARGE_NEG_RUN: usize = 5;

/// Guard margin trimmed from each side of the charge phases, in samples
pub const PHASE_GUARD_SAMPLES: usize = 10;

/// Guard margin trimmed from the head of the discharge phase, in samples
pub const DISCHARGE_GUARD_HEAD: usize = 50;

/// Guard margin trimmed from the tail of the discharge phase, in samples
pub const DISCHARGE_GUARD_TAIL: usize = 3;

// --- run targets ---------------------------------------------------------

/// Charge-level target for a full charge test, in percent
pub const FULL_TEST_LEVEL_PCT: f64 = 100.0;

/// Charge-level target for a short charge test, in percent
pub const SHORT_TEST_LEVEL_PCT: f64 = 10.5;

/// Default charge setpoint for a full test, in percent
pub const DEFAULT_CHARGE_SETPOINT_PCT: f64 = 35.0;

// --- timing --------------------------------------------------------------

/// Maximum time since the last successful telemetry read before a state
/// aborts to idle with the error LED lit
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Hold time of the inter-state wait pause
pub const WAIT_HOLD: Duration = Duration::from_secs(1);

/// Pretest timeout (discharging down to the precharge threshold)
pub const PRETEST_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Charge test timeout
pub const CHARGE_TEST_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Discharge test timeout
pub const DISCHARGE_TEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Post-test timeout (recharging to the setpoint)
pub const POST_TEST_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// LED blink period in ticks
pub const BLINK_PERIOD_TICKS: u32 = 2;

// --- per-phase limit bands -----------------------------------------------

/// Precharge phase limits
pub const PRECHARGE_LIMITS: PhaseLimits = PhaseLimits {
    i_min_ma: 50.0,
    i_max_ma: 300.0,
    v_min_mv: 3000.0,
    v_max_mv: 12500.0,
};

/// Constant-current phase limits
pub const CONST_I_LIMITS: PhaseLimits = PhaseLimits {
    i_min_ma: 800.0,
    i_max_ma: 1200.0,
    v_min_mv: 12000.0,
    v_max_mv: 16900.0,
};

/// Constant-voltage phase limits
pub const CONST_V_LIMITS: PhaseLimits = PhaseLimits {
    i_min_ma: 0.0,
    i_max_ma: 1200.0,
    v_min_mv: 16300.0,
    v_max_mv: 16900.0,
};

/// Discharge phase limits (charging current is positive, so both current
/// bounds are negative here)
pub const DISCHARGE_LIMITS: PhaseLimits = PhaseLimits {
    i_min_ma: -2500.0,
    i_max_ma: -50.0,
    v_min_mv: 9000.0,
    v_max_mv: 16900.0,
};

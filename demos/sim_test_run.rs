//! Simulated Test Run
//!
//! This example drives a full charge/discharge test against the simulated
//! bus: the battery model is steered tick by tick so the whole sequence
//! (pretest, charge, discharge, post-test) completes in seconds instead of
//! hours. A CSV telemetry log lands in ./test_results.
//!
//! Usage:
//!   cargo run --example sim_test_run
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example sim_test_run
//!   RUST_LOG=info cargo run --example sim_test_run

use std::time::Duration;

use batbench::constants::GAS_GAUGE_ADDR;
use batbench::{BatteryTest, FsmConfig, Result, SimBus, StateName, TestBox};
use log::info;

fn main() -> Result<()> {
    // Initialize logger with default info level if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let sim = SimBus::new();
    // calibrated gauge, healthy pack at rest
    sim.set_reg(GAS_GAUGE_ADDR, 0x01, 0xDA);
    sim.set_voltage_mv(16000.0);
    sim.set_current_ma(0.0);
    sim.set_charge_level_pct(50.0);
    sim.set_temperature_c(25.0);

    let tbox = TestBox::new(Box::new(sim.clone()))?;
    let config = FsmConfig {
        wait_hold: Duration::from_millis(100),
        discharge_debounce_ticks: 3,
        ..FsmConfig::default()
    };
    let mut session = BatteryTest::with_config(tbox, config);

    info!("=== Starting Full Test ===");
    session.start_test(35.0, false);

    let mut level: f64 = 50.0;
    let mut voltage: f64 = 16000.0;
    for _ in 0..200 {
        // crude battery model: respond to whatever the bench is doing
        match session.state_name() {
            StateName::Pretest => {
                sim.set_current_ma(-1500.0);
                voltage = (voltage - 800.0).max(4000.0);
                sim.set_voltage_mv(voltage);
            }
            StateName::ChargeTest => {
                sim.set_current_ma(1000.0);
                level = (level + 5.0).min(100.0);
                voltage = (voltage + 600.0).min(16800.0);
                sim.set_charge_level_pct(level);
                sim.set_voltage_mv(voltage);
            }
            StateName::DischargeTest => {
                level = (level - 8.0).max(5.0);
                sim.set_current_ma(if level > 5.0 { -1500.0 } else { 0.0 });
                sim.set_charge_level_pct(level);
            }
            StateName::PostTest => {
                sim.set_current_ma(800.0);
                level = (level + 5.0).min(100.0);
                sim.set_charge_level_pct(level);
            }
            _ => {}
        }

        session.tick();
        if session.done() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("=== Test Complete ===");
    let status = session.status();
    println!(
        "{}",
        serde_json::to_string_pretty(&status).expect("status serializes")
    );
    info!(
        "verdict: {}",
        if session.test_pass() { "PASS" } else { "FAIL" }
    );

    Ok(())
}

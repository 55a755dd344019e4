//! Phase segmentation and pass/fail verdict over a synthetic full-test
//! telemetry profile.

use std::time::Duration;

use batbench::{TelemetrySample, TestLog};

fn sample(i: usize, voltage_mv: f64, current_ma: f64) -> TelemetrySample {
    TelemetrySample {
        elapsed: Duration::from_secs(i as u64),
        voltage_mv,
        current_ma,
        charge_mah: 0.0,
        charge_level_pct: 0.0,
        temperature_c: 25.0,
    }
}

/// A healthy full run: rest, precharge from 4 V, constant current to the
/// top of the charge curve, tapering constant voltage, then discharge.
fn full_run_profile() -> Vec<TelemetrySample> {
    let mut v = Vec::new();
    // resting with a slight negative drift before the charger engages
    for i in 0..5 {
        v.push(sample(i, 4000.0, -20.0));
    }
    // precharge: gentle current while the voltage climbs
    for i in 5..50 {
        let frac = (i - 5) as f64 / 45.0;
        v.push(sample(i, 4000.0 + 8000.0 * frac, 150.0));
    }
    // constant current
    for i in 50..300 {
        let frac = (i - 50) as f64 / 250.0;
        v.push(sample(i, 12500.0 + 4300.0 * frac, 1000.0));
    }
    // constant voltage: charge current tapers off
    for i in 300..700 {
        let taper = 1000.0 - 50.0 * (i - 300) as f64;
        v.push(sample(i, 16800.0, taper.max(100.0)));
    }
    // discharge under load
    for i in 700..760 {
        let frac = (i - 700) as f64 / 60.0;
        v.push(sample(i, 16000.0 - 4000.0 * frac, -1500.0));
    }
    v
}

fn log_from(samples: Vec<TelemetrySample>) -> TestLog {
    let mut log = TestLog::in_memory();
    for s in samples {
        log.add_result(s).unwrap();
    }
    log
}

#[test]
fn boundaries_located_on_a_healthy_run() {
    let log = log_from(full_run_profile());
    let b = log.boundaries();

    assert_eq!(b.precharge_start, Some(5));
    assert_eq!(b.const_current_start, Some(50));
    // the taper detector fires a handful of samples into the taper
    let cv = b.const_voltage_start.expect("constant voltage boundary");
    assert!((300..315).contains(&cv), "cv boundary at {}", cv);
    assert_eq!(b.discharge_start, Some(700));
}

#[test]
fn healthy_run_passes() {
    let log = log_from(full_run_profile());

    let stats = log.phase_stats().expect("all four phases");
    assert_eq!(stats.len(), 4);
    // trimmed discharge phase sits squarely in the load region
    assert!(stats[3].i_avg_ma < -1000.0);

    assert!(log.test_pass());
}

#[test]
fn over_current_during_constant_current_fails() {
    let mut samples = full_run_profile();
    samples[100].current_ma = 1500.0;
    let log = log_from(samples);

    // a single spike is too brief to shift the taper boundary
    let cv = log.boundaries().const_voltage_start.unwrap();
    assert!((300..315).contains(&cv));
    assert!(!log.test_pass());
}

#[test]
fn over_voltage_during_constant_voltage_fails() {
    let mut samples = full_run_profile();
    for s in &mut samples[400..405] {
        s.voltage_mv = 17000.0;
    }
    let log = log_from(samples);

    // the excursion does not disturb boundary detection
    assert_eq!(log.boundaries().discharge_start, Some(700));
    assert!(!log.test_pass());
}

#[test]
fn over_current_during_discharge_fails() {
    let mut samples = full_run_profile();
    samples[752].current_ma = -3000.0;
    let log = log_from(samples);

    assert!(!log.test_pass());
}

#[test]
fn run_without_a_discharge_phase_fails() {
    let mut samples = full_run_profile();
    samples.truncate(700);
    let log = log_from(samples);

    assert_eq!(log.boundaries().discharge_start, None);
    assert!(log.phase_stats().is_none());
    assert!(!log.test_pass());
}

//! Transaction-layer retry and classification behavior against scripted
//! bus fault patterns.

use batbench::constants::GAS_GAUGE_ADDR;
use batbench::{BenchError, SimBus, SimOutcome, Transactor};

fn bus_pair() -> (SimBus, Transactor) {
    let sim = SimBus::new();
    let bus = Transactor::new(Box::new(sim.clone()));
    (sim, bus)
}

#[test]
fn write_retries_through_transient_faults() {
    let (sim, mut bus) = bus_pair();
    sim.script_outcomes(&[SimOutcome::Error, SimOutcome::Error]);

    bus.write(GAS_GAUGE_ADDR, 0x01, &[0x9A], 2).unwrap();

    // two failures plus the successful attempt
    assert_eq!(sim.attempts(), 3);
    assert_eq!(sim.reg(GAS_GAUGE_ADDR, 0x01), 0x9A);
}

#[test]
fn read_retries_through_a_single_nack() {
    let (sim, mut bus) = bus_pair();
    sim.set_reg(GAS_GAUGE_ADDR, 0x08, 0xAB);
    sim.script_outcomes(&[SimOutcome::DataNack]);

    let data = bus.read(GAS_GAUGE_ADDR, 0x08, 1, 2).unwrap();

    assert_eq!(data, vec![0xAB]);
    assert_eq!(sim.attempts(), 2);
}

#[test]
fn exhausted_nacks_classify_as_no_device() {
    let (sim, mut bus) = bus_pair();
    sim.script_outcomes(&[
        SimOutcome::AddressNack,
        SimOutcome::AddressNack,
        SimOutcome::AddressNack,
    ]);

    let err = bus.read(GAS_GAUGE_ADDR, 0x08, 2, 2).unwrap_err();

    assert!(matches!(
        err,
        BenchError::NoDevice {
            address: GAS_GAUGE_ADDR
        }
    ));
    // retries + 1 attempts, no extras
    assert_eq!(sim.attempts(), 3);
}

#[test]
fn exhausted_faults_classify_as_transfer_error() {
    let (sim, mut bus) = bus_pair();
    sim.script_outcomes(&[SimOutcome::Error, SimOutcome::Error]);

    let err = bus.write(GAS_GAUGE_ADDR, 0x02, &[0x19, 0x99], 1).unwrap_err();

    assert!(matches!(
        err,
        BenchError::Transfer {
            address: GAS_GAUGE_ADDR,
            ..
        }
    ));
    assert_eq!(sim.attempts(), 2);
    // failed write never landed
    assert_eq!(sim.reg(GAS_GAUGE_ADDR, 0x02), 0x00);
}

#[test]
fn zero_retries_is_a_single_attempt() {
    let (sim, mut bus) = bus_pair();
    sim.script_outcomes(&[SimOutcome::DataNack]);

    assert!(bus.read(GAS_GAUGE_ADDR, 0x00, 1, 0).is_err());
    assert_eq!(sim.attempts(), 1);
}

#[test]
fn absent_device_nacks_every_transfer() {
    let (sim, mut bus) = bus_pair();

    let err = bus.write(0x55, 0x00, &[0x01], 2).unwrap_err();

    assert!(matches!(err, BenchError::NoDevice { address: 0x55 }));
    assert_eq!(sim.attempts(), 3);
}

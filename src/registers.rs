//! Named, typed view over a device's register set.
//!
//! A [`RegisterMap`] is bound to one device address and caches the last
//! known value of every register. Caching avoids redundant reads when
//! several bit accessors touch the same register within one logical
//! operation; staleness is acceptable because the whole system is
//! poll-driven at a slow cadence. A cached value is `None` until a read
//! succeeds (or, for read-write registers, seeded with the power-on
//! default the map will push to the device).

use std::collections::BTreeMap;

use crate::bus::Transactor;
use crate::error::{BenchError, Result};

/// Register access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// One device register: address, access mode, width and cached value.
#[derive(Debug, Clone)]
pub struct Register {
    address: u8,
    access: Access,
    width: usize,
    value: Option<u32>,
}

impl Register {
    /// Read-write registers start out caching their `default`, which
    /// [`RegisterMap::write_all`] pushes to the device at init. Read-only
    /// registers are unknown until the first successful read.
    pub fn new(address: u8, access: Access, width: usize, default: u32) -> Self {
        let value = match access {
            Access::ReadWrite => Some(default),
            Access::ReadOnly => None,
        };
        Register {
            address,
            access,
            width,
            value,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Last known value, `None` after a failed read.
    pub fn value(&self) -> Option<u32> {
        self.value
    }

    fn set_bit(&mut self, bit: u8, on: bool) {
        let word = self.value.unwrap_or(0);
        let mask = 1u32 << bit;
        self.value = Some(if on { word | mask } else { word & !mask });
    }

    fn bit(&self, bit: u8) -> Option<bool> {
        self.value.map(|word| word & (1u32 << bit) != 0)
    }
}

/// Ordered register set bound to one device address on the bus.
///
/// The map owns no bus; every call borrows the [`Transactor`] only for its
/// own duration.
pub struct RegisterMap {
    address: u8,
    registers: BTreeMap<u8, Register>,
}

impl RegisterMap {
    pub fn new(address: u8, registers: Vec<Register>) -> Self {
        let registers = registers.into_iter().map(|r| (r.address(), r)).collect();
        RegisterMap { address, registers }
    }

    /// Device bus address this map is bound to.
    pub fn device_address(&self) -> u8 {
        self.address
    }

    fn reg(&self, reg_addr: u8) -> Result<&Register> {
        self.registers
            .get(&reg_addr)
            .ok_or(BenchError::InvalidRegister { address: reg_addr })
    }

    fn reg_mut(&mut self, reg_addr: u8) -> Result<&mut Register> {
        self.registers
            .get_mut(&reg_addr)
            .ok_or(BenchError::InvalidRegister { address: reg_addr })
    }

    /// Read a register from the device, updating the cache. A failed read
    /// invalidates the cache so callers never see a stale value as fresh.
    pub fn read_reg(&mut self, bus: &mut Transactor, reg_addr: u8, retries: u32) -> Result<u32> {
        let width = self.reg(reg_addr)?.width();
        let device = self.address;
        match bus.read(device, reg_addr, width, retries) {
            Ok(bytes) => {
                let word = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
                self.reg_mut(reg_addr)?.value = Some(word);
                Ok(word)
            }
            Err(e) => {
                self.reg_mut(reg_addr)?.value = None;
                Err(e)
            }
        }
    }

    /// Write a register value to the device. Rejected before any bus
    /// access if the register is unknown or read-only.
    pub fn write_reg(
        &mut self,
        bus: &mut Transactor,
        reg_addr: u8,
        value: u32,
        retries: u32,
    ) -> Result<()> {
        let device = self.address;
        let bytes = {
            let reg = self.reg(reg_addr)?;
            if reg.access() == Access::ReadOnly {
                return Err(BenchError::ReadOnly { address: reg_addr });
            }
            let width = reg.width();
            if width < 4 && value >= 1u32 << (8 * width) {
                return Err(BenchError::ValueOutOfRange { value });
            }
            (0..width)
                .rev()
                .map(|i| (value >> (8 * i)) as u8)
                .collect::<Vec<u8>>()
        };
        // Cache carries the intended value even if the transfer fails; the
        // next write_all or retry pushes it again.
        self.reg_mut(reg_addr)?.value = Some(value);
        bus.write(device, reg_addr, &bytes, retries)
    }

    /// Read one bit of a register (performs a full register read).
    pub fn read_bit(
        &mut self,
        bus: &mut Transactor,
        reg_addr: u8,
        bit: u8,
        retries: u32,
    ) -> Result<bool> {
        let word = self.read_reg(bus, reg_addr, retries)?;
        Ok(word & (1u32 << bit) != 0)
    }

    /// Set one bit of a register, read-modify-write through the cached
    /// value, and push the whole register to the device. An unknown cache
    /// (invalidated by an earlier failed read) is re-read from the device
    /// first, so sibling bits are never rebuilt from a guessed baseline.
    pub fn write_bit(
        &mut self,
        bus: &mut Transactor,
        reg_addr: u8,
        bit: u8,
        on: bool,
        retries: u32,
    ) -> Result<()> {
        {
            let reg = self.reg(reg_addr)?;
            if reg.access() == Access::ReadOnly {
                return Err(BenchError::ReadOnly { address: reg_addr });
            }
        }
        if self.reg(reg_addr)?.value().is_none() {
            self.read_reg(bus, reg_addr, retries)?;
        }
        self.reg_mut(reg_addr)?.set_bit(bit, on);
        let value = self.reg(reg_addr)?.value().unwrap_or(0);
        let device = self.address;
        let width = self.reg(reg_addr)?.width();
        let bytes: Vec<u8> = (0..width)
            .rev()
            .map(|i| (value >> (8 * i)) as u8)
            .collect();
        bus.write(device, reg_addr, &bytes, retries)
    }

    /// Push every read-write register's cached value to the device once.
    /// Used at device initialization.
    pub fn write_all(&mut self, bus: &mut Transactor, retries: u32) -> Result<()> {
        let writable: Vec<(u8, u32)> = self
            .registers
            .values()
            .filter(|r| r.access() == Access::ReadWrite)
            .map(|r| (r.address(), r.value().unwrap_or(0)))
            .collect();
        for (reg_addr, value) in writable {
            self.write_reg(bus, reg_addr, value, retries)?;
        }
        Ok(())
    }

    /// Cached value of a register without touching the bus.
    pub fn cached(&self, reg_addr: u8) -> Result<Option<u32>> {
        Ok(self.reg(reg_addr)?.value())
    }

    /// Cached bit of a register without touching the bus. `false` when the
    /// register value is unknown.
    pub fn cached_bit(&self, reg_addr: u8, bit: u8) -> Result<bool> {
        Ok(self.reg(reg_addr)?.bit(bit).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusPort, BusStatus};
    use std::collections::HashMap;

    /// Minimal register-backed port for exercising the map.
    struct MemPort {
        regs: HashMap<u8, u8>,
        status: BusStatus,
        fail_next: bool,
    }

    impl MemPort {
        fn new() -> Self {
            MemPort {
                regs: HashMap::new(),
                status: BusStatus::idle(),
                fail_next: false,
            }
        }
    }

    impl BusPort for MemPort {
        fn write(&mut self, _address: u8, data: &[u8]) {
            if self.fail_next {
                self.fail_next = false;
                self.status = BusStatus(BusStatus::ADDRESS_NACK);
                return;
            }
            self.status = BusStatus::idle();
            for (i, &b) in data[1..].iter().enumerate() {
                self.regs.insert(data[0] + i as u8, b);
            }
        }

        fn read(&mut self, _address: u8, reg: u8, len: usize) -> Vec<u8> {
            if self.fail_next {
                self.fail_next = false;
                self.status = BusStatus(BusStatus::ADDRESS_NACK);
                return vec![0; len];
            }
            self.status = BusStatus::idle();
            (0..len)
                .map(|i| *self.regs.get(&(reg + i as u8)).unwrap_or(&0))
                .collect()
        }

        fn status(&self) -> BusStatus {
            self.status
        }
    }

    fn map() -> RegisterMap {
        RegisterMap::new(
            0x27,
            vec![
                Register::new(0x00, Access::ReadOnly, 1, 0x00),
                Register::new(0x03, Access::ReadWrite, 1, 0xA5),
            ],
        )
    }

    #[test]
    fn write_to_read_only_rejected_before_bus_access() {
        let mut bus = Transactor::new(Box::new(MemPort::new()));
        let mut regs = map();
        let err = regs.write_reg(&mut bus, 0x00, 1, 0).unwrap_err();
        assert!(matches!(err, BenchError::ReadOnly { address: 0x00 }));
    }

    #[test]
    fn unknown_register_rejected() {
        let mut bus = Transactor::new(Box::new(MemPort::new()));
        let mut regs = map();
        let err = regs.read_reg(&mut bus, 0x42, 0).unwrap_err();
        assert!(matches!(err, BenchError::InvalidRegister { address: 0x42 }));
    }

    #[test]
    fn bit_write_round_trips_without_disturbing_siblings() {
        let mut bus = Transactor::new(Box::new(MemPort::new()));
        let mut regs = map();
        // push the non-zero baseline first
        regs.write_all(&mut bus, 0).unwrap();

        regs.write_bit(&mut bus, 0x03, 1, true, 0).unwrap();
        assert!(regs.read_bit(&mut bus, 0x03, 1, 0).unwrap());
        assert_eq!(regs.read_reg(&mut bus, 0x03, 0).unwrap(), 0xA7);

        regs.write_bit(&mut bus, 0x03, 0, false, 0).unwrap();
        assert_eq!(regs.read_reg(&mut bus, 0x03, 0).unwrap(), 0xA6);
    }

    #[test]
    fn bit_write_rereads_an_invalidated_baseline() {
        use crate::sim::{SimBus, SimOutcome};

        let sim = SimBus::new();
        let mut bus = Transactor::new(Box::new(sim.clone()));
        let mut regs = map();
        regs.write_all(&mut bus, 0).unwrap();

        sim.script_outcomes(&[SimOutcome::Error]);
        assert!(regs.read_reg(&mut bus, 0x03, 0).is_err());
        assert_eq!(regs.cached(0x03).unwrap(), None);

        // the baseline comes back from the device, not from a zero guess
        regs.write_bit(&mut bus, 0x03, 1, true, 0).unwrap();
        assert_eq!(regs.read_reg(&mut bus, 0x03, 0).unwrap(), 0xA7);
    }

    #[test]
    fn failed_read_invalidates_cache() {
        let mut port = MemPort::new();
        port.fail_next = true;
        let mut bus = Transactor::new(Box::new(port));
        let mut regs = map();

        assert!(regs.read_reg(&mut bus, 0x00, 0).is_err());
        assert_eq!(regs.cached(0x00).unwrap(), None);

        // next read succeeds and repopulates the cache
        assert_eq!(regs.read_reg(&mut bus, 0x00, 0).unwrap(), 0);
        assert_eq!(regs.cached(0x00).unwrap(), Some(0));
    }
}

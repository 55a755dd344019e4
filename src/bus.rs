//! Bus port abstraction and the retrying transaction layer.
//!
//! [`BusPort`] is the byte-level primitive: one register-addressed write or
//! read, with the outcome reported through a controller status word rather
//! than a return code. [`Transactor`] turns those raw transfers into
//! classified, retryable operations. This layer knows nothing about what
//! the registers mean.

use log::warn;

use crate::error::{BenchError, Result};

/// Controller status flags reported after a bus transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStatus(pub u8);

impl BusStatus {
    /// Controller busy with a transfer
    pub const CONTROLLER_BUSY: u8 = 0x01;
    /// Generic transfer error
    pub const ERROR: u8 = 0x02;
    /// Address byte not acknowledged
    pub const ADDRESS_NACK: u8 = 0x04;
    /// Data byte not acknowledged
    pub const DATA_NACK: u8 = 0x08;
    /// Lost bus arbitration
    pub const ARBITRATION_LOST: u8 = 0x10;
    /// Controller idle
    pub const IDLE: u8 = 0x20;
    /// Bus held busy by another master
    pub const BUS_BUSY: u8 = 0x40;

    /// Status after a clean transfer.
    pub fn idle() -> Self {
        BusStatus(Self::IDLE)
    }

    /// Address or data byte went unacknowledged.
    pub fn is_nack(self) -> bool {
        self.0 & (Self::ADDRESS_NACK | Self::DATA_NACK) != 0
    }

    /// Any non-idle failure other than a NACK.
    pub fn is_fault(self) -> bool {
        self.0 & (Self::ERROR | Self::ARBITRATION_LOST | Self::BUS_BUSY) != 0
    }
}

/// One register-addressed transfer on the physical bus.
///
/// Implementations cover the wire-level frame format (device address,
/// register address byte, N data bytes) and low-level timing; callers learn
/// the outcome from [`BusPort::status`] after each transfer.
pub trait BusPort {
    /// Write `data` to `address`. `data[0]` is the register address byte.
    fn write(&mut self, address: u8, data: &[u8]);

    /// Write the register address byte to `address`, then read `len` bytes
    /// back with a repeated start.
    fn read(&mut self, address: u8, reg: u8, len: usize) -> Vec<u8>;

    /// Controller status of the most recent transfer.
    fn status(&self) -> BusStatus;
}

/// Retrying transaction layer over a [`BusPort`].
pub struct Transactor {
    port: Box<dyn BusPort>,
}

impl Transactor {
    pub fn new(port: Box<dyn BusPort>) -> Self {
        Transactor { port }
    }

    /// Write `data` to register `reg` of device `device`, retrying
    /// immediately on failure up to `retries` times.
    pub fn write(&mut self, device: u8, reg: u8, data: &[u8], retries: u32) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(reg);
        frame.extend_from_slice(data);

        let mut remaining = retries;
        loop {
            self.port.write(device, &frame);
            match classify(device, self.port.status()) {
                Ok(()) => return Ok(()),
                Err(_) if remaining > 0 => remaining -= 1,
                Err(e) => {
                    warn!(
                        "write to {:#04x}/{:#04x} failed after {} attempts: {}",
                        device,
                        reg,
                        retries + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Read `width` bytes from register `reg` of device `device`, retrying
    /// immediately on failure up to `retries` times.
    pub fn read(&mut self, device: u8, reg: u8, width: usize, retries: u32) -> Result<Vec<u8>> {
        let mut remaining = retries;
        loop {
            let data = self.port.read(device, reg, width);
            let outcome = classify(device, self.port.status()).and_then(|()| {
                if data.len() == width {
                    Ok(data)
                } else {
                    Err(BenchError::Transfer {
                        address: device,
                        status: self.port.status().0,
                    })
                }
            });
            match outcome {
                Ok(data) => return Ok(data),
                Err(_) if remaining > 0 => remaining -= 1,
                Err(e) => {
                    warn!(
                        "read of {:#04x}/{:#04x} failed after {} attempts: {}",
                        device,
                        reg,
                        retries + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Classify a completed transfer: NACKs mean the device is absent, any
/// other non-idle status is a generic transfer fault.
fn classify(device: u8, status: BusStatus) -> Result<()> {
    if status.is_nack() {
        Err(BenchError::NoDevice { address: device })
    } else if status.is_fault() {
        Err(BenchError::Transfer {
            address: device,
            status: status.0,
        })
    } else {
        Ok(())
    }
}

// src/fleet/address.rs - Global slot index <-> (device, local slot)
use serde::Serialize;

use crate::device::SLOTS_PER_DEVICE;
use crate::error::AddressError;

pub const MAX_DEVICES: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotAddress {
    pub device: u8,
    pub local: u8,
}

/// Flat address space over `device_count` devices of four slots each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAddressSpace {
    device_count: u8,
}

impl SlotAddressSpace {
    pub fn new(device_count: u8) -> Result<Self, AddressError> {
        if device_count == 0 || device_count > MAX_DEVICES {
            return Err(AddressError::InvalidDeviceCount(device_count));
        }
        Ok(Self { device_count })
    }

    pub fn device_count(&self) -> u8 {
        self.device_count
    }

    pub fn total_slots(&self) -> usize {
        self.device_count as usize * SLOTS_PER_DEVICE
    }

    pub fn to_local(&self, global: usize) -> Result<SlotAddress, AddressError> {
        if global >= self.total_slots() {
            return Err(AddressError::InvalidSlot {
                slot: global,
                total: self.total_slots(),
            });
        }
        Ok(SlotAddress {
            device: (global / SLOTS_PER_DEVICE) as u8,
            local: (global % SLOTS_PER_DEVICE) as u8,
        })
    }

    pub fn to_global(&self, device: u8, local: u8) -> Result<usize, AddressError> {
        self.check_device(device)?;
        if local as usize >= SLOTS_PER_DEVICE {
            return Err(AddressError::InvalidLocalSlot(local));
        }
        Ok(device as usize * SLOTS_PER_DEVICE + local as usize)
    }

    pub fn check_device(&self, device: u8) -> Result<(), AddressError> {
        if device >= self.device_count {
            return Err(AddressError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_for_every_device_count() {
        for count in 1..=MAX_DEVICES {
            let space = SlotAddressSpace::new(count).unwrap();
            assert_eq!(space.total_slots(), count as usize * 4);
            for device in 0..count {
                for local in 0..4u8 {
                    let global = space.to_global(device, local).unwrap();
                    let addr = space.to_local(global).unwrap();
                    assert_eq!(addr, SlotAddress { device, local });
                    assert_eq!(space.to_global(addr.device, addr.local).unwrap(), global);
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_is_an_error() {
        let space = SlotAddressSpace::new(2).unwrap();
        assert_eq!(
            space.to_local(8),
            Err(AddressError::InvalidSlot { slot: 8, total: 8 })
        );
        assert_eq!(
            space.to_local(usize::MAX),
            Err(AddressError::InvalidSlot { slot: usize::MAX, total: 8 })
        );
        assert_eq!(
            space.to_global(2, 0),
            Err(AddressError::InvalidDevice { device: 2, count: 2 })
        );
        assert_eq!(space.to_global(0, 4), Err(AddressError::InvalidLocalSlot(4)));
    }

    #[test]
    fn test_device_count_bounds() {
        assert!(SlotAddressSpace::new(0).is_err());
        assert!(SlotAddressSpace::new(5).is_err());
    }

    #[test]
    fn test_slot_five_is_device_one_local_one() {
        let space = SlotAddressSpace::new(2).unwrap();
        assert_eq!(space.to_local(5).unwrap(), SlotAddress { device: 1, local: 1 });
    }
}

//! The 64-bit J1939 NAME used for address-claim arbitration.

use std::fmt;

const IDENTITY_MASK: u64 = 0x1F_FFFF;
const IDENTITY_SHIFT: u32 = 0;
const MANUFACTURER_MASK: u64 = 0x7FF;
const MANUFACTURER_SHIFT: u32 = 21;
const ECU_INSTANCE_MASK: u64 = 0x7;
const ECU_INSTANCE_SHIFT: u32 = 32;
const FUNCTION_INSTANCE_MASK: u64 = 0x1F;
const FUNCTION_INSTANCE_SHIFT: u32 = 35;
const FUNCTION_MASK: u64 = 0xFF;
const FUNCTION_SHIFT: u32 = 40;
const VEHICLE_SYSTEM_MASK: u64 = 0x7F;
const VEHICLE_SYSTEM_SHIFT: u32 = 49;
const VEHICLE_SYSTEM_INSTANCE_MASK: u64 = 0xF;
const VEHICLE_SYSTEM_INSTANCE_SHIFT: u32 = 56;
const INDUSTRY_GROUP_MASK: u64 = 0x7;
const INDUSTRY_GROUP_SHIFT: u32 = 60;
const AAC_MASK: u64 = 0x1;
const AAC_SHIFT: u32 = 63;

/// A J1939 NAME. Bit 48 is reserved and always zero in composed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name(u64);

impl Name {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Wire form: 8 bytes little-endian, as carried by an address claim.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_le_bytes(array)))
    }

    #[allow(clippy::too_many_arguments)]
    pub const fn from_fields(
        identity_number: u32,
        manufacturer_code: u16,
        ecu_instance: u8,
        function_instance: u8,
        function: u8,
        vehicle_system: u8,
        vehicle_system_instance: u8,
        industry_group: u8,
        arbitrary_address_capable: u8,
    ) -> Self {
        Self(
            ((identity_number as u64 & IDENTITY_MASK) << IDENTITY_SHIFT)
                | ((manufacturer_code as u64 & MANUFACTURER_MASK) << MANUFACTURER_SHIFT)
                | ((ecu_instance as u64 & ECU_INSTANCE_MASK) << ECU_INSTANCE_SHIFT)
                | ((function_instance as u64 & FUNCTION_INSTANCE_MASK) << FUNCTION_INSTANCE_SHIFT)
                | ((function as u64 & FUNCTION_MASK) << FUNCTION_SHIFT)
                | ((vehicle_system as u64 & VEHICLE_SYSTEM_MASK) << VEHICLE_SYSTEM_SHIFT)
                | ((vehicle_system_instance as u64 & VEHICLE_SYSTEM_INSTANCE_MASK)
                    << VEHICLE_SYSTEM_INSTANCE_SHIFT)
                | ((industry_group as u64 & INDUSTRY_GROUP_MASK) << INDUSTRY_GROUP_SHIFT)
                | ((arbitrary_address_capable as u64 & AAC_MASK) << AAC_SHIFT),
        )
    }

    pub const fn identity_number(self) -> u32 {
        ((self.0 >> IDENTITY_SHIFT) & IDENTITY_MASK) as u32
    }

    pub const fn manufacturer_code(self) -> u16 {
        ((self.0 >> MANUFACTURER_SHIFT) & MANUFACTURER_MASK) as u16
    }

    pub const fn ecu_instance(self) -> u8 {
        ((self.0 >> ECU_INSTANCE_SHIFT) & ECU_INSTANCE_MASK) as u8
    }

    pub const fn function_instance(self) -> u8 {
        ((self.0 >> FUNCTION_INSTANCE_SHIFT) & FUNCTION_INSTANCE_MASK) as u8
    }

    pub const fn function(self) -> u8 {
        ((self.0 >> FUNCTION_SHIFT) & FUNCTION_MASK) as u8
    }

    pub const fn vehicle_system(self) -> u8 {
        ((self.0 >> VEHICLE_SYSTEM_SHIFT) & VEHICLE_SYSTEM_MASK) as u8
    }

    pub const fn vehicle_system_instance(self) -> u8 {
        ((self.0 >> VEHICLE_SYSTEM_INSTANCE_SHIFT) & VEHICLE_SYSTEM_INSTANCE_MASK) as u8
    }

    pub const fn industry_group(self) -> u8 {
        ((self.0 >> INDUSTRY_GROUP_SHIFT) & INDUSTRY_GROUP_MASK) as u8
    }

    pub const fn arbitrary_address_capable(self) -> u8 {
        ((self.0 >> AAC_SHIFT) & AAC_MASK) as u8
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018X}", self.0)
    }
}

//! BLE Service and Characteristic UUIDs.
//!
//! Default UUIDs for the commissioning transport (BTP) GATT profile. Hosts
//! that ride a different profile override them through
//! [`GattProfile`](crate::config::GattProfile).

use uuid::Uuid;

/// Bluetooth SIG base UUID, used to expand 16-bit service ids.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

// BTP Service (16-bit assigned number 0xFFF6)
/// BTP GATT service UUID.
pub const BTP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fff6_0000_1000_8000_00805f9b34fb);
/// BTP C1 characteristic UUID (write, central to peripheral).
pub const BTP_C1_UUID: Uuid = Uuid::from_u128(0x18ee_2ef5_263d_4559_959f_4f9c429f9d11);
/// BTP C2 characteristic UUID (indicate, peripheral to central).
pub const BTP_C2_UUID: Uuid = Uuid::from_u128(0x18ee_2ef5_263d_4559_959f_4f9c429f9d12);
/// BTP C3 characteristic UUID (read, additional advertisement data).
pub const BTP_C3_UUID: Uuid = Uuid::from_u128(0x6463_0238_8772_45f2_b87d_748a83218f04);

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Check if a UUID is one of the BTP characteristics.
pub fn is_btp_characteristic(uuid: &Uuid) -> bool {
    *uuid == BTP_C1_UUID || *uuid == BTP_C2_UUID || *uuid == BTP_C3_UUID
}

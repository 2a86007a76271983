//! Supported device identities

/// One supported (vendor, product) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device is in boot-loader mode and needs an image before streaming
    pub needs_firmware: bool,
}

/// Every device this crate will open, in either mode
pub const DEVICE_IDS: &[DeviceIdentity] = &[
    // Cypress FX3 boot loader
    DeviceIdentity {
        vendor_id: 0x04b4,
        product_id: 0x00f3,
        needs_firmware: true,
    },
    // Cypress FX3 streamer application
    DeviceIdentity {
        vendor_id: 0x04b4,
        product_id: 0x00f1,
        needs_firmware: false,
    },
];

/// Look up a (vendor, product) pair in the identity table
pub fn lookup(vendor_id: u16, product_id: u16) -> Option<&'static DeviceIdentity> {
    DEVICE_IDS
        .iter()
        .find(|id| id.vendor_id == vendor_id && id.product_id == product_id)
}

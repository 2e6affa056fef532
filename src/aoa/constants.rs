use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_IN, LIBUSB_ENDPOINT_OUT, LIBUSB_RECIPIENT_DEVICE, LIBUSB_REQUEST_TYPE_VENDOR,
};
use std::time::Duration;

/// Vendor id devices re-enumerate under once switched to accessory mode.
pub const GOOGLE_VID: u16 = 0x18d1;
/// Accessory-mode product id range (plain, +adb, +audio variants).
pub const ACCESSORY_PID_MIN: u16 = 0x2d00;
pub const ACCESSORY_PID_MAX: u16 = 0x2d05;

//
// Accessory vendor control requests
//
pub const ACCESSORY_GET_PROTOCOL: u8 = 51;
pub const ACCESSORY_SEND_STRING: u8 = 52;
pub const ACCESSORY_START: u8 = 53;

//
// Identity string indices for ACCESSORY_SEND_STRING
//
pub const STRING_MANUFACTURER: u16 = 0;
pub const STRING_MODEL: u16 = 1;
pub const STRING_DESCRIPTION: u16 = 2;
pub const STRING_VERSION: u16 = 3;
pub const STRING_URI: u16 = 4;
pub const STRING_SERIAL: u16 = 5;

/// Identity presented to the device; the companion app matches on
/// manufacturer and model.
pub const ACCESSORY_MANUFACTURER: &str = "DroneBridge";
pub const ACCESSORY_MODEL: &str = "DB USB Bridge";
pub const ACCESSORY_DESCRIPTION: &str = "Ground station USB link";
pub const ACCESSORY_VERSION: &str = "1.0";
pub const ACCESSORY_URI: &str = "https://dronebridge.gitbook.io";
pub const ACCESSORY_SERIAL: &str = "0000000000000001";

/// Bulk IN read size.
pub const USB_READ_BYTES: usize = 1024;

/// Timeout for the leading chunk of a bulk-out frame.
pub const WRITE_FIRST_TIMEOUT: Duration = Duration::from_millis(1000);
/// Timeout for continuation chunks of a fragmented frame.
pub const WRITE_CONT_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout for the keep-alive wake frame.
pub const WAKE_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout for handshake control transfers.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
/// Delay between device scans while waiting for an accessory.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Vendor OUT request type (device recipient)
pub fn request_type_out() -> u8 {
    (LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE | LIBUSB_ENDPOINT_OUT) as u8
}

/// Vendor IN request type (device recipient)
pub fn request_type_in() -> u8 {
    (LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE | LIBUSB_ENDPOINT_IN) as u8
}

/// Convert Duration into libusb timeout (ms); zero means no timeout
pub fn duration_to_timeout(duration: Duration) -> u32 {
    use std::os::raw::c_uint;
    if duration.is_zero() {
        return 0;
    }
    let millis = duration.as_millis();
    if millis == 0 {
        1
    } else if millis > c_uint::MAX as u128 {
        c_uint::MAX as u32
    } else {
        millis as u32
    }
}

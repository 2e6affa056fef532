use std::io;
use std::ptr;
use std::rc::Rc;
use std::thread;

use libusb1_sys as libusb;
use libusb1_sys::constants::{LIBUSB_ENDPOINT_IN, LIBUSB_TRANSFER_TYPE_BULK};
use log::{debug, info, warn};

use super::constants::*;
use super::context::{
    get_device_descriptor, map_libusb_error, read_string_descriptor, LibusbContext,
    LibusbDeviceHandle,
};
use crate::shutdown::ShutdownToken;

/// The claimed accessory interface and its bulk endpoint pair.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AccessoryEndpoints {
    pub(crate) interface: u8,
    pub(crate) in_ep: u8,
    pub(crate) out_ep: u8,
    pub(crate) out_wmax: u16,
}

/// Blocks until a device is available in accessory mode, claimed and ready
/// for bulk transfers. Devices not yet in accessory mode are asked to switch
/// via the vendor handshake and picked up after re-enumeration. Returns
/// `None` when shutdown is requested while still waiting.
pub(crate) fn open_accessory(
    context: &Rc<LibusbContext>,
    shutdown: &ShutdownToken,
) -> io::Result<Option<(LibusbDeviceHandle, AccessoryEndpoints)>> {
    let mut announced = false;
    loop {
        if shutdown.is_triggered() {
            return Ok(None);
        }
        match scan_once(context)? {
            ScanOutcome::Ready(handle, endpoints) => {
                info!(
                    "accessory claimed: iface={} in_ep=0x{:02x} out_ep=0x{:02x} max packet {}",
                    endpoints.interface, endpoints.in_ep, endpoints.out_ep, endpoints.out_wmax
                );
                return Ok(Some((handle, endpoints)));
            }
            ScanOutcome::Switching(count) => {
                info!("asked {count} device(s) to enter accessory mode, waiting for re-enumeration");
            }
            ScanOutcome::Nothing => {
                if !announced {
                    info!("waiting for an android device");
                    announced = true;
                }
            }
        }
        thread::sleep(OPEN_RETRY_DELAY);
    }
}

enum ScanOutcome {
    Ready(LibusbDeviceHandle, AccessoryEndpoints),
    Switching(usize),
    Nothing,
}

fn scan_once(context: &Rc<LibusbContext>) -> io::Result<ScanOutcome> {
    let mut list = ptr::null();
    let count = unsafe { libusb::libusb_get_device_list(context.ptr, &mut list) };
    if count < 0 {
        return Err(map_libusb_error(count as i32));
    }
    let devices = unsafe { std::slice::from_raw_parts(list, count as usize) };
    let outcome = scan_list(context, devices);
    unsafe { libusb::libusb_free_device_list(list, 1) };
    outcome
}

fn scan_list(
    context: &Rc<LibusbContext>,
    devices: &[*mut libusb::libusb_device],
) -> io::Result<ScanOutcome> {
    // A device already in accessory mode wins over any switch candidate.
    for &device in devices {
        let Ok(desc) = get_device_descriptor(device) else {
            continue;
        };
        if !is_accessory_mode(&desc) {
            continue;
        }
        match claim_accessory(context, device, &desc) {
            Ok(ready) => return Ok(ScanOutcome::Ready(ready.0, ready.1)),
            Err(err) => warn!("claiming accessory device failed: {err}"),
        }
    }

    let mut switched = 0;
    for &device in devices {
        let Ok(desc) = get_device_descriptor(device) else {
            continue;
        };
        if is_accessory_mode(&desc) || desc.bDeviceClass == 9 {
            continue;
        }
        if request_accessory_mode(context, device, &desc) {
            switched += 1;
        }
    }
    if switched > 0 {
        Ok(ScanOutcome::Switching(switched))
    } else {
        Ok(ScanOutcome::Nothing)
    }
}

fn is_accessory_mode(desc: &libusb::libusb_device_descriptor) -> bool {
    desc.idVendor == GOOGLE_VID
        && (ACCESSORY_PID_MIN..=ACCESSORY_PID_MAX).contains(&desc.idProduct)
}

fn claim_accessory(
    context: &Rc<LibusbContext>,
    device: *mut libusb::libusb_device,
    desc: &libusb::libusb_device_descriptor,
) -> io::Result<(LibusbDeviceHandle, AccessoryEndpoints)> {
    let endpoints = unsafe { find_accessory_interface(device)? }.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "accessory device exposes no bulk endpoint pair",
        )
    })?;
    let handle = LibusbDeviceHandle::open(context.clone(), device)?;
    handle.set_auto_detach_kernel_driver(true)?;
    handle.claim_interface(i32::from(endpoints.interface))?;
    if let Some(product) = read_string_descriptor(&handle, desc.iProduct) {
        info!("connected to {product}");
    }
    Ok((handle, endpoints))
}

/// Probes a device with the vendor handshake and, when it speaks the
/// accessory protocol, asks it to re-enumerate in accessory mode.
fn request_accessory_mode(
    context: &Rc<LibusbContext>,
    device: *mut libusb::libusb_device,
    desc: &libusb::libusb_device_descriptor,
) -> bool {
    let handle = match LibusbDeviceHandle::open(context.clone(), device) {
        Ok(handle) => handle,
        Err(err) => {
            debug!(
                "cannot open {:04x}:{:04x} for accessory probe: {err}",
                desc.idVendor, desc.idProduct
            );
            return false;
        }
    };
    let version = match read_protocol_version(&handle) {
        Ok(version) if version >= 1 => version,
        Ok(_) | Err(_) => return false,
    };
    debug!(
        "{:04x}:{:04x} supports accessory protocol {version}",
        desc.idVendor, desc.idProduct
    );
    if let Err(err) = send_identity(&handle) {
        warn!("sending accessory identity failed: {err}");
        return false;
    }
    if let Err(err) = start_accessory(&handle) {
        warn!("starting accessory mode failed: {err}");
        return false;
    }
    true
}

fn read_protocol_version(handle: &LibusbDeviceHandle) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    let n = handle.control_in_blocking(
        request_type_in(),
        ACCESSORY_GET_PROTOCOL,
        0,
        0,
        &mut buf,
        HANDSHAKE_TIMEOUT,
    )?;
    if n < 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short accessory protocol response",
        ));
    }
    Ok(u16::from_le_bytes(buf))
}

fn send_identity(handle: &LibusbDeviceHandle) -> io::Result<()> {
    let strings = [
        (STRING_MANUFACTURER, ACCESSORY_MANUFACTURER),
        (STRING_MODEL, ACCESSORY_MODEL),
        (STRING_DESCRIPTION, ACCESSORY_DESCRIPTION),
        (STRING_VERSION, ACCESSORY_VERSION),
        (STRING_URI, ACCESSORY_URI),
        (STRING_SERIAL, ACCESSORY_SERIAL),
    ];
    for (index, value) in strings {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        handle.control_out_blocking(
            request_type_out(),
            ACCESSORY_SEND_STRING,
            0,
            index,
            &data,
            HANDSHAKE_TIMEOUT,
        )?;
    }
    Ok(())
}

fn start_accessory(handle: &LibusbDeviceHandle) -> io::Result<()> {
    handle.control_out_blocking(
        request_type_out(),
        ACCESSORY_START,
        0,
        0,
        &[],
        HANDSHAKE_TIMEOUT,
    )?;
    Ok(())
}

struct ConfigDescriptor(*const libusb::libusb_config_descriptor);

impl ConfigDescriptor {
    unsafe fn active(device: *mut libusb::libusb_device) -> io::Result<Self> {
        let mut ptr = ptr::null();
        let rc = unsafe { libusb::libusb_get_active_config_descriptor(device, &mut ptr) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Self(ptr))
    }

    unsafe fn by_index(device: *mut libusb::libusb_device, index: u8) -> io::Result<Self> {
        let mut ptr = ptr::null();
        let rc = unsafe { libusb::libusb_get_config_descriptor(device, index, &mut ptr) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Self(ptr))
    }
}

impl Drop for ConfigDescriptor {
    fn drop(&mut self) {
        unsafe { libusb::libusb_free_config_descriptor(self.0) };
    }
}

/// Find the vendor specific accessory interface along with its bulk endpoints.
unsafe fn find_accessory_interface(
    device: *mut libusb::libusb_device,
) -> io::Result<Option<AccessoryEndpoints>> {
    let config = match unsafe { ConfigDescriptor::active(device) } {
        Ok(cfg) => cfg,
        Err(err) if err.kind() == io::ErrorKind::NotFound => unsafe {
            ConfigDescriptor::by_index(device, 0)?
        },
        Err(err) => return Err(err),
    };

    let config_ptr = config.0;
    let interface_count = unsafe { (*config_ptr).bNumInterfaces };
    for interface_index in 0..interface_count {
        let interface = unsafe { &*(*config_ptr).interface.add(interface_index as usize) };
        for alt_index in 0..interface.num_altsetting as usize {
            unsafe {
                let descriptor = &*interface.altsetting.add(alt_index);
                if descriptor.bInterfaceClass != 0xff {
                    continue;
                }

                let mut endpoints = AccessoryEndpoints {
                    interface: descriptor.bInterfaceNumber,
                    in_ep: 0,
                    out_ep: 0,
                    out_wmax: 64,
                };

                for ep_index in 0..descriptor.bNumEndpoints as usize {
                    let endpoint = &*descriptor.endpoint.add(ep_index);
                    if endpoint.bmAttributes & 0x3 != LIBUSB_TRANSFER_TYPE_BULK {
                        continue;
                    }
                    if endpoint.bEndpointAddress & LIBUSB_ENDPOINT_IN != 0 {
                        endpoints.in_ep = endpoint.bEndpointAddress;
                    } else {
                        endpoints.out_ep = endpoint.bEndpointAddress;
                        endpoints.out_wmax = endpoint.wMaxPacketSize;
                    }
                }

                if endpoints.in_ep != 0 && endpoints.out_ep != 0 {
                    return Ok(Some(endpoints));
                }
            }
        }
    }

    Ok(None)
}

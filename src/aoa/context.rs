use std::cell::Cell;
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_short, c_void};
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_NOT_SUPPORTED, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
};

use crate::poll_set::{DescriptorSink, PollDescriptor};

use super::constants::duration_to_timeout;

/// RAII wrapper owning a libusb context.
///
/// Event handling is driven from the bridge loop: the backend's pollable
/// descriptors are exported through [`descriptors`](Self::descriptors) and the
/// add/remove notifiers, and completions are dispatched by the non-blocking
/// [`handle_events`](Self::handle_events) pump. No helper thread exists; all
/// transfer callbacks run inline on the loop thread.
pub struct LibusbContext {
    pub(crate) ptr: *mut libusb::libusb_context,
    sink: Cell<*mut Rc<dyn DescriptorSink>>,
}

impl LibusbContext {
    pub fn new() -> io::Result<Rc<Self>> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("libusb init failed: {}", libusb_error_string(rc)),
            ));
        }
        Ok(Rc::new(LibusbContext {
            ptr: ctx,
            sink: Cell::new(ptr::null_mut()),
        }))
    }

    /// Snapshot of the descriptors the backend currently wants polled.
    pub fn descriptors(&self) -> io::Result<Vec<PollDescriptor>> {
        let list = unsafe { libusb::libusb_get_pollfds(self.ptr) };
        if list.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "libusb poll descriptors unavailable on this platform",
            ));
        }
        let mut out = Vec::new();
        unsafe {
            let mut i = 0;
            while !(*list.add(i)).is_null() {
                let pfd = &**list.add(i);
                out.push(PollDescriptor {
                    fd: pfd.fd,
                    events: pfd.events,
                });
                i += 1;
            }
            libusb::libusb_free_pollfds(list);
        }
        Ok(out)
    }

    /// Installs `sink` as the receiver of descriptor add/remove notifications.
    /// Notifications fire inline while [`handle_events`](Self::handle_events)
    /// runs, on the loop thread.
    pub fn register_descriptor_sink(&self, sink: Rc<dyn DescriptorSink>) {
        let boxed = Box::into_raw(Box::new(sink));
        unsafe {
            libusb::libusb_set_pollfd_notifiers(
                self.ptr,
                Some(pollfd_added_trampoline),
                Some(pollfd_removed_trampoline),
                boxed.cast(),
            );
        }
        let old = self.sink.replace(boxed);
        if !old.is_null() {
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    /// Non-blocking completion pump; runs pending transfer callbacks.
    pub fn handle_events(&self) -> io::Result<()> {
        self.pump(Duration::ZERO)
    }

    /// Bounded completion pump, used while draining cancelled transfers.
    pub(crate) fn handle_events_for(&self, timeout: Duration) -> io::Result<()> {
        self.pump(timeout)
    }

    fn pump(&self, timeout: Duration) -> io::Result<()> {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libusb::libusb_handle_events_timeout_completed(self.ptr, &mut tv, ptr::null_mut())
        };
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }
}

impl Drop for LibusbContext {
    fn drop(&mut self) {
        let sink = self.sink.get();
        unsafe { libusb::libusb_exit(self.ptr) };
        // No callback can fire past libusb_exit; reclaim the notifier state.
        if !sink.is_null() {
            unsafe { drop(Box::from_raw(sink)) };
        }
    }
}

extern "system" fn pollfd_added_trampoline(fd: c_int, events: c_short, user_data: *mut c_void) {
    let sink = unsafe { &*(user_data as *const Rc<dyn DescriptorSink>) };
    sink.descriptor_added(fd, events);
}

extern "system" fn pollfd_removed_trampoline(fd: c_int, user_data: *mut c_void) {
    let sink = unsafe { &*(user_data as *const Rc<dyn DescriptorSink>) };
    sink.descriptor_removed(fd);
}

/// Wrapper around a libusb device handle with automatic close semantics.
#[derive(Clone)]
pub(crate) struct LibusbDeviceHandle {
    _context: Rc<LibusbContext>,
    handle: Rc<HandleWrapper>,
}

struct HandleWrapper(*mut libusb::libusb_device_handle);

impl Drop for HandleWrapper {
    fn drop(&mut self) {
        unsafe { libusb::libusb_close(self.0) };
    }
}

impl LibusbDeviceHandle {
    pub(crate) fn open(
        context: Rc<LibusbContext>,
        device: *mut libusb::libusb_device,
    ) -> io::Result<Self> {
        let mut handle = ptr::null_mut();
        let rc = unsafe { libusb::libusb_open(device, &mut handle) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Self {
            _context: context,
            handle: Rc::new(HandleWrapper(handle)),
        })
    }

    pub(crate) fn raw(&self) -> *mut libusb::libusb_device_handle {
        self.handle.0
    }

    pub(crate) fn set_auto_detach_kernel_driver(&self, enable: bool) -> io::Result<()> {
        let flag = if enable { 1 } else { 0 };
        let rc = unsafe { libusb::libusb_set_auto_detach_kernel_driver(self.handle.0, flag) };
        if rc < 0 && rc != LIBUSB_ERROR_NOT_SUPPORTED {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn claim_interface(&self, interface: i32) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.handle.0, interface) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn release_interface(&self, interface: i32) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_release_interface(self.handle.0, interface) };
        if rc < 0 && rc != LIBUSB_ERROR_NO_DEVICE && rc != LIBUSB_ERROR_NOT_FOUND {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn control_out_blocking(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let millis = duration_to_timeout(timeout);
        let rc = unsafe {
            libusb::libusb_control_transfer(
                self.handle.0,
                request_type,
                request,
                value,
                index,
                data.as_ptr() as *mut u8,
                data.len() as u16,
                millis,
            )
        };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(rc as usize)
    }

    pub(crate) fn control_in_blocking(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let millis = duration_to_timeout(timeout);
        let rc = unsafe {
            libusb::libusb_control_transfer(
                self.handle.0,
                request_type,
                request,
                value,
                index,
                buf.as_mut_ptr(),
                buf.len() as u16,
                millis,
            )
        };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(rc as usize)
    }
}

pub(crate) fn libusb_error_string(code: i32) -> String {
    unsafe {
        let ptr = libusb::libusb_error_name(code);
        if ptr.is_null() {
            format!("libusb error {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

pub(crate) fn map_libusb_error(code: i32) -> io::Error {
    let kind = match code {
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_PIPE => io::ErrorKind::BrokenPipe,
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, libusb_error_string(code))
}

pub(crate) fn get_device_descriptor(
    device: *mut libusb::libusb_device,
) -> io::Result<libusb::libusb_device_descriptor> {
    let mut desc = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
    let rc = unsafe { libusb::libusb_get_device_descriptor(device, desc.as_mut_ptr()) };
    if rc < 0 {
        return Err(map_libusb_error(rc));
    }
    Ok(unsafe { desc.assume_init() })
}

pub(crate) fn read_string_descriptor(handle: &LibusbDeviceHandle, index: u8) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mut buf = vec![0u8; 255];
    let len = unsafe {
        libusb::libusb_get_string_descriptor_ascii(
            handle.raw(),
            index,
            buf.as_mut_ptr(),
            buf.len() as c_int,
        )
    };
    if len < 0 {
        return None;
    }
    buf.truncate(len as usize);
    String::from_utf8(buf).ok()
}

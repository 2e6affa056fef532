use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::ops::Range;
use std::os::raw::c_int;
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_IN, LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED,
    LIBUSB_TRANSFER_ERROR, LIBUSB_TRANSFER_NO_DEVICE, LIBUSB_TRANSFER_OVERFLOW,
    LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT, LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{debug, error, warn};

use super::constants::*;
use super::context::{map_libusb_error, LibusbContext, LibusbDeviceHandle};
use super::device;
use crate::framing;
use crate::shutdown::ShutdownToken;

/// Bulk transfer plumbing for a claimed accessory.
///
/// Reads are posted once and resubmitted from their completion callback until
/// the device goes away. Writes copy the frame into per-transfer buffers, so
/// the caller's frame buffer is reusable as soon as submission returns while
/// submission order still fixes the on-wire order. Completed inbound chunks
/// queue up and are drained by the bridge loop after each event pump.
pub struct AoaTransport {
    context: Rc<LibusbContext>,
    handle: LibusbDeviceHandle,
    interface: u8,
    in_ep: u8,
    out_ep: u8,
    max_packet: u16,
    shared: Rc<TransferShared>,
}

struct TransferShared {
    connected: Cell<bool>,
    closing: Cell<bool>,
    inflight: Cell<usize>,
    read_transfer: Cell<*mut libusb::libusb_transfer>,
    out_transfers: RefCell<Vec<*mut libusb::libusb_transfer>>,
    inbound: RefCell<VecDeque<Vec<u8>>>,
}

struct TransferState {
    shared: Rc<TransferShared>,
    buf: Vec<u8>,
}

impl AoaTransport {
    /// Blocks until an accessory is claimed (see [`device`] for the
    /// handshake); `None` when shutdown was requested first.
    pub fn open(
        context: Rc<LibusbContext>,
        shutdown: &ShutdownToken,
    ) -> io::Result<Option<Self>> {
        let Some((handle, endpoints)) = device::open_accessory(&context, shutdown)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            context,
            handle,
            interface: endpoints.interface,
            in_ep: endpoints.in_ep,
            out_ep: endpoints.out_ep,
            max_packet: endpoints.out_wmax,
            shared: Rc::new(TransferShared {
                connected: Cell::new(true),
                closing: Cell::new(false),
                inflight: Cell::new(0),
                read_transfer: Cell::new(ptr::null_mut()),
                out_transfers: RefCell::new(Vec::new()),
                inbound: RefCell::new(VecDeque::new()),
            }),
        }))
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.get()
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet
    }

    /// Posts the persistent bulk-in read. It re-arms itself on completion; a
    /// failed (re)submission marks the link disconnected.
    pub fn submit_read(&self) {
        if let Err(err) = self.submit(self.in_ep, vec![0u8; USB_READ_BYTES], Duration::ZERO) {
            error!("submitting bulk-in read failed: {err}");
            self.shared.connected.set(false);
        }
    }

    /// Queues a complete frame on the bulk-out endpoint, splitting it into
    /// max-packet-size transfers when needed. The header travels only in the
    /// leading chunk; its length field already declares the full payload.
    pub fn submit_write(&self, frame: &[u8]) {
        if !self.connected() {
            return;
        }
        for (i, span) in chunk_spans(frame.len(), usize::from(self.max_packet))
            .into_iter()
            .enumerate()
        {
            let timeout = if i == 0 {
                WRITE_FIRST_TIMEOUT
            } else {
                WRITE_CONT_TIMEOUT
            };
            if let Err(err) = self.submit(self.out_ep, frame[span].to_vec(), timeout) {
                error!("submitting bulk-out transfer failed: {err}");
                self.shared.connected.set(false);
                return;
            }
        }
    }

    /// Sends the one-byte wake frame that unblocks the accessory-side reader.
    pub fn send_wake(&self) {
        if !self.connected() {
            return;
        }
        if let Err(err) = self.submit(self.out_ep, framing::wake_frame().to_vec(), WAKE_TIMEOUT) {
            error!("submitting timeout wake transfer failed: {err}");
            self.shared.connected.set(false);
        }
    }

    /// Next completed inbound chunk, in completion order.
    pub fn next_inbound(&self) -> Option<Vec<u8>> {
        self.shared.inbound.borrow_mut().pop_front()
    }

    fn submit(&self, endpoint: u8, buf: Vec<u8>, timeout: Duration) -> io::Result<()> {
        let transfer = unsafe { libusb::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "failed to allocate libusb transfer",
            ));
        }
        let state = Box::into_raw(Box::new(TransferState {
            shared: self.shared.clone(),
            buf,
        }));
        unsafe {
            (*transfer).dev_handle = self.handle.raw();
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            (*transfer).timeout = duration_to_timeout(timeout);
            (*transfer).callback = transfer_complete;
            (*transfer).user_data = state.cast();
            (*transfer).buffer = (*state).buf.as_mut_ptr();
            (*transfer).length = (*state).buf.len() as c_int;
        }
        // Registered before submission so the completion can unregister.
        self.shared.inflight.set(self.shared.inflight.get() + 1);
        if endpoint == self.in_ep {
            self.shared.read_transfer.set(transfer);
        } else {
            self.shared.out_transfers.borrow_mut().push(transfer);
        }
        let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
        if rc < 0 {
            if endpoint == self.in_ep {
                self.shared.read_transfer.set(ptr::null_mut());
            } else {
                self.shared.out_transfers.borrow_mut().retain(|&p| p != transfer);
            }
            self.shared.inflight.set(self.shared.inflight.get() - 1);
            unsafe {
                drop(Box::from_raw(state));
                libusb::libusb_free_transfer(transfer);
            }
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }
}

impl Drop for AoaTransport {
    fn drop(&mut self) {
        self.shared.closing.set(true);
        let read = self.shared.read_transfer.get();
        if !read.is_null() {
            unsafe { libusb::libusb_cancel_transfer(read) };
        }
        let pending: Vec<_> = self.shared.out_transfers.borrow().clone();
        for transfer in pending {
            unsafe { libusb::libusb_cancel_transfer(transfer) };
        }
        let mut rounds = 0;
        while self.shared.inflight.get() > 0 && rounds < 100 {
            if self
                .context
                .handle_events_for(Duration::from_millis(10))
                .is_err()
            {
                break;
            }
            rounds += 1;
        }
        if self.shared.inflight.get() > 0 {
            warn!(
                "{} transfer(s) still pending while closing accessory",
                self.shared.inflight.get()
            );
        }
        let _ = self.handle.release_interface(i32::from(self.interface));
    }
}

/// Completion dispatch shared by both endpoints; runs inline on the loop
/// thread during the event pump.
extern "system" fn transfer_complete(transfer: *mut libusb::libusb_transfer) {
    let state_ptr = unsafe { (*transfer).user_data as *mut TransferState };
    let shared = unsafe { (*state_ptr).shared.clone() };
    let status = unsafe { (*transfer).status };
    let inbound = unsafe { (*transfer).endpoint } & LIBUSB_ENDPOINT_IN != 0;

    let mut rearm = false;
    match status {
        s if s == LIBUSB_TRANSFER_COMPLETED => {
            if inbound {
                let n = unsafe { (*transfer).actual_length } as usize;
                debug!("received {n} byte(s)");
                let chunk = unsafe { (&(*state_ptr).buf)[..n].to_vec() };
                shared.inbound.borrow_mut().push_back(chunk);
                rearm = true;
            }
        }
        s if s == LIBUSB_TRANSFER_CANCELLED => warn!("transfer cancelled"),
        s if s == LIBUSB_TRANSFER_NO_DEVICE => {
            warn!("no device");
            shared.connected.set(false);
        }
        s if s == LIBUSB_TRANSFER_TIMED_OUT => {
            if inbound {
                rearm = true;
            }
        }
        s if s == LIBUSB_TRANSFER_STALL => error!("transfer stall"),
        s if s == LIBUSB_TRANSFER_OVERFLOW => error!("transfer overflow"),
        s if s == LIBUSB_TRANSFER_ERROR => error!("transfer error"),
        s => error!("transfer finished with unexpected status {s}"),
    }

    if shared.closing.get() {
        rearm = false;
    }
    if rearm {
        let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
        if rc >= 0 {
            return;
        }
        error!("resubmitting bulk-in read failed: {}", map_libusb_error(rc));
        shared.connected.set(false);
    }
    release_transfer(&shared, transfer, state_ptr);
}

fn release_transfer(
    shared: &TransferShared,
    transfer: *mut libusb::libusb_transfer,
    state_ptr: *mut TransferState,
) {
    if shared.read_transfer.get() == transfer {
        shared.read_transfer.set(ptr::null_mut());
    } else {
        shared.out_transfers.borrow_mut().retain(|&p| p != transfer);
    }
    shared.inflight.set(shared.inflight.get() - 1);
    unsafe {
        drop(Box::from_raw(state_ptr));
        libusb::libusb_free_transfer(transfer);
    }
}

/// Byte ranges of the bulk-out transfers carrying one frame: full packets up
/// to the last, which takes the remainder.
fn chunk_spans(total: usize, max_packet: usize) -> Vec<Range<usize>> {
    if max_packet == 0 || total <= max_packet {
        return vec![0..total];
    }
    let mut spans = Vec::with_capacity(total.div_ceil(max_packet));
    let mut start = 0;
    while start < total {
        let end = (start + max_packet).min(total);
        spans.push(start..end);
        start = end;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::HEADER_LEN;

    #[test]
    fn short_frame_is_a_single_transfer() {
        assert_eq!(chunk_spans(HEADER_LEN + 5, 512), vec![0..11]);
    }

    #[test]
    fn fragmented_frame_spans() {
        // A 40-byte payload over 16-byte packets: header + 10, 16, 14.
        let spans = chunk_spans(HEADER_LEN + 40, 16);
        assert_eq!(spans, vec![0..16, 16..32, 32..46]);
        assert_eq!(spans[0].len(), 16);
        assert_eq!(spans[1].len(), 16);
        assert_eq!(spans[2].len(), 14);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_span() {
        assert_eq!(chunk_spans(32, 16), vec![0..16, 16..32]);
    }

    #[test]
    fn frame_matching_packet_size_stays_whole() {
        assert_eq!(chunk_spans(16, 16), vec![0..16]);
    }
}

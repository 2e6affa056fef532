use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::aoa::{AoaTransport, LibusbContext};
use crate::endpoints::{LocalEndpoints, ModuleConfig};
use crate::framing::{Deframer, FrameBuffer};
use crate::poll_set::PollSet;
use crate::shutdown::ShutdownToken;

/// Longest interval the bridge may stay silent towards the device; both the
/// poll timeout and the keep-alive deadline.
pub const MAX_WRITE_TIMEOUT: Duration = Duration::from_millis(300);

/// Single-threaded event loop bridging the local module sockets and the
/// accessory bulk pipe.
pub struct Bridge {
    config: ModuleConfig,
    shutdown: ShutdownToken,
    context: Rc<LibusbContext>,
}

impl Bridge {
    pub fn new(config: ModuleConfig, shutdown: ShutdownToken) -> io::Result<Self> {
        Ok(Self {
            config,
            shutdown,
            context: LibusbContext::new()?,
        })
    }

    /// Runs until shutdown is requested or an unrecoverable fault occurs.
    ///
    /// The accessory is opened first (blocking, interruptible), then the
    /// local sockets, then the unified descriptor registry. Device loss flows
    /// through the recovery path; local socket faults are logged and the loop
    /// keeps going.
    pub fn run(&self) -> io::Result<()> {
        let Some(mut transport) = AoaTransport::open(self.context.clone(), &self.shutdown)?
        else {
            return Ok(());
        };
        let Some(endpoints) = LocalEndpoints::open(&self.config, &self.shutdown)? else {
            return Ok(());
        };
        let locals = endpoints.active();

        let poll_set = Rc::new(RefCell::new(PollSet::new()));
        {
            let mut set = poll_set.borrow_mut();
            for &(_, fd) in &locals {
                set.push_local(fd);
            }
            for desc in self.context.descriptors()? {
                set.add_usb(desc.fd, desc.events);
            }
        }
        self.context.register_descriptor_sink(poll_set.clone());

        info!("bridge started");
        transport.submit_read();

        let mut frame = FrameBuffer::new();
        let mut deframer = Deframer::new();
        let mut last_write: Option<Instant> = None;

        while !self.shutdown.is_triggered() {
            if !transport.connected() {
                warn!("connection lost to accessory");
                drop(transport);
                frame.reset_header();
                deframer.reset();
                last_write = None;
                let Some(next) = AoaTransport::open(self.context.clone(), &self.shutdown)?
                else {
                    break;
                };
                transport = next;
                info!("connection re-established");
                transport.submit_read();
            }

            let polled = poll_set
                .borrow_mut()
                .poll(MAX_WRITE_TIMEOUT.as_millis() as i32);
            let ready = match polled {
                Ok(0) => {
                    transport.send_wake();
                    last_write = Some(Instant::now());
                    continue;
                }
                Ok(_) => poll_set.borrow().ready(),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("poll failed: {err}");
                    return Err(err);
                }
            };

            let mut usb_activity = false;
            let mut dead_usb: Vec<RawFd> = Vec::new();
            for item in &ready {
                if item.index < locals.len() {
                    if item.revents & libc::POLLIN == 0 {
                        continue;
                    }
                    let (port, _) = locals[item.index];
                    match endpoints.read_into(port, frame.payload_mut()) {
                        Ok(n) if n > 0 => match frame.framed(port, n) {
                            Ok(bytes) => {
                                transport.submit_write(bytes);
                                last_write = Some(Instant::now());
                            }
                            Err(err) => error!("framing {} data failed: {err}", port.name()),
                        },
                        Ok(_) => {}
                        Err(err) => error!("reading from {} module failed: {err}", port.name()),
                    }
                } else {
                    usb_activity = true;
                    if item.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                        dead_usb.push(item.fd);
                    }
                }
            }

            // One non-blocking pump per wakeup regardless of how many USB
            // descriptors fired; completions run inline here.
            if usb_activity {
                if let Err(err) = self.context.handle_events() {
                    error!("usb event handling failed: {err}");
                }
            }
            for fd in dead_usb {
                poll_set.borrow_mut().remove(fd);
            }

            while let Some(chunk) = transport.next_inbound() {
                deframer.feed(&chunk, |port, payload| endpoints.route(port, payload));
            }

            if last_write.map_or(true, |at| at.elapsed() >= MAX_WRITE_TIMEOUT) {
                transport.send_wake();
                last_write = Some(Instant::now());
            }
        }

        info!("closing sockets");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_deadline() {
        let overdue: Option<Instant> = None;
        assert!(overdue.map_or(true, |at: Instant| at.elapsed() >= MAX_WRITE_TIMEOUT));

        let fresh = Some(Instant::now());
        assert!(!fresh.map_or(true, |at| at.elapsed() >= MAX_WRITE_TIMEOUT));

        let stale = Instant::now().checked_sub(MAX_WRITE_TIMEOUT * 2);
        assert!(stale.map_or(true, |at| at.elapsed() >= MAX_WRITE_TIMEOUT));
    }
}

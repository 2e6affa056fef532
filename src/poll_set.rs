use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;

use log::{error, info};

/// Upper bound on the combined local + USB descriptor count.
pub const MAX_POLL_FDS: usize = 16;

/// One pollable descriptor as reported by the USB backend.
#[derive(Clone, Copy, Debug)]
pub struct PollDescriptor {
    pub fd: RawFd,
    pub events: i16,
}

/// Readiness of one registry position after a poll wakeup.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub index: usize,
    pub fd: RawFd,
    pub revents: i16,
}

/// Receiver of descriptor change notifications from the USB backend.
///
/// The backend may reuse descriptor numbers across remove/add cycles, so the
/// registry classifies entries by position rather than by value.
pub trait DescriptorSink {
    fn descriptor_added(&self, fd: RawFd, events: i16);
    fn descriptor_removed(&self, fd: RawFd);
}

/// Contiguous poll array: a fixed prefix of local socket descriptors followed
/// by the USB backend's dynamic descriptor set.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    local: usize,
}

impl PollSet {
    pub fn new() -> Self {
        Self {
            fds: Vec::with_capacity(MAX_POLL_FDS),
            local: 0,
        }
    }

    /// Appends a local socket descriptor, polled for input. Local descriptors
    /// must all be registered before the first USB descriptor.
    pub fn push_local(&mut self, fd: RawFd) {
        if self.fds.len() >= MAX_POLL_FDS {
            error!("cannot add local descriptor {fd} to poll set, array is full");
            return;
        }
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.local += 1;
    }

    /// Appends a USB descriptor with the event mask the backend asked for.
    pub fn add_usb(&mut self, fd: RawFd, events: i16) {
        if self.fds.len() >= MAX_POLL_FDS {
            error!("cannot add usb descriptor {fd} to poll set, array is full");
            return;
        }
        info!("adding usb descriptor {fd} to poll set");
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
    }

    /// Removes the first entry matching `fd`, shifting later entries down.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(index) = self.fds.iter().position(|p| p.fd == fd) {
            info!("removing descriptor at position {index} from poll set");
            self.fds.remove(index);
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn local_len(&self) -> usize {
        self.local
    }

    pub fn is_local(&self, index: usize) -> bool {
        index < self.local
    }

    /// Blocks until readiness or timeout; returns the ready descriptor count.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Positions with non-zero revents after the last poll, in registry order.
    pub fn ready(&self) -> Vec<Readiness> {
        self.fds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents != 0)
            .map(|(index, p)| Readiness {
                index,
                fd: p.fd,
                revents: p.revents,
            })
            .collect()
    }

    #[cfg(test)]
    fn fd_at(&self, index: usize) -> RawFd {
        self.fds[index].fd
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSink for RefCell<PollSet> {
    fn descriptor_added(&self, fd: RawFd, events: i16) {
        self.borrow_mut().add_usb(fd, events);
    }

    fn descriptor_removed(&self, fd: RawFd) {
        self.borrow_mut().remove(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_prefix_stays_fixed_across_usb_churn() {
        let mut set = PollSet::new();
        set.push_local(3);
        set.push_local(4);
        set.add_usb(10, libc::POLLIN);
        set.add_usb(11, libc::POLLOUT);
        set.add_usb(12, libc::POLLIN);
        assert_eq!(set.local_len(), 2);
        assert_eq!(set.len(), 5);

        set.remove(11);
        assert_eq!(set.len(), 4);
        assert_eq!(set.fd_at(0), 3);
        assert_eq!(set.fd_at(1), 4);
        assert_eq!(set.fd_at(2), 10);
        assert_eq!(set.fd_at(3), 12);
        assert!(set.is_local(1));
        assert!(!set.is_local(2));
    }

    #[test]
    fn remove_unknown_fd_is_a_no_op() {
        let mut set = PollSet::new();
        set.push_local(3);
        set.add_usb(10, libc::POLLIN);
        set.remove(99);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn full_set_drops_new_descriptors() {
        let mut set = PollSet::new();
        for fd in 0..MAX_POLL_FDS as RawFd {
            set.add_usb(fd, libc::POLLIN);
        }
        assert_eq!(set.len(), MAX_POLL_FDS);
        set.add_usb(100, libc::POLLIN);
        assert_eq!(set.len(), MAX_POLL_FDS);
    }

    #[test]
    fn sink_mutates_through_shared_cell() {
        let set = RefCell::new(PollSet::new());
        set.borrow_mut().push_local(5);
        set.descriptor_added(20, libc::POLLIN);
        set.descriptor_added(21, libc::POLLIN);
        set.descriptor_removed(20);
        let set = set.borrow();
        assert_eq!(set.len(), 2);
        assert_eq!(set.fd_at(1), 21);
        assert_eq!(set.local_len(), 1);
    }
}

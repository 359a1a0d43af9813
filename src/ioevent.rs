use std::collections::HashMap;
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use eventfd::{EfdFlags, EventFd};

use crate::error::{Result, TransportError};

/// One registered fast-path binding: a guest-physical address plus the
/// 32-bit value that must match for the write to count as a notify
/// (§4.8, §6 `QUEUE_NOTIFY` "datamatch = queue id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct IoEventKey {
    addr: u64,
    datamatch: u32,
}

struct Registration {
    eventfd: EventFd,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// Demultiplexes guest writes to registered `(addr, datamatch)` pairs into
/// a userspace callback (C2, §4.8). Each registration is backed by an
/// eventfd; when the host cannot install the kernel fast path (or the
/// caller explicitly asks for user-space polling), a single background
/// thread epolls every registered eventfd and invokes the matching
/// callback as each one becomes readable.
///
/// This mirrors the teacher crate's own use of the `eventfd` and `epoll`
/// crates for NIC interrupt delivery (`src/interrupts.rs`), generalized
/// from one device's queues to the whole VM's ioeventfd-backed
/// notifications.
pub struct IoEventDispatcher {
    by_fd: Arc<Mutex<HashMap<RawFd, Registration>>>,
    by_key: Mutex<HashMap<IoEventKey, RawFd>>,
    epoll_fd: RawFd,
    worker: Option<JoinHandle<()>>,
    stop_fd: EventFd,
}

impl IoEventDispatcher {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll::create(false).map_err(TransportError::Io)?;
        let stop_fd = EventFd::new(0, EfdFlags::EFD_NONBLOCK).map_err(TransportError::Io)?;

        epoll::ctl(
            epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            stop_fd.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, stop_fd.as_raw_fd() as u64),
        )
        .map_err(TransportError::Io)?;

        let by_fd = Arc::new(Mutex::new(HashMap::new()));
        let worker_map = by_fd.clone();
        let stop_raw_fd = stop_fd.as_raw_fd();
        let worker = thread::spawn(move || Self::run(epoll_fd, stop_raw_fd, worker_map));

        Ok(IoEventDispatcher {
            by_fd,
            by_key: Mutex::new(HashMap::new()),
            epoll_fd,
            worker: Some(worker),
            stop_fd,
        })
    }

    /// Registers `(addr, datamatch)`; `callback` runs on the dispatcher's
    /// background thread whenever the bound eventfd is signaled (i.e. the
    /// host kernel observed the matching guest write). Returns the raw fd
    /// so the caller can hand it to `VmInterface::install_ioeventfd` or to
    /// a vhost-accelerated back-end via `notify_vq_eventfd`.
    pub fn register<F>(&self, addr: u64, datamatch: u32, callback: F) -> Result<RawFd>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let eventfd = EventFd::new(0, EfdFlags::EFD_NONBLOCK).map_err(TransportError::Io)?;
        let fd = eventfd.as_raw_fd();

        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
        )
        .map_err(TransportError::Io)?;

        self.by_fd.lock().unwrap().insert(
            fd,
            Registration {
                eventfd,
                callback: Box::new(callback),
            },
        );
        self.by_key
            .lock()
            .unwrap()
            .insert(IoEventKey { addr, datamatch }, fd);
        Ok(fd)
    }

    pub fn unregister(&self, addr: u64, datamatch: u32) -> Result<()> {
        let key = IoEventKey { addr, datamatch };
        let fd = self.by_key.lock().unwrap().remove(&key);
        if let Some(fd) = fd {
            if let Some(reg) = self.by_fd.lock().unwrap().remove(&fd) {
                let _ = epoll::ctl(
                    self.epoll_fd,
                    epoll::ControlOptions::EPOLL_CTL_DEL,
                    reg.eventfd.as_raw_fd(),
                    epoll::Event::new(epoll::Events::empty(), 0),
                );
            }
        }
        Ok(())
    }

    fn run(epoll_fd: RawFd, stop_fd: RawFd, by_fd: Arc<Mutex<HashMap<RawFd, Registration>>>) {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 64];
        loop {
            let n = match epoll::wait(epoll_fd, -1, &mut events) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            };

            for event in &events[..n] {
                let fd = event.data as RawFd;
                if fd == stop_fd {
                    return;
                }
                let guard = by_fd.lock().unwrap();
                if let Some(reg) = guard.get(&fd) {
                    let mut buf = [0u8; 8];
                    let mut eventfd_ref = &reg.eventfd;
                    let _ = eventfd_ref.read(&mut buf);
                    (reg.callback)();
                }
            }
        }
    }
}

impl Drop for IoEventDispatcher {
    fn drop(&mut self) {
        let mut stop = &self.stop_fd;
        let _ = stop.write(&1u64.to_ne_bytes());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let _ = epoll::close(self.epoll_fd);
    }
}

//! One UDP socket per path.
//!
//! The socket is bound to the path's local address (by default a wildcard
//!  with an OS-chosen ephemeral port), connected to the configured remote -
//!  which makes the kernel enforce the peer-identity filter on receive -
//!  and switched to non-blocking mode. Sends happen on the caller's thread;
//!  a dedicated receive thread drains the socket into a bounded queue that
//!  evicts its oldest entry on overflow (for a real-time stream, fresh data
//!  beats stale data).

use crate::chunk;
use crate::error::TransportError;
use crate::path::{PathConfig, PathCounters};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Sleep while the socket has nothing for us. Short enough that shutdown
///  and late datagrams are picked up promptly.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

struct ReceiveQueue {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
}

impl ReceiveQueue {
    fn new(capacity: usize) -> ReceiveQueue {
        ReceiveQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns true if an older datagram was evicted to make room.
    fn push(&self, datagram: Bytes) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let overflow = queue.len() >= self.capacity;
        if overflow {
            queue.pop_front();
        }
        queue.push_back(datagram);
        overflow
    }

    fn drain(&self, max: usize) -> Vec<Bytes> {
        let mut queue = self.queue.lock().unwrap();
        let count = usize::min(max, queue.len());
        queue.drain(..count).collect()
    }
}

pub struct PathEndpoint {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    queue: Arc<ReceiveQueue>,
    counters: Arc<PathCounters>,
    running: Arc<AtomicBool>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    datagram_size: usize,
    poll_cap: usize,
}

impl PathEndpoint {
    /// Binds and connects the socket. Failure here is fatal and propagates
    ///  to the engine; every later socket error is counted and logged only.
    pub fn new(
        path: &PathConfig,
        payload_size: usize,
        queue_capacity: usize,
        poll_cap: usize,
    ) -> Result<PathEndpoint, TransportError> {
        let local = path.local.unwrap_or_else(|| {
            if path.remote.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            }
            else {
                "[::]:0".parse().unwrap()
            }
        });

        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Socket {
            path: path.remote,
            source,
        })?;
        socket
            .connect(path.remote)
            .map_err(|source| TransportError::Socket {
                path: path.remote,
                source,
            })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| TransportError::Socket {
                path: path.remote,
                source,
            })?;

        let local_addr = socket.local_addr().map_err(|source| TransportError::Socket {
            path: path.remote,
            source,
        })?;
        info!("path endpoint up: {:?} -> {:?}", local_addr, path.remote);

        Ok(PathEndpoint {
            remote: path.remote,
            socket: Arc::new(socket),
            queue: Arc::new(ReceiveQueue::new(queue_capacity)),
            counters: Arc::new(PathCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            receive_thread: Mutex::new(None),
            datagram_size: chunk::HEADER_SIZE + payload_size,
            poll_cap,
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket
            .local_addr()
            .map_err(|source| TransportError::Socket {
                path: self.remote,
                source,
            })
    }

    pub fn counters(&self) -> Arc<PathCounters> {
        self.counters.clone()
    }

    /// Non-blocking, best-effort send of one serialized chunk. A full
    ///  kernel buffer drops the datagram silently apart from the counters.
    pub fn send(&self, datagram: &[u8]) {
        match self.socket.send(datagram) {
            Ok(_) => {
                self.counters.record_sent();
                trace!("sent {} bytes to {:?}", datagram.len(), self.remote);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.counters.record_send_drop();
                self.counters.record_lost();
                trace!("kernel buffer full, dropping datagram to {:?}", self.remote);
            }
            Err(e) => {
                self.counters.record_send_drop();
                self.counters.record_lost();
                warn!("send to {:?} failed: {}", self.remote, e);
            }
        }
    }

    /// Starts the receive thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("endpoint for {:?} is already running", self.remote);
            return;
        }

        let socket = self.socket.clone();
        let queue = self.queue.clone();
        let counters = self.counters.clone();
        let running = self.running.clone();
        let remote = self.remote;
        let datagram_size = self.datagram_size;

        let handle = std::thread::spawn(move || {
            let mut buf = vec![0u8; datagram_size];
            while running.load(Ordering::Relaxed) {
                match socket.recv(&mut buf) {
                    Ok(len) => {
                        counters.record_received();
                        if queue.push(Bytes::copy_from_slice(&buf[..len])) {
                            counters.record_queue_overflow();
                            debug!("receive queue for {:?} overflowed, evicted oldest", remote);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(IDLE_SLEEP);
                    }
                    Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                        // ICMP port-unreachable bounce from an absent peer;
                        //  treated like an empty socket
                        trace!("connection refused on {:?}", remote);
                        std::thread::sleep(IDLE_SLEEP);
                    }
                    Err(e) => {
                        error!("receive error on {:?}: {}", remote, e);
                        std::thread::sleep(IDLE_SLEEP);
                    }
                }
            }
            debug!("receive thread for {:?} exiting", remote);
        });
        *self.receive_thread.lock().unwrap() = Some(handle);
    }

    /// Hands out up to `receive_poll_cap` queued datagrams.
    pub fn poll_receive(&self) -> Vec<Bytes> {
        self.queue.drain(self.poll_cap)
    }

    /// Signals the receive thread and joins it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.receive_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("endpoint for {:?} stopped", self.remote);
    }
}

impl Drop for PathEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Pooled UDP socket handles over the network stack
//!
//! The stack delivers datagrams in callback context; consumers want a
//! blocking receive with a timeout. Each slot in the fixed-size pool bridges
//! the two with a bounded queue: the producer side (the shared dispatch
//! routine) never blocks and counts drops when the queue is full, the
//! consumer side blocks with a caller-supplied timeout. Exactly one consumer
//! per slot.
//!
//! A slot may instead register a callback, which the dispatch routine invokes
//! inline without holding the pool lock; callback delivery and blocking
//! receive are mutually exclusive on one slot.
//!
//! Closing a slot drains its queue and enqueues a sentinel so a receiver
//! blocked in [`SocketPool::recv`] wakes with an error instead of waiting out
//! its timeout.

use super::stack::{LinkState, NetStack, StackHandle};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Number of socket slots in the pool
pub const MAX_SOCKETS: usize = 4;
/// Bounded depth of each slot's receive queue
pub const RECV_QUEUE_LEN: usize = 8;
/// Per-datagram storage capacity; longer datagrams are truncated, not dropped
pub const MAX_PAYLOAD_SIZE: usize = 1472;

/// Inline receive callback; returns whether the datagram was consumed
pub type RecvCallback = Arc<dyn Fn(SocketAddrV4, &[u8]) -> bool + Send + Sync>;

/// Handle to a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketId(usize);

#[derive(Debug)]
struct Datagram {
    remote: SocketAddrV4,
    data: Vec<u8>,
}

enum RxItem {
    Datagram(Datagram),
    /// Sentinel that wakes a blocked receiver when the slot closes
    Closing,
}

#[derive(Default)]
struct Slot {
    in_use: bool,
    bound: bool,
    closing: bool,
    stack_handle: StackHandle,
    local_port: u16,
    callback: Option<RecvCallback>,
    tx: Option<Sender<RxItem>>,
    rx: Option<Receiver<RxItem>>,
    dropped: u64,
}

impl Slot {
    fn reset(&mut self) {
        *self = Slot::default();
    }
}

/// Fixed-size pool of UDP socket handles
pub struct SocketPool {
    stack: Arc<dyn NetStack>,
    link: Arc<LinkState>,
    slots: Mutex<[Slot; MAX_SOCKETS]>,
}

impl SocketPool {
    pub fn new(stack: Arc<dyn NetStack>, link: Arc<LinkState>) -> Arc<Self> {
        Arc::new(Self {
            stack,
            link,
            slots: Mutex::new(std::array::from_fn(|_| Slot::default())),
        })
    }

    /// Allocate a slot and bind a UDP endpoint on `local_port`
    pub fn create(self: &Arc<Self>, local_port: u16) -> Result<SocketId> {
        let mut slots = self.slots.lock();

        let index = slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or(Error::NoMemory("socket slots"))?;

        let (tx, rx) = bounded(RECV_QUEUE_LEN);

        let pool: Weak<SocketPool> = Arc::downgrade(self);
        let dispatch = Arc::new(move |handle: StackHandle, remote: SocketAddrV4, data: &[u8]| {
            if let Some(pool) = pool.upgrade() {
                pool.dispatch(handle, remote, data);
            }
        });

        // The pool lock is held across open so a datagram arriving
        // immediately cannot race the handle store below.
        let stack_handle = self.stack.open(local_port, dispatch)?;

        let slot = &mut slots[index];
        slot.in_use = true;
        slot.bound = true;
        slot.closing = false;
        slot.stack_handle = stack_handle;
        slot.local_port = local_port;
        slot.callback = None;
        slot.tx = Some(tx);
        slot.rx = Some(rx);
        slot.dropped = 0;

        log::debug!("UDP socket slot {} bound to port {}", index, local_port);
        Ok(SocketId(index))
    }

    /// Shared receive dispatch, invoked by the stack for every datagram
    fn dispatch(&self, handle: StackHandle, remote: SocketAddrV4, data: &[u8]) {
        let callback = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots
                .iter_mut()
                .find(|s| s.in_use && !s.closing && s.stack_handle == handle)
            else {
                return;
            };

            if let Some(cb) = &slot.callback {
                Some(Arc::clone(cb))
            } else {
                let Some(tx) = &slot.tx else {
                    return;
                };

                let copy_len = data.len().min(MAX_PAYLOAD_SIZE);
                let item = RxItem::Datagram(Datagram {
                    remote,
                    data: data[..copy_len].to_vec(),
                });

                if tx.try_send(item).is_err() {
                    slot.dropped += 1;
                }
                None
            }
        };

        // Callbacks run without the pool lock held
        if let Some(cb) = callback {
            let _consumed = cb(remote, data);
        }
    }

    /// Register an inline receive callback, disabling blocking receive
    pub fn set_callback(&self, id: SocketId, callback: RecvCallback) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = checked_slot_mut(&mut slots, id)?;
        slot.callback = Some(callback);
        Ok(())
    }

    /// Remove a registered callback, re-enabling blocking receive
    pub fn clear_callback(&self, id: SocketId) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = checked_slot_mut(&mut slots, id)?;
        slot.callback = None;
        Ok(())
    }

    /// Receive one datagram, blocking up to `timeout`
    ///
    /// The payload is copied into `buf`, truncated to its length. Returns the
    /// copied length and the remote endpoint.
    pub fn recv(
        &self,
        id: SocketId,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, SocketAddrV4)> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty receive buffer".into()));
        }

        let rx = {
            let mut slots = self.slots.lock();
            let slot = checked_slot_mut(&mut slots, id)?;
            if slot.callback.is_some() {
                return Err(Error::InvalidArgument(
                    "slot has a receive callback registered".into(),
                ));
            }
            slot.rx
                .clone()
                .ok_or_else(|| Error::NetError("receive queue missing".into()))?
        };

        match rx.recv_timeout(timeout) {
            Ok(RxItem::Datagram(dgram)) => {
                let copy_len = dgram.data.len().min(buf.len());
                buf[..copy_len].copy_from_slice(&dgram.data[..copy_len]);
                Ok((copy_len, dgram.remote))
            }
            Ok(RxItem::Closing) => Err(Error::NetError("socket closing".into())),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::NetError("receive queue disconnected".into()))
            }
        }
    }

    /// Send a datagram to an explicit remote endpoint
    ///
    /// Requires the slot bound and the link up. Payloads over
    /// [`MAX_PAYLOAD_SIZE`] are rejected.
    pub fn send(&self, id: SocketId, remote: SocketAddrV4, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty payload".into()));
        }
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "payload too large: {} > {}",
                data.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let handle = {
            let mut slots = self.slots.lock();
            let slot = checked_slot_mut(&mut slots, id)?;
            slot.stack_handle
        };

        if !self.is_link_up() {
            return Err(Error::LinkDown);
        }

        self.stack.send(handle, remote, data)
    }

    /// Close a slot, waking any blocked receiver and freeing the slot
    pub fn close(&self, id: SocketId) -> Result<()> {
        let (handle, port) = {
            let mut slots = self.slots.lock();
            let slot = checked_slot_mut(&mut slots, id)?;
            slot.closing = true;

            // Drain, then queue the sentinel so a blocked receiver wakes
            if let Some(rx) = &slot.rx {
                while rx.try_recv().is_ok() {}
            }
            if let Some(tx) = &slot.tx {
                let _ = tx.try_send(RxItem::Closing);
            }

            let handle = slot.stack_handle;
            let port = slot.local_port;
            slot.reset();
            (handle, port)
        };

        // The stack close may join its reader thread, which can be blocked
        // on the pool lock inside dispatch; never call it with the lock held.
        self.stack.close(handle)?;

        log::debug!("UDP socket on port {} closed", port);
        Ok(())
    }

    /// Datagrams dropped on this slot due to a full receive queue
    pub fn dropped(&self, id: SocketId) -> u64 {
        let slots = self.slots.lock();
        match slots.get(id.0) {
            Some(slot) if slot.in_use => slot.dropped,
            _ => 0,
        }
    }

    pub fn is_link_up(&self) -> bool {
        self.link.is_up(self.stack.local_ip())
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.stack.local_ip()
    }
}

fn checked_slot_mut<'a>(slots: &'a mut [Slot; MAX_SOCKETS], id: SocketId) -> Result<&'a mut Slot> {
    let slot = slots
        .get_mut(id.0)
        .ok_or_else(|| Error::InvalidArgument(format!("invalid socket id {}", id.0)))?;
    if !slot.in_use || !slot.bound {
        return Err(Error::InvalidArgument(format!(
            "socket id {} not in use",
            id.0
        )));
    }
    Ok(slot)
}

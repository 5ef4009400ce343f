//! Scripted network stack for tests and hardware-free runs
//!
//! Datagrams are injected synchronously into the registered dispatch routine
//! (the same context a real stack callback would use) and sends are captured
//! for inspection. Link state and the local address are fully scriptable.

use super::stack::{NetStack, RxDispatch, StackHandle};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// A datagram captured on the send path
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub handle: StackHandle,
    pub remote: SocketAddrV4,
    pub payload: Vec<u8>,
}

/// Scripted send-path failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Transmit buffer allocation failure
    NoMemory,
    /// Stack-level send rejection
    NetError,
}

struct SimEndpoint {
    local_port: u16,
    dispatch: RxDispatch,
}

struct SimInner {
    endpoints: HashMap<StackHandle, SimEndpoint>,
    next_handle: StackHandle,
    sent: Vec<SentDatagram>,
    send_failure: Option<SendFailure>,
}

/// Scripted [`NetStack`] implementation
pub struct SimStack {
    local_ip: Mutex<Option<Ipv4Addr>>,
    inner: Mutex<SimInner>,
}

impl SimStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local_ip: Mutex::new(Some(Ipv4Addr::new(10, 0, 0, 2))),
            inner: Mutex::new(SimInner {
                endpoints: HashMap::new(),
                next_handle: 1,
                sent: Vec::new(),
                send_failure: None,
            }),
        })
    }

    pub fn set_local_ip(&self, ip: Option<Ipv4Addr>) {
        *self.local_ip.lock() = ip;
    }

    /// Inject a datagram into the endpoint bound to `local_port`
    ///
    /// The dispatch routine runs on the caller's thread before this returns.
    /// Returns false if no endpoint is bound to the port.
    pub fn inject(&self, local_port: u16, remote: SocketAddrV4, payload: &[u8]) -> bool {
        let entry = {
            let inner = self.inner.lock();
            inner
                .endpoints
                .iter()
                .find(|(_, ep)| ep.local_port == local_port)
                .map(|(&handle, ep)| (handle, Arc::clone(&ep.dispatch)))
        };

        match entry {
            Some((handle, dispatch)) => {
                dispatch(handle, remote, payload);
                true
            }
            None => false,
        }
    }

    /// Drain and return everything sent so far
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().sent.len()
    }

    /// Make every following send fail with the given error until cleared
    pub fn set_send_failure(&self, failure: Option<SendFailure>) {
        self.inner.lock().send_failure = failure;
    }

    pub fn is_port_open(&self, local_port: u16) -> bool {
        self.inner
            .lock()
            .endpoints
            .values()
            .any(|ep| ep.local_port == local_port)
    }
}

impl NetStack for SimStack {
    fn open(&self, local_port: u16, dispatch: RxDispatch) -> Result<StackHandle> {
        let mut inner = self.inner.lock();
        if inner.endpoints.values().any(|ep| ep.local_port == local_port) {
            return Err(Error::NetError(format!("port {} already bound", local_port)));
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.endpoints.insert(
            handle,
            SimEndpoint {
                local_port,
                dispatch,
            },
        );
        Ok(handle)
    }

    fn close(&self, handle: StackHandle) -> Result<()> {
        match self.inner.lock().endpoints.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidArgument(format!(
                "unknown stack handle {}",
                handle
            ))),
        }
    }

    fn send(&self, handle: StackHandle, remote: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.endpoints.contains_key(&handle) {
            return Err(Error::InvalidArgument(format!(
                "unknown stack handle {}",
                handle
            )));
        }

        match inner.send_failure {
            Some(SendFailure::NoMemory) => Err(Error::NoMemory("transmit buffers")),
            Some(SendFailure::NetError) => Err(Error::NetError("simulated send failure".into())),
            None => {
                inner.sent.push(SentDatagram {
                    handle,
                    remote,
                    payload: payload.to_vec(),
                });
                Ok(())
            }
        }
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        *self.local_ip.lock()
    }
}

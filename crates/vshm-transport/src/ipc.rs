//! Synchronous control channel between driver and device.
//!
//! Every control call is a request plus a private reply channel; the caller blocks until the
//! device answers with a wire code (`0` or a negative errno). The server thread sleeps on the
//! device's host notifier, which the client triggers after each request and which the driver
//! also triggers to announce new chains.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};
use vshm_abi::Opcode;

use crate::caps::CapRef;
use crate::device::{DeviceBackend, InterfaceHandles, VshmDevice};
use crate::error::{Result, TransportError};
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    SetStatus {
        status: u32,
    },
    ConfigQueue {
        index: u32,
    },
    RegisterIface {
        guest_irq: CapRef,
    },
    RegisterDs {
        cap: CapRef,
        base: u64,
        offset: u64,
        size: u64,
    },
}

impl ControlRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlRequest::SetStatus { .. } => Opcode::SetStatus,
            ControlRequest::ConfigQueue { .. } => Opcode::ConfigQueue,
            ControlRequest::RegisterIface { .. } => Opcode::RegisterIface,
            ControlRequest::RegisterDs { .. } => Opcode::RegisterDs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub code: i32,
    /// Set on a successful `RegisterIface`.
    pub interface: Option<InterfaceHandles>,
}

struct Call {
    request: ControlRequest,
    reply: Sender<ControlResponse>,
}

/// Connect a device to a new control channel.
pub fn channel<B: DeviceBackend>(device: VshmDevice<B>) -> (ControlServer<B>, ControlClient) {
    let (tx, rx) = mpsc::channel();
    let client = ControlClient {
        requests: Some(tx),
        doorbell: device.host_notifier(),
    };
    (
        ControlServer {
            device,
            requests: rx,
        },
        client,
    )
}

/// Driver-side end of the control channel.
#[derive(Clone)]
pub struct ControlClient {
    /// Only `None` while dropping.
    requests: Option<Sender<Call>>,
    doorbell: Notifier,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient").finish_non_exhaustive()
    }
}

impl ControlClient {
    fn send(&self, request: ControlRequest) -> Result<Receiver<ControlResponse>> {
        let (reply, rx) = mpsc::channel();
        self.requests
            .as_ref()
            .ok_or(TransportError::Disconnected)?
            .send(Call { request, reply })
            .map_err(|_| TransportError::Disconnected)?;
        self.doorbell.trigger();
        Ok(rx)
    }

    /// Issue `request` and block until the device answers.
    pub fn call(&self, request: ControlRequest) -> Result<ControlResponse> {
        self.send(request)?
            .recv()
            .map_err(|_| TransportError::Disconnected)
    }

    /// Like [`ControlClient::call`] but gives up after `timeout`. The device may still apply
    /// the request later.
    pub fn call_timeout(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<ControlResponse> {
        match self.send(request)?.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn call_checked(&self, request: ControlRequest) -> Result<ControlResponse> {
        let response = self.call(request)?;
        TransportError::check(response.code)?;
        Ok(response)
    }

    pub fn set_status(&self, status: u32) -> Result<()> {
        self.call_checked(ControlRequest::SetStatus { status })
            .map(|_| ())
    }

    pub fn config_queue(&self, index: u32) -> Result<()> {
        self.call_checked(ControlRequest::ConfigQueue { index })
            .map(|_| ())
    }

    pub fn register_iface(&self, guest_irq: CapRef) -> Result<InterfaceHandles> {
        self.call_checked(ControlRequest::RegisterIface { guest_irq })?
            .interface
            .ok_or(TransportError::InvalidConfiguration(
                "registration returned no handles",
            ))
    }

    pub fn register_ds(&self, cap: CapRef, base: u64, offset: u64, size: u64) -> Result<()> {
        self.call_checked(ControlRequest::RegisterDs {
            cap,
            base,
            offset,
            size,
        })
        .map(|_| ())
    }

    /// The device's host notifier.
    pub fn doorbell(&self) -> &Notifier {
        &self.doorbell
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        // Close this sender first so the woken server can observe the disconnect.
        self.requests = None;
        self.doorbell.trigger();
    }
}

/// Device-side end of the control channel.
pub struct ControlServer<B> {
    device: VshmDevice<B>,
    requests: Receiver<Call>,
}

impl<B: DeviceBackend> ControlServer<B> {
    pub fn device(&self) -> &VshmDevice<B> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut VshmDevice<B> {
        &mut self.device
    }

    fn handle(&mut self, call: Call) {
        let opcode = call.request.opcode();
        let result = match call.request {
            ControlRequest::SetStatus { status } => self.device.set_status(status).map(|()| None),
            ControlRequest::ConfigQueue { index } => {
                self.device.configure_queue(index).map(|()| None)
            }
            ControlRequest::RegisterIface { guest_irq } => {
                self.device.register_interface(guest_irq).map(Some)
            }
            ControlRequest::RegisterDs {
                cap,
                base,
                offset,
                size,
            } => self
                .device
                .register_region(cap, base, offset, size)
                .map(|()| None),
        };
        let response = match result {
            Ok(interface) => ControlResponse { code: 0, interface },
            Err(err) => ControlResponse {
                code: err.code(),
                interface: None,
            },
        };
        trace!(?opcode, code = response.code, "control call handled");
        // The caller may have timed out and dropped its receiver.
        let _ = call.reply.send(response);
    }

    /// Answer every queued request, then drain the queues. Returns `false` once all clients
    /// are gone.
    pub fn poll_once(&mut self) -> bool {
        loop {
            match self.requests.try_recv() {
                Ok(call) => self.handle(call),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        if let Err(err) = self.device.process_queues() {
            warn!(error = %err, "queue processing failed");
        }
        true
    }

    /// Serve until every client is dropped, then hand the device back.
    pub fn serve(mut self) -> VshmDevice<B> {
        let doorbell = self.device.host_notifier();
        loop {
            doorbell.wait();
            if !self.poll_once() {
                break;
            }
        }
        debug!("control channel closed");
        self.device
    }

    pub fn spawn(self) -> JoinHandle<VshmDevice<B>>
    where
        B: 'static,
    {
        std::thread::spawn(move || self.serve())
    }
}

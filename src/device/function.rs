//! Interface function callbacks

use crate::error::{Error, Result};
use crate::setup::SetupPacket;
use alloc::{boxed::Box, vec::Vec};

/// Consumes the data stage of a host-to-device request
pub type OutHandler = Box<dyn FnOnce(&[u8]) -> Result<()> + Send>;

/// Runs once the status stage completes
pub type StatusHook = Box<dyn FnOnce() + Send>;

pub(crate) enum ReplyData {
    None,
    In(Vec<u8>),
    Out(OutHandler),
}

/// How a handler answers a control request
///
/// The control state machine truncates IN data to `wLength`, runs the data
/// stage, then the status stage in the opposite direction.
pub struct ControlReply {
    pub(crate) data: ReplyData,
    pub(crate) on_status: Option<StatusHook>,
}

impl ControlReply {
    /// Accept a request without a data stage
    pub fn ack() -> Self {
        Self {
            data: ReplyData::None,
            on_status: None,
        }
    }

    /// Send `data` to the host
    pub fn data_in(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: ReplyData::In(data.into()),
            on_status: None,
        }
    }

    /// Receive `wLength` bytes from the host, and hand them to `handler`
    ///
    /// An error from the handler stalls the status stage.
    pub fn data_out(handler: impl FnOnce(&[u8]) -> Result<()> + Send + 'static) -> Self {
        Self {
            data: ReplyData::Out(Box::new(handler)),
            on_status: None,
        }
    }

    /// Run `hook` after a successful status stage
    pub fn on_status(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_status = Some(Box::new(hook));
        self
    }

    /// Returns the IN data, if any
    pub fn in_data(&self) -> Option<&[u8]> {
        match &self.data {
            ReplyData::In(data) => Some(data),
            _ => None,
        }
    }
}

/// Callbacks of one interface function
///
/// Every method has a default. A function that only moves data on its pipes
/// doesn't need to implement anything.
pub trait FunctionOps: Send + Sync {
    /// The host selected alternate setting `alt` of `interface`
    ///
    /// The endpoints of `alt` are already enabled.
    fn alt_set(&self, interface: u8, alt: u8) -> Result<()> {
        let _ = (interface, alt);
        Ok(())
    }

    /// Report the current alternate setting
    ///
    /// Return `None` to let the device answer from its own bookkeeping.
    fn alt_get(&self, interface: u8) -> Option<u8> {
        let _ = interface;
        None
    }

    /// Handle a class, vendor, or unhandled standard request
    fn setup(&self, setup: &SetupPacket) -> Result<ControlReply> {
        let _ = setup;
        Err(Error::NotSup)
    }

    /// The configuration holding `interface` went away
    fn disable(&self, interface: u8) {
        let _ = interface;
    }
}

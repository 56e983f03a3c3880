//! Network provider boundary.
//!
//! The runtime treats sends and creates whose target partition matches its
//! own as local enqueues; everything else is delegated to a
//! [`NetworkProvider`]. The only implementation required here is the
//! in-process forwarder, which queues the operations and hands them straight
//! back to the runtime for local application. Production transports plug in
//! behind the same trait.

use crate::error::Result;
use crate::event::Event;
use crate::types::MachineId;

/// A cross-partition operation handed to a provider.
#[derive(Debug)]
pub enum RemoteOp {
    /// Create a machine in the target partition. The id was allocated by the
    /// originating runtime and travels with the request.
    Create {
        /// Pre-allocated identity of the machine to create.
        id: MachineId,
        /// Registered machine type name.
        type_name: String,
        /// Optional creation event.
        event: Option<Event>,
    },
    /// Deliver an event to a machine in another partition.
    Send {
        /// Target machine.
        target: MachineId,
        /// The event to deliver.
        event: Event,
    },
}

/// Boundary between the core runtime and the transport.
pub trait NetworkProvider {
    /// Requests creation of a machine in a remote partition.
    ///
    /// # Errors
    ///
    /// Transport-specific failures.
    fn create_remote(&mut self, id: &MachineId, type_name: &str, event: Option<Event>)
        -> Result<()>;

    /// Forwards an event to a machine in a remote partition.
    ///
    /// # Errors
    ///
    /// Transport-specific failures.
    fn send_remote(&mut self, target: &MachineId, event: Event) -> Result<()>;

    /// The partition name this provider serves.
    fn local_endpoint(&self) -> String;

    /// Drains operations that should be applied locally. The in-process
    /// forwarder loops everything back through here; real transports return
    /// nothing.
    fn drain_forwarded(&mut self) -> Vec<RemoteOp>;
}

/// In-process forwarder: every partition is this process.
#[derive(Debug, Default)]
pub struct LocalNetworkProvider {
    endpoint: String,
    queued: Vec<RemoteOp>,
}

impl LocalNetworkProvider {
    /// Creates a forwarder for the given endpoint name.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            queued: Vec::new(),
        }
    }
}

impl NetworkProvider for LocalNetworkProvider {
    fn create_remote(
        &mut self,
        id: &MachineId,
        type_name: &str,
        event: Option<Event>,
    ) -> Result<()> {
        self.queued.push(RemoteOp::Create {
            id: id.clone(),
            type_name: type_name.to_string(),
            event,
        });
        Ok(())
    }

    fn send_remote(&mut self, target: &MachineId, event: Event) -> Result<()> {
        self.queued.push(RemoteOp::Send {
            target: target.clone(),
            event,
        });
        Ok(())
    }

    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn drain_forwarded(&mut self) -> Vec<RemoteOp> {
        std::mem::take(&mut self.queued)
    }
}

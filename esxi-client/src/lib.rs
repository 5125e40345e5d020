//! Thin wrapper over the ESXi hypervisor's classic management API: session
//! handling, VM lookup, task polling, question answering, datastore file
//! operations, and the guest-ops channel. See `backend::virtualization`
//! for everything built on top of it.

mod client;
mod error;
mod fileops;
mod guestops;
mod inventory;
mod types;
mod vm_ops;
mod xml;

pub use client::{SessionGuard, VsphereClient};
pub use error::{HypervisorError, Result};
pub use types::{DatastoreFacts, HostFacts, PendingQuestion, PowerState, VirtualDisk, VmDescriptor, VmFacts};
pub use vm_ops::EthernetDevice;

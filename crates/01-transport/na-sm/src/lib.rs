//! Shared-memory plugin of the network abstraction layer.
//!
//! Processes on one host exchange small messages through a shared region
//! ([`sm_transport::SharedRegion`]) holding copy buffers and per-peer queue
//! pairs, and move bulk data with cross-memory attach (`process_vm_*`).
//!
//! An [`SmEndpoint`] is driven by [`SmEndpoint::progress`]; finished
//! operations are reported as [`Completion`] records pushed into the
//! [`CompletionSink`] given at open, typically a `crossbeam_channel::Sender`.
//! Addresses and operations are referred to by the [`AddrId`] and [`OpId`]
//! handles the endpoint hands out.

mod addr;
mod arena;
mod cleanup;
mod cma;
mod completion;
mod config;
mod endpoint;
mod error;
mod handshake;
mod msg;
mod op;
mod progress;
mod registry;
mod rma;

pub use addr::AddrId;
pub use cleanup::cleanup;
pub use cma::{CrossProcessCopy, ProcessVmCopy};
pub use completion::{Completion, CompletionInfo, CompletionSink};
pub use config::{ProgressMode, SmConfig};
pub use endpoint::{SmEndpoint, ADDR_SERIALIZE_SIZE};
pub use error::{NaError, NaResult};
pub use op::{OpId, OpKind, OpState};
pub use registry::ProcessRegistry;
pub use rma::{translate, MemAccess, MemHandle, Segment, IOV_MAX};

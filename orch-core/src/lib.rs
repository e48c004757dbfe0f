//! Orchestrator fleet-coordination protocol.
//! Host-driven: no I/O; host passes decoded commands and receives actions.

pub mod assignment;
pub mod coordinator;
pub mod identity;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use assignment::{AdvertOutcome, AssignmentRecord, GuardError, ServerId};
pub use coordinator::{Action, Coordinator, FollowUp, Ignored, LocalFile, PushRejected};
pub use identity::DeviceIdentity;
pub use protocol::{
    BootstrapRequest, Command, ControllerAdvert, Envelope, BROADCAST_ADDRESS, DEFAULT_PORT,
    PROVIDER,
};
pub use transfer::{decode_file, encode_file, TransferError, TransferHeader};
pub use wire::{
    decode_envelope, decode_request, encode_envelope, encode_message, Request, WireError,
};

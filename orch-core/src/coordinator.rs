//! Host-driven API: the coordinator receives decoded commands and returns actions.
//!
//! The coordinator owns the assignment record and never performs I/O. The host runs the
//! returned [`Action`] (one TCP round trip to the controller) and, when the exchange
//! succeeds, feeds the [`FollowUp`] back through [`Coordinator::apply`].

use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;

use crate::assignment::{AdvertOutcome, AssignmentRecord, GuardError, ServerId};
use crate::identity::DeviceIdentity;
use crate::protocol::{Command, ControllerAdvert, Envelope};
use crate::wire::Request;

/// Local files the controller can fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFile {
    Config,
    Log,
}

/// What to do after the controller exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    Nothing,
    /// Bind to the controller (Add).
    Assign(ServerId),
    /// Drop the binding (Remove).
    Unassign,
    /// Raise the check-for-update signal (Update).
    CheckForUpdate,
    /// Truncate the device log (ClearLog).
    ClearLog,
    /// Factory-reset persistent settings, then restart (Restore).
    FactoryRestore,
    /// Restart the device (Restart).
    Restart,
}

impl FollowUp {
    /// Only Restart proceeds when the acknowledgement could not be delivered.
    pub fn requires_delivery(&self) -> bool {
        !matches!(self, FollowUp::Restart)
    }
}

/// Why a command was dropped without contacting the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    Guard(GuardError),
    /// Add while already bound.
    AlreadyAssigned(Option<ServerId>),
    /// Add without a well-formed `Server ID`.
    InvalidServerId,
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Ignore(Ignored),
    /// Send `envelope` to the controller; on success run `follow_up`.
    Reply {
        target: SocketAddr,
        envelope: Envelope,
        follow_up: FollowUp,
    },
    /// Stream a local file to the controller.
    SendFile {
        target: SocketAddr,
        file: LocalFile,
        command: Command,
    },
    /// Send `request`, then stage and validate the configuration the controller streams back.
    ReceiveConfig {
        target: SocketAddr,
        request: Envelope,
    },
}

/// Ownership fields inside a pushed configuration.
#[derive(Deserialize)]
struct PushedOwnership {
    #[serde(rename = "Assigned", default)]
    assigned: bool,
    #[serde(rename = "Server ID", default)]
    server_id: String,
}

/// Pushed configuration refused; the current configuration stays in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushRejected {
    #[error("payload has no Result object")]
    MissingResult,
    #[error("pushed configuration has no valid Orchestrator section")]
    MissingOwnership,
    #[error("pushed configuration is not assigned")]
    NotAssigned,
    #[error("pushed configuration belongs to another Server ID")]
    ServerIdMismatch,
}

/// Assignment state machine and command router.
pub struct Coordinator {
    record: AssignmentRecord,
    identity: DeviceIdentity,
}

impl Coordinator {
    pub fn new(record: AssignmentRecord, identity: DeviceIdentity) -> Self {
        Self { record, identity }
    }

    pub fn record(&self) -> &AssignmentRecord {
        &self.record
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The guard every verb but Discover and Add passes first.
    pub fn check_assigned_and_matching(&self, request: &Request) -> Result<(), GuardError> {
        self.record.check(request.server_id.as_deref())
    }

    /// Controller endpoint. Before any bootstrap, the command's sender stands in.
    pub fn controller_target(&self, sender: IpAddr) -> SocketAddr {
        let ip = self.record.controller_addr.unwrap_or(sender);
        SocketAddr::new(ip, self.record.controller_port)
    }

    /// Route a command. `timestamp` is the device's local time, supplied by the host.
    pub fn on_command(&self, request: &Request, sender: IpAddr, timestamp: &str) -> Action {
        if request.command.is_guarded() {
            if let Err(e) = self.check_assigned_and_matching(request) {
                return Action::Ignore(Ignored::Guard(e));
            }
        }
        let target = self.controller_target(sender);
        let reply = |envelope: Envelope, follow_up: FollowUp| Action::Reply {
            target,
            envelope,
            follow_up,
        };
        match request.command {
            Command::Discover | Command::Refresh => {
                let owner = self.record.server_id.as_ref().filter(|_| self.record.assigned);
                reply(self.identity.discover_reply(owner, timestamp), FollowUp::Nothing)
            }
            Command::Add => {
                if self.record.assigned {
                    return Action::Ignore(Ignored::AlreadyAssigned(self.record.server_id.clone()));
                }
                match request.server_id.as_deref().and_then(ServerId::parse) {
                    Some(id) => reply(self.identity.add_reply(timestamp), FollowUp::Assign(id)),
                    None => Action::Ignore(Ignored::InvalidServerId),
                }
            }
            Command::Remove => reply(self.identity.ack_reply(Command::Remove), FollowUp::Unassign),
            Command::Restart => reply(self.identity.ack_reply(Command::Restart), FollowUp::Restart),
            Command::Update => reply(
                self.identity.ack_reply(Command::Update),
                FollowUp::CheckForUpdate,
            ),
            Command::Restore => reply(
                self.identity.ack_reply(Command::Restore),
                FollowUp::FactoryRestore,
            ),
            Command::ClearLog => reply(self.identity.ack_reply(Command::ClearLog), FollowUp::ClearLog),
            Command::Pull => Action::SendFile {
                target,
                file: LocalFile::Config,
                command: Command::Pull,
            },
            Command::GetLog => Action::SendFile {
                target,
                file: LocalFile::Log,
                command: Command::GetLog,
            },
            Command::Push => Action::ReceiveConfig {
                target,
                request: self.identity.push_request(),
            },
        }
    }

    /// Apply a follow-up to the record. Returns true when the record changed and must be saved.
    pub fn apply(&mut self, follow_up: &FollowUp) -> bool {
        match follow_up {
            FollowUp::Assign(id) => {
                self.record.assign(id.clone());
                true
            }
            FollowUp::Unassign => {
                self.record.clear();
                true
            }
            _ => false,
        }
    }

    /// Fold a bootstrap reply into the record.
    pub fn on_discovery_reply(&mut self, advert: &ControllerAdvert, sender: IpAddr) -> AdvertOutcome {
        self.record.apply_advert(advert, sender)
    }

    /// Check a pushed document `{"Result": {...}}` against the current owner and return the
    /// configuration to persist.
    pub fn validate_pushed(&self, document: &serde_json::Value) -> Result<serde_json::Value, PushRejected> {
        let result = document
            .get("Result")
            .filter(|r| r.is_object())
            .ok_or(PushRejected::MissingResult)?;
        let ownership: PushedOwnership = result
            .get("Orchestrator")
            .cloned()
            .and_then(|o| serde_json::from_value(o).ok())
            .ok_or(PushRejected::MissingOwnership)?;
        if !ownership.assigned {
            return Err(PushRejected::NotAssigned);
        }
        match &self.record.server_id {
            Some(stored) if self.record.assigned && stored.as_str() == ownership.server_id => {
                Ok(result.clone())
            }
            _ => Err(PushRejected::ServerIdMismatch),
        }
    }
}

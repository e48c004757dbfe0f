//! The device agent: runs the coordinator's actions against the controller and local state.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use orch_core::transfer::is_transfer_envelope;
use orch_core::{
    decode_file, Action, Command, Coordinator, DeviceIdentity, Envelope, FollowUp, Ignored,
    LocalFile, PushRejected, Request, TransferError, TransferHeader,
};
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::discovery;
use crate::logging::DeviceLog;
use crate::settings::{Settings, SettingsError};
use crate::transfer::{checksum_file, receive_until_idle, send_file, ReceiveEnd, MAX_INBOUND_LEN};
use crate::transport::{exchange, write_envelope};
use crate::update::UpdateSignal;

/// How a command ended. Only used for logging, except `Restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Ignored,
    Failed,
    /// The caller must re-initialize the agent.
    Restart,
}

/// Why a pushed configuration was not applied.
#[derive(Debug, thiserror::Error)]
enum PushError {
    #[error("staging: {0}")]
    Staging(#[from] io::Error),
    #[error("payload is not JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("transfer envelope: {0}")]
    Transfer(#[from] TransferError),
    #[error("rejected: {0}")]
    Rejected(#[from] PushRejected),
    #[error("apply: {0}")]
    Apply(#[from] SettingsError),
}

pub struct Agent {
    coordinator: Coordinator,
    settings: Settings,
    device_log: DeviceLog,
    update: UpdateSignal,
    timeouts: Timeouts,
}

fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Agent {
    pub fn new(
        settings: Settings,
        identity: DeviceIdentity,
        device_log: DeviceLog,
        update: UpdateSignal,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            coordinator: Coordinator::new(settings.assignment().clone(), identity),
            settings,
            device_log,
            update,
            timeouts,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Write the coordinator's record through to the settings store.
    async fn persist(&mut self) -> bool {
        self.settings.set_assignment(self.coordinator.record().clone());
        match self.settings.save().await {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.settings.path().display(), "saving settings failed: {}", e);
                false
            }
        }
    }

    /// Startup: discover the controller, persist any endpoint change, then announce
    /// ourselves to the owner if assigned.
    pub async fn bootstrap(&mut self, target: &str, port: u16) {
        if discovery::bootstrap(&mut self.coordinator, target, port, self.timeouts.discovery).await {
            self.persist().await;
        }
        let record = self.coordinator.record();
        if !record.assigned {
            info!("device is not assigned; waiting for Add");
            return;
        }
        let (Some(owner), Some(addr)) = (record.server_id.clone(), record.controller_addr) else {
            debug!("assigned but controller endpoint unknown; skipping Refresh");
            return;
        };
        let refresh = Request::new(Command::Refresh, Some(owner.as_str()));
        let from = SocketAddr::new(addr, record.controller_port);
        self.handle(&refresh, from).await;
    }

    /// Run one command to completion.
    pub async fn handle(&mut self, request: &Request, from: SocketAddr) -> Outcome {
        let command = request.command;
        let action = self.coordinator.on_command(request, from.ip(), &local_timestamp());
        let outcome = match action {
            Action::Ignore(reason) => {
                match reason {
                    Ignored::Guard(e) => warn!(%command, %from, "ignored: {}", e),
                    Ignored::AlreadyAssigned(owner) => error!(
                        %command,
                        %from,
                        owner = owner.as_ref().map(|o| o.as_str()).unwrap_or(""),
                        "device already assigned"
                    ),
                    Ignored::InvalidServerId => {
                        warn!(%command, %from, "ignored: missing or malformed Server ID")
                    }
                }
                Outcome::Ignored
            }
            Action::Reply {
                target,
                envelope,
                follow_up,
            } => self.reply(command, target, envelope, follow_up).await,
            Action::SendFile {
                target,
                file,
                command,
            } => self.send_local_file(target, file, command).await,
            Action::ReceiveConfig { target, request } => self.receive_config(target, request).await,
        };
        debug!(%command, %from, ?outcome, "command handled");
        outcome
    }

    async fn send_envelope(&self, target: SocketAddr, envelope: Envelope) -> bool {
        let write_idle = self.timeouts.write_idle;
        let sent = exchange(target, self.timeouts.connect, |mut stream| async move {
            write_envelope(&mut stream, &envelope, write_idle).await
        })
        .await;
        match sent {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(controller = %target, "send to controller failed: {}", e);
                false
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    async fn reply(
        &mut self,
        command: Command,
        target: SocketAddr,
        envelope: Envelope,
        follow_up: FollowUp,
    ) -> Outcome {
        let delivered = self.send_envelope(target, envelope).await;
        if !delivered && follow_up.requires_delivery() {
            warn!(%command, "reply not delivered; no state changed");
            return Outcome::Failed;
        }
        match follow_up {
            FollowUp::Nothing => Outcome::Completed,
            FollowUp::Assign(_) | FollowUp::Unassign => {
                self.coordinator.apply(&follow_up);
                let record = self.coordinator.record();
                info!(
                    assigned = record.assigned,
                    server_id = record.server_id.as_ref().map(|s| s.as_str()).unwrap_or(""),
                    "assignment changed"
                );
                if self.persist().await {
                    Outcome::Completed
                } else {
                    Outcome::Failed
                }
            }
            FollowUp::CheckForUpdate => {
                self.update.raise();
                info!("update check requested");
                Outcome::Completed
            }
            FollowUp::ClearLog => match self.device_log.clear().await {
                Ok(()) => {
                    info!("device log cleared");
                    Outcome::Completed
                }
                Err(e) => {
                    error!(path = %self.device_log.path().display(), "clearing log failed: {}", e);
                    Outcome::Failed
                }
            },
            FollowUp::FactoryRestore => match self.settings.restore_factory_defaults().await {
                Ok(()) => {
                    warn!("settings restored to factory defaults; restarting");
                    Outcome::Restart
                }
                Err(e) => {
                    error!("factory restore failed: {}", e);
                    Outcome::Failed
                }
            },
            FollowUp::Restart => {
                if !delivered {
                    warn!("restart acknowledgement not delivered; restarting anyway");
                }
                Outcome::Restart
            }
        }
    }

    async fn send_local_file(&mut self, target: SocketAddr, file: LocalFile, command: Command) -> Outcome {
        let path: PathBuf = match file {
            LocalFile::Config => {
                if !self.persist().await {
                    return Outcome::Failed;
                }
                self.settings.path().to_path_buf()
            }
            LocalFile::Log => self.device_log.path().to_path_buf(),
        };
        let mut source = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                error!(path = %path.display(), "cannot open file for {}: {}", command, e);
                return Outcome::Failed;
            }
        };
        let (checksum, size) = match checksum_file(&mut source).await {
            Ok(r) => r,
            Err(e) => {
                error!(path = %path.display(), "cannot read file for {}: {}", command, e);
                return Outcome::Failed;
            }
        };
        let header = TransferHeader {
            command,
            filename: file_name(&path),
            mac_address: self.coordinator.identity().mac_address.clone(),
            size,
            checksum,
        };
        let write_idle = self.timeouts.write_idle;
        let sent = exchange(target, self.timeouts.connect, |mut stream| async move {
            send_file(&mut stream, source, &header, write_idle).await
        })
        .await;
        match sent {
            Ok(Ok(())) => {
                info!(%command, controller = %target, size, "file sent");
                Outcome::Completed
            }
            Ok(Err(e)) => {
                error!(%command, controller = %target, "file transfer failed: {}", e);
                Outcome::Failed
            }
            Err(e) => {
                error!(%command, "{}", e);
                Outcome::Failed
            }
        }
    }

    async fn receive_config(&mut self, target: SocketAddr, request: Envelope) -> Outcome {
        let staging = self.settings.staging_path();
        let received = self.stage_push(target, request, &staging).await;
        let outcome = match received {
            Ok((len, end)) => {
                debug!(len, ?end, "push payload staged");
                match self.apply_staged(&staging).await {
                    Ok(()) => {
                        info!("pushed configuration applied; restarting");
                        let ack = self.coordinator.identity().ack_reply(Command::Restart);
                        self.send_envelope(target, ack).await;
                        Outcome::Restart
                    }
                    Err(e) => {
                        warn!("pushed configuration not applied: {}", e);
                        Outcome::Failed
                    }
                }
            }
            Err(e) => {
                error!(controller = %target, "push transfer failed: {}", e);
                Outcome::Failed
            }
        };
        match tokio::fs::remove_file(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), "cannot remove staging file: {}", e),
        }
        outcome
    }

    /// Send the Push request and copy the controller's answer into `staging`.
    async fn stage_push(
        &self,
        target: SocketAddr,
        request: Envelope,
        staging: &Path,
    ) -> anyhow::Result<(u64, ReceiveEnd)> {
        if let Some(dir) = staging.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut sink = tokio::fs::File::create(staging).await?;
        let write_idle = self.timeouts.write_idle;
        let receive_idle = self.timeouts.receive_idle;
        let received = exchange(target, self.timeouts.connect, |mut stream| async move {
            write_envelope(&mut stream, &request, write_idle).await?;
            receive_until_idle(&mut stream, &mut sink, receive_idle, MAX_INBOUND_LEN).await
        })
        .await??;
        Ok(received)
    }

    /// Parse, validate and apply the staged payload. The current configuration is untouched on error.
    async fn apply_staged(&mut self, staging: &Path) -> Result<(), PushError> {
        let bytes = tokio::fs::read(staging).await?;
        let mut document: serde_json::Value = serde_json::from_slice(&bytes)?;
        if is_transfer_envelope(&document) {
            let file = decode_file(&bytes)?;
            document = serde_json::from_slice(&file.data)?;
        }
        let config = self.coordinator.validate_pushed(&document)?;
        self.settings.replace(config).await?;
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

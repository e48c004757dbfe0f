//! Orchestrator wire protocol: command verbs, the envelope, and well-known constants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Well-known UDP port for discovery and inbound commands; also the default controller TCP port.
pub const DEFAULT_PORT: u16 = 30030;

/// All-ones IPv4 broadcast, used for bootstrap discovery.
pub const BROADCAST_ADDRESS: &str = "255.255.255.255";

/// Sender role name stamped into every envelope the device emits.
pub const PROVIDER: &str = "Orchestrator";

/// Parameter value of a positive acknowledgement.
pub const ACK: &str = "ACK";

/// Command verbs. Wire strings are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Discover,
    Refresh,
    Add,
    Remove,
    Restart,
    Update,
    Restore,
    Pull,
    Push,
    GetLog,
    ClearLog,
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::Discover,
        Command::Refresh,
        Command::Add,
        Command::Remove,
        Command::Restart,
        Command::Update,
        Command::Restore,
        Command::Pull,
        Command::Push,
        Command::GetLog,
        Command::ClearLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Discover => "Discover",
            Command::Refresh => "Refresh",
            Command::Add => "Add",
            Command::Remove => "Remove",
            Command::Restart => "Restart",
            Command::Update => "Update",
            Command::Restore => "Restore",
            Command::Pull => "Pull",
            Command::Push => "Push",
            Command::GetLog => "GetLog",
            Command::ClearLog => "ClearLog",
        }
    }

    /// Discover and Add bootstrap the assignment; every other verb is guarded.
    pub fn is_guarded(&self) -> bool {
        !matches!(self, Command::Discover | Command::Add)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verb string did not name a known command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Unit of wire exchange over UDP and TCP. Field names are the wire contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Provider", default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "Command", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(rename = "Parameter", default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<serde_json::Value>,
    #[serde(rename = "Server ID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(rename = "Reply Port", default, skip_serializing_if = "Option::is_none")]
    pub reply_port: Option<u16>,
    #[serde(rename = "MAC Address", default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(rename = "Hostname", default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Controller advertisement carried by a bootstrap reply.
    #[serde(rename = "Orchestrator", default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<ControllerAdvert>,
    /// Flat identity fields (Add reply).
    #[serde(flatten)]
    pub details: DeviceDetails,
}

impl Envelope {
    /// Envelope from this device with `Provider` and `Command` set.
    pub fn from_device(command: Command) -> Self {
        Self {
            provider: Some(PROVIDER.to_string()),
            command: Some(command.as_str().to_string()),
            ..Self::default()
        }
    }
}

/// Identity fields that appear flat in some envelopes and nested in the Discover parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    #[serde(rename = "Product Name", default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(rename = "Hardware Model", default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "IP Address", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "Local Timestamp", default, skip_serializing_if = "Option::is_none")]
    pub local_timestamp: Option<String>,
}

/// Controller identifier and TCP endpoint, as advertised in a bootstrap reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerAdvert {
    #[serde(rename = "Server ID", default)]
    pub server_id: String,
    #[serde(rename = "IP Address", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "Port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Value of the `Orchestrator` key in a bootstrap broadcast.
pub const BOOTSTRAP_VERB: &str = "Discover";

/// Bootstrap broadcast sent by a starting device: `{"Orchestrator":"Discover","Reply Port":N}`.
/// It carries no `Command`, so other devices listening on the same port drop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    #[serde(rename = "Orchestrator")]
    pub orchestrator: String,
    /// Where the controller should answer.
    #[serde(rename = "Reply Port", default, skip_serializing_if = "Option::is_none")]
    pub reply_port: Option<u16>,
}

impl BootstrapRequest {
    pub fn new(reply_port: u16) -> Self {
        Self {
            orchestrator: BOOTSTRAP_VERB.to_string(),
            reply_port: Some(reply_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_strings_roundtrip() {
        for c in Command::ALL {
            assert_eq!(c.as_str().parse::<Command>().unwrap(), c);
        }
    }

    #[test]
    fn command_parse_is_case_sensitive() {
        assert!("discover".parse::<Command>().is_err());
        assert!("GETLOG".parse::<Command>().is_err());
        assert_eq!(
            "Reboot".parse::<Command>(),
            Err(UnknownCommand("Reboot".to_string()))
        );
    }

    #[test]
    fn only_discover_and_add_are_unguarded() {
        let unguarded: Vec<Command> = Command::ALL
            .iter()
            .copied()
            .filter(|c| !c.is_guarded())
            .collect();
        assert_eq!(unguarded, vec![Command::Discover, Command::Add]);
    }

    #[test]
    fn envelope_uses_spaced_field_names() {
        let mut env = Envelope::from_device(Command::Remove);
        env.server_id = Some("ABCDEFGHJKLMNPQ".into());
        env.mac_address = Some("AA:BB:CC:DD:EE:FF".into());
        env.reply_port = Some(30031);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["Provider"], "Orchestrator");
        assert_eq!(v["Command"], "Remove");
        assert_eq!(v["Server ID"], "ABCDEFGHJKLMNPQ");
        assert_eq!(v["MAC Address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(v["Reply Port"], 30031);
        assert!(v.get("Hostname").is_none());
        assert!(v.get("Parameter").is_none());
        assert!(v.get("Product Name").is_none());
    }

    #[test]
    fn envelope_reads_controller_advert() {
        let raw = r#"{"Orchestrator":{"Server ID":"ABCDEFGHJKLMNPQ","IP Address":"10.0.0.5","Port":31000}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        let advert = env.orchestrator.unwrap();
        assert_eq!(advert.server_id, "ABCDEFGHJKLMNPQ");
        assert_eq!(advert.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(advert.port, Some(31000));
        assert!(env.command.is_none());
    }

    #[test]
    fn bootstrap_request_has_no_command() {
        let v = serde_json::to_value(BootstrapRequest::new(50123)).unwrap();
        assert_eq!(v["Orchestrator"], "Discover");
        assert_eq!(v["Reply Port"], 50123);
        assert!(v.get("Command").is_none());
        assert!(v.get("Provider").is_none());
        assert_eq!(v.as_object().unwrap().len(), 2);
    }
}

//! Device identity and the envelopes the device sends back to its controller.

use serde::Serialize;

use crate::assignment::ServerId;
use crate::protocol::{Command, DeviceDetails, Envelope, ACK};

/// What the device reports about itself in Discover/Refresh/Add replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub product_name: String,
    pub hardware_model: String,
    pub version: String,
    pub hostname: String,
    pub mac_address: String,
    pub ip_address: String,
}

/// `Parameter` object of a Discover reply.
#[derive(Serialize)]
struct DiscoverParameter<'a> {
    #[serde(rename = "Server ID")]
    server_id: &'a str,
    #[serde(rename = "Hostname")]
    hostname: &'a str,
    #[serde(rename = "MAC Address")]
    mac_address: &'a str,
    #[serde(flatten)]
    details: DeviceDetails,
}

impl DeviceIdentity {
    fn details(&self, timestamp: &str) -> DeviceDetails {
        DeviceDetails {
            product_name: Some(self.product_name.clone()),
            hardware_model: Some(self.hardware_model.clone()),
            version: Some(self.version.clone()),
            ip_address: Some(self.ip_address.clone()),
            local_timestamp: Some(timestamp.to_string()),
        }
    }

    fn stamped(&self, command: Command) -> Envelope {
        Envelope {
            hostname: Some(self.hostname.clone()),
            mac_address: Some(self.mac_address.clone()),
            ..Envelope::from_device(command)
        }
    }

    /// Device information for Discover and Refresh. `server_id` is empty when unassigned.
    pub fn discover_reply(&self, server_id: Option<&ServerId>, timestamp: &str) -> Envelope {
        let param = DiscoverParameter {
            server_id: server_id.map(ServerId::as_str).unwrap_or(""),
            hostname: &self.hostname,
            mac_address: &self.mac_address,
            details: self.details(timestamp),
        };
        Envelope {
            parameter: serde_json::to_value(param).ok(),
            ..self.stamped(Command::Discover)
        }
    }

    /// Add acknowledgement: `ACK` plus identity as flat fields.
    pub fn add_reply(&self, timestamp: &str) -> Envelope {
        Envelope {
            details: self.details(timestamp),
            ..self.ack_reply(Command::Add)
        }
    }

    /// Plain acknowledgement for `command`.
    pub fn ack_reply(&self, command: Command) -> Envelope {
        Envelope {
            parameter: Some(serde_json::Value::from(ACK)),
            ..self.stamped(command)
        }
    }

    /// Ask the controller to stream the pushed configuration.
    pub fn push_request(&self) -> Envelope {
        Envelope {
            parameter: Some(serde_json::Value::from(self.mac_address.as_str())),
            ..self.stamped(Command::Push)
        }
    }
}

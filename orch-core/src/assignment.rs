//! Assignment record: which controller owns this device, and the guard that protects it.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::{ControllerAdvert, DEFAULT_PORT};

/// Length of a controller identifier.
pub const SERVER_ID_LEN: usize = 15;

/// Controller identifier: 15 uppercase ASCII alphanumerics.
/// The only authorization token in the protocol; compared exactly.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServerId(String);

impl ServerId {
    /// Normalize (trim, uppercase) and validate. `None` if not 15 alphanumerics.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_ascii_uppercase();
        if s.len() == SERVER_ID_LEN && s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Some(ServerId(s))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable ownership record, persisted as the `Orchestrator` section of the device configuration.
///
/// When `assigned` is false any stored `server_id` is ignored by the guard.
/// A stored section that claims `Assigned` without a usable `Server ID` loads as unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredRecord")]
pub struct AssignmentRecord {
    #[serde(rename = "Assigned")]
    pub assigned: bool,
    #[serde(rename = "Server ID", serialize_with = "ser_server_id")]
    pub server_id: Option<ServerId>,
    #[serde(rename = "IP Address", serialize_with = "ser_addr")]
    pub controller_addr: Option<IpAddr>,
    #[serde(rename = "Port")]
    pub controller_port: u16,
}

/// `Orchestrator` section as read from disk, before `assigned` is checked against the id.
#[derive(Deserialize)]
struct StoredRecord {
    #[serde(rename = "Assigned", default)]
    assigned: bool,
    #[serde(rename = "Server ID", default, deserialize_with = "de_server_id")]
    server_id: Option<ServerId>,
    #[serde(rename = "IP Address", default, deserialize_with = "de_addr")]
    controller_addr: Option<IpAddr>,
    #[serde(rename = "Port", default = "default_port")]
    controller_port: u16,
}

impl From<StoredRecord> for AssignmentRecord {
    fn from(r: StoredRecord) -> Self {
        Self {
            assigned: r.assigned && r.server_id.is_some(),
            server_id: r.server_id,
            controller_addr: r.controller_addr,
            controller_port: r.controller_port,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn ser_server_id<S: Serializer>(v: &Option<ServerId>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(v.as_ref().map(ServerId::as_str).unwrap_or(""))
}

fn de_server_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ServerId>, D::Error> {
    let raw: Option<String> = Deserialize::deserialize(d)?;
    Ok(raw.as_deref().and_then(ServerId::parse))
}

fn ser_addr<S: Serializer>(v: &Option<IpAddr>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(ip) => s.collect_str(ip),
        None => s.serialize_str(""),
    }
}

fn de_addr<'de, D: Deserializer<'de>>(d: D) -> Result<Option<IpAddr>, D::Error> {
    let raw: Option<String> = Deserialize::deserialize(d)?;
    Ok(raw.as_deref().and_then(parse_controller_addr))
}

/// Parse a controller address; unspecified and broadcast addresses are not usable endpoints.
pub fn parse_controller_addr(raw: &str) -> Option<IpAddr> {
    let ip: IpAddr = raw.trim().parse().ok()?;
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() || v4.is_broadcast() => None,
        IpAddr::V6(v6) if v6.is_unspecified() => None,
        _ => Some(ip),
    }
}

impl Default for AssignmentRecord {
    fn default() -> Self {
        Self {
            assigned: false,
            server_id: None,
            controller_addr: None,
            controller_port: DEFAULT_PORT,
        }
    }
}

/// Why the guard refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("device is not assigned")]
    NotAssigned,
    #[error("Server ID mismatch")]
    ServerIdMismatch,
}

/// Result of folding a bootstrap reply into the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertOutcome {
    /// Unassigned device took the advertised controller endpoint.
    Adopted,
    /// Owning controller moved; address or port updated.
    AddressUpdated,
    /// Owning controller, same endpoint.
    Unchanged,
    /// Reply came from a controller that does not own this device.
    ForeignIgnored,
    /// Advert had no usable identifier or address.
    Invalid,
}

impl AdvertOutcome {
    /// Whether the record changed and must be persisted.
    pub fn changed(&self) -> bool {
        matches!(self, AdvertOutcome::Adopted | AdvertOutcome::AddressUpdated)
    }
}

impl AssignmentRecord {
    /// The guard: assigned, and `server_id` equals the stored id exactly.
    pub fn check(&self, server_id: Option<&str>) -> Result<(), GuardError> {
        if !self.assigned {
            return Err(GuardError::NotAssigned);
        }
        match (&self.server_id, server_id) {
            (Some(stored), Some(given)) if stored.as_str() == given => Ok(()),
            _ => Err(GuardError::ServerIdMismatch),
        }
    }

    /// Bind to a controller.
    pub fn assign(&mut self, server_id: ServerId) {
        self.assigned = true;
        self.server_id = Some(server_id);
    }

    /// Drop the binding. The controller endpoint is kept for the next Discover/Add.
    pub fn clear(&mut self) {
        self.assigned = false;
        self.server_id = None;
    }

    /// Apply a bootstrap advert. `sender` stands in for a missing advert address.
    ///
    /// Unassigned: adopt identifier and endpoint (trust on first use; still unassigned).
    /// Assigned: only the owning controller may move the endpoint.
    pub fn apply_advert(&mut self, advert: &ControllerAdvert, sender: IpAddr) -> AdvertOutcome {
        let addr = match advert.ip_address.as_deref() {
            Some(raw) if !raw.trim().is_empty() => match parse_controller_addr(raw) {
                Some(ip) => ip,
                None => return AdvertOutcome::Invalid,
            },
            _ => sender,
        };
        let port = advert.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT);
        let advertised_id = ServerId::parse(&advert.server_id);

        if !self.assigned {
            if let Some(id) = advertised_id {
                self.server_id = Some(id);
            }
            self.controller_addr = Some(addr);
            self.controller_port = port;
            return AdvertOutcome::Adopted;
        }

        match (&self.server_id, advertised_id) {
            (Some(stored), Some(id)) if *stored == id => {
                if self.controller_addr == Some(addr) && self.controller_port == port {
                    AdvertOutcome::Unchanged
                } else {
                    self.controller_addr = Some(addr);
                    self.controller_port = port;
                    AdvertOutcome::AddressUpdated
                }
            }
            (_, None) => AdvertOutcome::Invalid,
            _ => AdvertOutcome::ForeignIgnored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "ABCDEFGHJKLMNPQ";

    fn assigned() -> AssignmentRecord {
        let mut r = AssignmentRecord::default();
        r.assign(ServerId::parse(ID).unwrap());
        r.controller_addr = Some("10.0.0.2".parse().unwrap());
        r
    }

    fn advert(id: &str, ip: Option<&str>, port: Option<u16>) -> ControllerAdvert {
        ControllerAdvert {
            server_id: id.to_string(),
            ip_address: ip.map(str::to_string),
            port,
        }
    }

    #[test]
    fn server_id_normalizes_and_validates() {
        assert_eq!(ServerId::parse(" abcdefghjklmnpq ").unwrap().as_str(), ID);
        assert!(ServerId::parse("ABCDEFGHJKLMNP").is_none());
        assert!(ServerId::parse("ABCDEFGHJKLMNPQR").is_none());
        assert!(ServerId::parse("ABCDEFGHJKLMN-Q").is_none());
        assert!(ServerId::parse("").is_none());
    }

    #[test]
    fn guard_requires_assignment() {
        let r = AssignmentRecord::default();
        assert_eq!(r.check(Some(ID)), Err(GuardError::NotAssigned));
    }

    #[test]
    fn guard_requires_exact_match() {
        let r = assigned();
        assert_eq!(r.check(Some(ID)), Ok(()));
        assert_eq!(
            r.check(Some("abcdefghjklmnpq")),
            Err(GuardError::ServerIdMismatch)
        );
        assert_eq!(
            r.check(Some("ZZZZZZZZZZZZZZZ")),
            Err(GuardError::ServerIdMismatch)
        );
        assert_eq!(r.check(None), Err(GuardError::ServerIdMismatch));
    }

    #[test]
    fn stale_server_id_ignored_when_unassigned() {
        let mut r = assigned();
        r.assigned = false;
        assert_eq!(r.check(Some(ID)), Err(GuardError::NotAssigned));
    }

    #[test]
    fn clear_resets_binding() {
        let mut r = assigned();
        r.clear();
        assert!(!r.assigned);
        assert!(r.server_id.is_none());
        assert_eq!(r.controller_addr, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn serializes_as_orchestrator_section() {
        let v = serde_json::to_value(assigned()).unwrap();
        assert_eq!(v["Assigned"], true);
        assert_eq!(v["Server ID"], ID);
        assert_eq!(v["IP Address"], "10.0.0.2");
        assert_eq!(v["Port"], 30030);
        let back: AssignmentRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, assigned());
    }

    #[test]
    fn deserializes_defaults_and_invalid_fields() {
        let r: AssignmentRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(r, AssignmentRecord::default());
        let r: AssignmentRecord = serde_json::from_str(
            r#"{"Assigned":false,"Server ID":"short","IP Address":"255.255.255.255"}"#,
        )
        .unwrap();
        assert!(r.server_id.is_none());
        assert!(r.controller_addr.is_none());
    }

    #[test]
    fn assigned_without_usable_id_loads_unassigned() {
        for raw in [
            r#"{"Assigned":true,"Server ID":"abc"}"#,
            r#"{"Assigned":true,"Server ID":""}"#,
            r#"{"Assigned":true}"#,
        ] {
            let r: AssignmentRecord = serde_json::from_str(raw).unwrap();
            assert!(!r.assigned, "{}", raw);
            assert!(r.server_id.is_none());
            assert_eq!(r.check(Some(ID)), Err(GuardError::NotAssigned));
        }
        let r: AssignmentRecord =
            serde_json::from_str(&format!(r#"{{"Assigned":true,"Server ID":"{}"}}"#, ID)).unwrap();
        assert!(r.assigned);
    }

    #[test]
    fn unassigned_adopts_advert() {
        let mut r = AssignmentRecord::default();
        let sender: IpAddr = "192.168.1.9".parse().unwrap();
        let out = r.apply_advert(&advert(ID, Some("192.168.1.10"), Some(31000)), sender);
        assert_eq!(out, AdvertOutcome::Adopted);
        assert!(!r.assigned);
        assert_eq!(r.server_id.as_ref().unwrap().as_str(), ID);
        assert_eq!(r.controller_addr, Some("192.168.1.10".parse().unwrap()));
        assert_eq!(r.controller_port, 31000);
    }

    #[test]
    fn advert_without_address_uses_sender() {
        let mut r = AssignmentRecord::default();
        let sender: IpAddr = "192.168.1.9".parse().unwrap();
        r.apply_advert(&advert(ID, None, None), sender);
        assert_eq!(r.controller_addr, Some(sender));
        assert_eq!(r.controller_port, DEFAULT_PORT);
    }

    #[test]
    fn owner_may_move_endpoint() {
        let mut r = assigned();
        let sender: IpAddr = "10.0.0.3".parse().unwrap();
        assert_eq!(
            r.apply_advert(&advert(ID, Some("10.0.0.2"), Some(30030)), sender),
            AdvertOutcome::Unchanged
        );
        assert_eq!(
            r.apply_advert(&advert(ID, Some("10.0.0.3"), Some(30030)), sender),
            AdvertOutcome::AddressUpdated
        );
        assert_eq!(r.controller_addr, Some(sender));
        assert!(r.assigned);
    }

    #[test]
    fn foreign_controller_cannot_hijack() {
        let mut r = assigned();
        let before = r.clone();
        let sender: IpAddr = "10.9.9.9".parse().unwrap();
        let out = r.apply_advert(&advert("ZZZZZZZZZZZZZZZ", Some("10.9.9.9"), Some(1)), sender);
        assert_eq!(out, AdvertOutcome::ForeignIgnored);
        assert_eq!(r, before);
    }

    #[test]
    fn broadcast_advert_address_is_invalid() {
        let mut r = AssignmentRecord::default();
        let sender: IpAddr = "10.0.0.1".parse().unwrap();
        let out = r.apply_advert(&advert(ID, Some("255.255.255.255"), None), sender);
        assert_eq!(out, AdvertOutcome::Invalid);
        assert_eq!(r, AssignmentRecord::default());
        assert!(!out.changed());
    }
}

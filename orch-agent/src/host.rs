//! Device identity from the host: hostname, primary interface address and MAC.

use std::net::IpAddr;
use std::path::Path;

use orch_core::DeviceIdentity;
use tracing::warn;

use crate::config::Config;

const PRODUCT_NAME: &str = "orch-agent";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const UNKNOWN_MAC: &str = "00:00:00:00:00:00";
const SYS_NET: &str = "/sys/class/net";

/// Identity reported to the controller. Config overrides win over detection.
pub fn identity(cfg: &Config) -> DeviceIdentity {
    let ip = local_ip_address::local_ip().ok();
    let hostname = cfg.hostname.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| PRODUCT_NAME.to_string())
    });
    let mac_address = cfg
        .mac_address
        .clone()
        .or_else(|| ip.and_then(mac_for_ip))
        .unwrap_or_else(|| {
            warn!("no MAC address detected; set mac_address in the config");
            UNKNOWN_MAC.to_string()
        });
    DeviceIdentity {
        product_name: PRODUCT_NAME.to_string(),
        hardware_model: cfg
            .hardware_model
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
        version: VERSION.to_string(),
        hostname,
        mac_address,
        ip_address: ip.map(|i| i.to_string()).unwrap_or_default(),
    }
}

/// MAC of the interface carrying `ip`, read from sysfs.
fn mac_for_ip(ip: IpAddr) -> Option<String> {
    let ifaces = local_ip_address::list_afinet_netifas().ok()?;
    let (name, _) = ifaces.into_iter().find(|(_, addr)| *addr == ip)?;
    read_mac(&Path::new(SYS_NET).join(name).join("address"))
}

fn read_mac(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    normalize_mac(&raw)
}

/// `aa:bb:cc:dd:ee:ff` → `AA:BB:CC:DD:EE:FF`. All-zero addresses are rejected.
fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_uppercase();
    let octets: Vec<&str> = mac.split(':').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    (well_formed && mac != UNKNOWN_MAC).then_some(mac)
}

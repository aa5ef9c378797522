//! Basic API types used by most of the PLM code.

use proxmox_schema::api_types::SAFE_ID_REGEX;
use proxmox_schema::{const_regex, ApiStringFormat, IntegerSchema, Schema, StringSchema};

pub use proxmox_auth_api::types::{Authid, Userid};

mod user;
pub use user::*;

mod class;
pub use class::*;

mod deployment;
pub use deployment::*;

mod assignment;
pub use assignment::*;

mod inventory;
pub use inventory::*;

mod template;
pub use template::*;

mod iso;
pub use iso::*;

pub mod clusters;

pub mod pve;

#[rustfmt::skip]
#[macro_use]
mod local_macros {
    macro_rules! IPV4_OCTET { () => (r"(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]\d|\d)") }
    macro_rules! IPV4RE { () => (concat!(r"(?:(?:", IPV4_OCTET!(), r"\.){3}", IPV4_OCTET!(), r")")) }
}

const_regex! {
    pub IP_V4_REGEX = concat!(r"^", IPV4RE!(), r"$");
    pub CIDR_V4_REGEX = concat!(r"^", IPV4RE!(), r"/\d{1,2}$");
    pub HOSTNAME_REGEX = r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9\-]*[a-zA-Z0-9])?)$";
    pub MAC_ADDRESS_REGEX = r"^(?:[0-9a-fA-F]{2}[:-]){5}[0-9a-fA-F]{2}$";
    pub VOLUME_ID_REGEX = r"^[A-Za-z0-9_\.\-]+:[A-Za-z0-9_/\.\-]+$";
    pub PASSWORD_REGEX = r"^[[:^cntrl:]]*$"; // everything but control characters
    pub SNAPSHOT_NAME_REGEX = r"^[a-zA-Z0-9][a-zA-Z0-9_\-]*$";
    pub VM_NAME_REGEX = r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$";
}

pub const PROXMOX_SAFE_ID_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&SAFE_ID_REGEX);
pub const IP_V4_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&IP_V4_REGEX);
pub const CIDR_V4_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&CIDR_V4_REGEX);
pub const HOSTNAME_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&HOSTNAME_REGEX);
pub const MAC_ADDRESS_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&MAC_ADDRESS_REGEX);
pub const VOLUME_ID_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&VOLUME_ID_REGEX);
pub const PASSWORD_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&PASSWORD_REGEX);
pub const SNAPSHOT_NAME_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&SNAPSHOT_NAME_REGEX);
pub const VM_NAME_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&VM_NAME_REGEX);

pub const CLUSTER_ID_SCHEMA: Schema = StringSchema::new("Cluster ID.")
    .format(&PROXMOX_SAFE_ID_FORMAT)
    .min_length(2)
    .max_length(32)
    .schema();

pub const NODE_SCHEMA: Schema = StringSchema::new("Node name.")
    .format(&HOSTNAME_FORMAT)
    .schema();

pub const VMID_SCHEMA: Schema = IntegerSchema::new("The (unique) ID of the VM.")
    .minimum(1)
    .maximum(999999999)
    .schema();

pub const SNAPSHOT_NAME_SCHEMA: Schema = StringSchema::new("The name of the snapshot.")
    .format(&SNAPSHOT_NAME_FORMAT)
    .max_length(40)
    .schema();

pub const MAC_ADDRESS_SCHEMA: Schema = StringSchema::new("Guest MAC address.")
    .format(&MAC_ADDRESS_FORMAT)
    .schema();

pub const IP_V4_SCHEMA: Schema = StringSchema::new("IPv4 address.")
    .format(&IP_V4_FORMAT)
    .schema();

pub const PLM_PASSWORD_SCHEMA: Schema = StringSchema::new("User Password.")
    .format(&PASSWORD_FORMAT)
    .min_length(5)
    .max_length(64)
    .schema();

pub const VM_NAME_SCHEMA: Schema = StringSchema::new("DNS-safe VM name.")
    .format(&VM_NAME_FORMAT)
    .max_length(63)
    .schema();

pub const JOIN_TOKEN_SCHEMA: Schema = StringSchema::new("Class join token.")
    .min_length(16)
    .max_length(64)
    .schema();

/// Placeholder values that must never overwrite a real, cached IP address.
pub const IP_PLACEHOLDERS: &[&str] = &["", "N/A", "Fetching..."];

/// Returns true if `ip` carries no real address information.
pub fn is_ip_placeholder(ip: &str) -> bool {
    IP_PLACEHOLDERS.contains(&ip)
}

/// Canonical MAC comparison form: lowercase, separators stripped.
///
/// Returns `None` if the input does not reduce to 12 hex digits.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let normalized: String = mac
        .chars()
        .filter(|c| *c != ':' && *c != '-' && *c != '.')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if normalized.len() == 12 && normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(normalized)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("AA:BB:CC:DD:EE:FF").as_deref(),
            Some("aabbccddeeff")
        );
        assert_eq!(
            normalize_mac("aa-bb-cc-dd-ee-ff").as_deref(),
            Some("aabbccddeeff")
        );
        assert_eq!(normalize_mac("02:00:0c:29:ab:cd").as_deref(), Some("02000c29abcd"));
        assert_eq!(normalize_mac("not-a-mac"), None);
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(normalize_mac(""), None);
    }

    #[test]
    fn test_ip_placeholders() {
        assert!(is_ip_placeholder(""));
        assert!(is_ip_placeholder("N/A"));
        assert!(is_ip_placeholder("Fetching..."));
        assert!(!is_ip_placeholder("10.0.0.5"));
    }
}

//! Empty VM shell creation for overlay deployments.
//!
//! The shell inherits everything except disks from the template. The field
//! set is explicit - a guest config is not a free-form map here, every
//! option we copy is named.

use serde_json::{json, Value};

use plm_api_types::pve::GuestConfig;

/// The non-disk config options copied from a template onto a new VM shell.
///
/// All fields optional; absent options are simply not set on the new guest.
#[derive(Clone, Debug, Default)]
pub struct VmShellConfig {
    // identity
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,

    // CPU
    pub cores: Option<u64>,
    pub sockets: Option<u64>,
    pub vcpus: Option<u64>,
    pub cpu: Option<String>,
    pub cpulimit: Option<String>,
    pub cpuunits: Option<u64>,
    pub numa: Option<String>,
    pub affinity: Option<String>,

    // memory
    pub memory: Option<u64>,
    pub balloon: Option<u64>,
    pub shares: Option<u64>,
    pub hugepages: Option<String>,

    // machine & firmware
    pub machine: Option<String>,
    pub bios: Option<String>,
    pub ostype: Option<String>,
    pub arch: Option<String>,
    pub kvm: Option<String>,
    pub acpi: Option<String>,
    pub smbios1: Option<String>,
    pub vmgenid: Option<String>,

    // boot
    pub boot: Option<String>,
    pub bootdisk: Option<String>,
    pub onboot: Option<String>,
    pub startup: Option<String>,
    pub startdate: Option<String>,
    pub reboot: Option<String>,
    pub protection: Option<String>,

    // display & input
    pub vga: Option<String>,
    pub tablet: Option<String>,
    pub keyboard: Option<String>,
    pub localtime: Option<String>,

    // controllers & special disks (TPM/EFI are recreated, not shared)
    pub scsihw: Option<String>,
    pub efidisk0: Option<String>,
    pub tpmstate0: Option<String>,

    // network devices
    pub net0: Option<String>,
    pub net1: Option<String>,
    pub net2: Option<String>,
    pub net3: Option<String>,
    pub net4: Option<String>,
    pub net5: Option<String>,
    pub net6: Option<String>,
    pub net7: Option<String>,

    // peripherals
    pub agent: Option<String>,
    pub audio0: Option<String>,
    pub rng0: Option<String>,
    pub serial0: Option<String>,
    pub serial1: Option<String>,
    pub serial2: Option<String>,
    pub serial3: Option<String>,
    pub usb0: Option<String>,
    pub usb1: Option<String>,
    pub usb2: Option<String>,
    pub usb3: Option<String>,
    pub watchdog: Option<String>,
    pub hotplug: Option<String>,

    // cloud-init
    pub ciuser: Option<String>,
    pub cipassword: Option<String>,
    pub citype: Option<String>,
    pub cicustom: Option<String>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub sshkeys: Option<String>,
}

/// Generate a locally administered MAC address in Proxmox notation.
pub fn generate_mac_address() -> String {
    let bytes = proxmox_sys::linux::random_data(5).unwrap_or_else(|_| vec![0u8; 5]);
    format!(
        "02:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// Replace the MAC portion of a net option with a fresh address.
///
/// `virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0` keeps model and options, only the
/// address changes so clones do not collide on L2.
fn reassign_mac(net_value: &str, mac: &str) -> String {
    net_value
        .split(',')
        .map(|option| match option.split_once('=') {
            Some((key, value)) if plm_api_types::normalize_mac(value).is_some() => {
                format!("{key}={mac}")
            }
            _ => option.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl VmShellConfig {
    /// Extract the copyable fields from a template's config.
    ///
    /// Disk slots are intentionally left out - the overlay pipeline attaches
    /// its own; EFI/TPM volume references are reduced to a `storage:1`
    /// request so the cluster allocates fresh state volumes.
    pub fn from_template_config(config: &GuestConfig, storage: &str) -> Self {
        let string = |key: &str| config.get_str(key).map(str::to_string);
        let number = |key: &str| config.get_u64(key);

        let fresh_state_volume = |key: &str| {
            config.get_str(key).map(|value| {
                let options: Vec<&str> = value.split(',').skip(1).collect();
                if options.is_empty() {
                    format!("{storage}:1")
                } else {
                    format!("{storage}:1,{}", options.join(","))
                }
            })
        };

        let net = |key: &str| {
            config
                .get_str(key)
                .map(|value| reassign_mac(value, &generate_mac_address()))
        };

        Self {
            name: None, // set per student VM
            description: string("description"),
            tags: string("tags"),
            cores: number("cores"),
            sockets: number("sockets"),
            vcpus: number("vcpus"),
            cpu: string("cpu"),
            cpulimit: string("cpulimit"),
            cpuunits: number("cpuunits"),
            numa: string("numa"),
            affinity: string("affinity"),
            memory: number("memory"),
            balloon: number("balloon"),
            shares: number("shares"),
            hugepages: string("hugepages"),
            machine: string("machine"),
            bios: string("bios"),
            ostype: string("ostype"),
            arch: string("arch"),
            kvm: string("kvm"),
            acpi: string("acpi"),
            smbios1: string("smbios1"),
            vmgenid: Some("1".to_string()), // request a fresh generation id
            boot: string("boot"),
            bootdisk: string("bootdisk"),
            onboot: string("onboot"),
            startup: string("startup"),
            startdate: string("startdate"),
            reboot: string("reboot"),
            protection: None, // clones must stay deletable
            vga: string("vga"),
            tablet: string("tablet"),
            keyboard: string("keyboard"),
            localtime: string("localtime"),
            scsihw: string("scsihw"),
            efidisk0: fresh_state_volume("efidisk0"),
            tpmstate0: fresh_state_volume("tpmstate0"),
            net0: net("net0"),
            net1: net("net1"),
            net2: net("net2"),
            net3: net("net3"),
            net4: net("net4"),
            net5: net("net5"),
            net6: net("net6"),
            net7: net("net7"),
            agent: Some("1".to_string()), // the lab workflow needs the agent
            audio0: string("audio0"),
            rng0: string("rng0"),
            serial0: string("serial0"),
            serial1: string("serial1"),
            serial2: string("serial2"),
            serial3: string("serial3"),
            usb0: string("usb0"),
            usb1: string("usb1"),
            usb2: string("usb2"),
            usb3: string("usb3"),
            watchdog: string("watchdog"),
            hotplug: string("hotplug"),
            ciuser: string("ciuser"),
            cipassword: string("cipassword"),
            citype: string("citype"),
            cicustom: string("cicustom"),
            nameserver: string("nameserver"),
            searchdomain: string("searchdomain"),
            sshkeys: string("sshkeys"),
        }
    }

    /// The MAC address assigned to the primary network device, if any.
    pub fn primary_mac(&self) -> Option<String> {
        self.net0
            .as_deref()
            .and_then(|net| net.split(',').find_map(|option| {
                let (_key, value) = option.split_once('=')?;
                plm_api_types::normalize_mac(value)
            }))
    }

    /// Render as API parameters for VM creation (`POST /nodes/{n}/qemu`).
    pub fn to_api_options(&self, vmid: u32) -> Value {
        let mut options = json!({ "vmid": vmid });
        let map = options.as_object_mut().unwrap();

        let mut set_str = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                map.insert(key.to_string(), json!(value));
            }
        };

        set_str("name", &self.name);
        set_str("description", &self.description);
        set_str("tags", &self.tags);
        set_str("cpu", &self.cpu);
        set_str("cpulimit", &self.cpulimit);
        set_str("numa", &self.numa);
        set_str("affinity", &self.affinity);
        set_str("hugepages", &self.hugepages);
        set_str("machine", &self.machine);
        set_str("bios", &self.bios);
        set_str("ostype", &self.ostype);
        set_str("arch", &self.arch);
        set_str("kvm", &self.kvm);
        set_str("acpi", &self.acpi);
        set_str("smbios1", &self.smbios1);
        set_str("vmgenid", &self.vmgenid);
        set_str("boot", &self.boot);
        set_str("bootdisk", &self.bootdisk);
        set_str("onboot", &self.onboot);
        set_str("startup", &self.startup);
        set_str("startdate", &self.startdate);
        set_str("reboot", &self.reboot);
        set_str("protection", &self.protection);
        set_str("vga", &self.vga);
        set_str("tablet", &self.tablet);
        set_str("keyboard", &self.keyboard);
        set_str("localtime", &self.localtime);
        set_str("scsihw", &self.scsihw);
        set_str("efidisk0", &self.efidisk0);
        set_str("tpmstate0", &self.tpmstate0);
        set_str("net0", &self.net0);
        set_str("net1", &self.net1);
        set_str("net2", &self.net2);
        set_str("net3", &self.net3);
        set_str("net4", &self.net4);
        set_str("net5", &self.net5);
        set_str("net6", &self.net6);
        set_str("net7", &self.net7);
        set_str("agent", &self.agent);
        set_str("audio0", &self.audio0);
        set_str("rng0", &self.rng0);
        set_str("serial0", &self.serial0);
        set_str("serial1", &self.serial1);
        set_str("serial2", &self.serial2);
        set_str("serial3", &self.serial3);
        set_str("usb0", &self.usb0);
        set_str("usb1", &self.usb1);
        set_str("usb2", &self.usb2);
        set_str("usb3", &self.usb3);
        set_str("watchdog", &self.watchdog);
        set_str("hotplug", &self.hotplug);
        set_str("ciuser", &self.ciuser);
        set_str("cipassword", &self.cipassword);
        set_str("citype", &self.citype);
        set_str("cicustom", &self.cicustom);
        set_str("nameserver", &self.nameserver);
        set_str("searchdomain", &self.searchdomain);
        set_str("sshkeys", &self.sshkeys);

        for (key, value) in [
            ("cores", self.cores),
            ("sockets", self.sockets),
            ("vcpus", self.vcpus),
            ("cpuunits", self.cpuunits),
            ("memory", self.memory),
            ("balloon", self.balloon),
            ("shares", self.shares),
        ] {
            if let Some(value) = value {
                map.insert(key.to_string(), json!(value));
            }
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_config() -> GuestConfig {
        serde_json::from_str(
            r#"{
                "name": "win11-template",
                "template": 1,
                "cores": 4, "sockets": 1, "memory": 8192,
                "cpu": "host", "machine": "pc-q35-8.1", "bios": "ovmf",
                "ostype": "win11", "vga": "virtio", "scsihw": "virtio-scsi-pci",
                "boot": "order=scsi0", "bootdisk": "scsi0", "agent": "1",
                "efidisk0": "tank:vm-9000-disk-1,efitype=4m,pre-enrolled-keys=1",
                "tpmstate0": "tank:vm-9000-disk-2,version=v2.0",
                "scsi0": "tank:vm-9000-disk-0,size=64G",
                "net0": "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,firewall=1"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_shell_config_from_template() {
        let shell = VmShellConfig::from_template_config(&template_config(), "tank");

        assert_eq!(shell.cores, Some(4));
        assert_eq!(shell.machine.as_deref(), Some("pc-q35-8.1"));
        assert_eq!(shell.bios.as_deref(), Some("ovmf"));
        assert_eq!(shell.scsihw.as_deref(), Some("virtio-scsi-pci"));

        // EFI/TPM become fresh allocation requests, options preserved
        assert_eq!(
            shell.efidisk0.as_deref(),
            Some("tank:1,efitype=4m,pre-enrolled-keys=1")
        );
        assert_eq!(shell.tpmstate0.as_deref(), Some("tank:1,version=v2.0"));

        // the clone gets its own MAC but keeps model, bridge and options
        let net0 = shell.net0.as_deref().unwrap();
        assert!(net0.starts_with("virtio=02:"));
        assert!(net0.ends_with(",bridge=vmbr0,firewall=1"));
        assert!(shell.primary_mac().is_some());
        assert_ne!(shell.primary_mac().as_deref(), Some("aabbccddeeff"));

        // guest agent always on for lab clones
        assert_eq!(shell.agent.as_deref(), Some("1"));
    }

    #[test]
    fn test_api_options_skip_absent_fields() {
        let mut shell = VmShellConfig::from_template_config(&template_config(), "tank");
        shell.name = Some("lab-student-1-12300".to_string());

        let options = shell.to_api_options(12300);
        assert_eq!(options["vmid"], 12300);
        assert_eq!(options["name"], "lab-student-1-12300");
        assert_eq!(options["cores"], 4);
        // no disk slots in shell options
        assert!(options.get("scsi0").is_none());
        // unset options are absent, not null
        assert!(options.get("audio0").is_none());
    }

    #[test]
    fn test_generated_mac_is_locally_administered() {
        let mac = generate_mac_address();
        assert!(mac.starts_with("02:"));
        assert_eq!(plm_api_types::normalize_mac(&mac).unwrap().len(), 12);
    }
}

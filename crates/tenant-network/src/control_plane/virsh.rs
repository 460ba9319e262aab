//! libvirt control plane backend
//!
//! Drives libvirt through the `virsh` CLI. Arguments are always passed as an
//! argv vector, never through a shell, and network XML goes through a temp
//! file. XML is rendered and read back with `quick-xml`'s serde support. Children are killed when the calling future is dropped, so an outer
//! timeout really abandons the call.

use super::traits::{BackendType, ControlPlane, DefineOutcome, DhcpHost, NetworkDefinition};
use crate::config::ControlPlaneConfig;
use crate::models::{DhcpRange, MacAddress};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

/// Output of a finished `virsh` invocation
struct VirshOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl VirshOutput {
    fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.to_ascii_lowercase().contains(needle)
    }

    fn network_missing(&self) -> bool {
        self.stderr_contains("network not found")
            || self.stderr_contains("no network with matching name")
    }
}

/// `virsh` command backend
pub struct VirshControlPlane {
    /// Path to the virsh binary
    virsh_path: String,
    /// libvirt connection URI (`-c`), default connection when unset
    connect_uri: Option<String>,
    /// Bridge device name prefix, suffixed with the subnet's third octet
    bridge_prefix: String,
}

impl VirshControlPlane {
    pub fn new(virsh_path: impl Into<String>, connect_uri: Option<String>) -> Self {
        Self {
            virsh_path: virsh_path.into(),
            connect_uri,
            bridge_prefix: "vbr".to_string(),
        }
    }

    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            virsh_path: config.virsh_path.clone(),
            connect_uri: config.connect_uri.clone(),
            bridge_prefix: config.bridge_prefix.clone(),
        }
    }

    pub fn with_bridge_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bridge_prefix = prefix.into();
        self
    }

    fn bridge_name(&self, definition: &NetworkDefinition) -> String {
        format!("{}{}", self.bridge_prefix, definition.slot())
    }

    /// Run virsh and capture its output, whatever the exit status
    async fn run(&self, operation: &'static str, args: &[&str]) -> Result<VirshOutput> {
        let mut command = Command::new(&self.virsh_path);
        if let Some(uri) = &self.connect_uri {
            command.arg("-c").arg(uri);
        }
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(operation, args = ?args, "Executing virsh");

        let output = command.output().await.map_err(|e| {
            Error::control_plane(
                operation,
                format!("failed to execute {}: {}", self.virsh_path, e),
            )
        })?;

        Ok(VirshOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run virsh and fail on a non-zero exit
    async fn run_checked(&self, operation: &'static str, args: &[&str]) -> Result<String> {
        let output = self.run(operation, args).await?;
        if !output.success {
            return Err(Self::failed(operation, args, &output));
        }
        Ok(output.stdout)
    }

    fn failed(operation: &'static str, args: &[&str], output: &VirshOutput) -> Error {
        Error::control_plane(
            operation,
            format!("virsh {} failed: {}", args.join(" "), output.stderr),
        )
    }

    /// Current XML of a network, `None` when it is not defined
    async fn dump_xml(&self, operation: &'static str, name: &str) -> Result<Option<String>> {
        let args = ["net-dumpxml", name];
        let output = self.run(operation, &args).await?;
        if output.success {
            Ok(Some(output.stdout))
        } else if output.network_missing() {
            Ok(None)
        } else {
            Err(Self::failed(operation, &args, &output))
        }
    }

    async fn update_host(
        &self,
        operation: &'static str,
        command: &str,
        network: &str,
        host: &DhcpHost,
    ) -> Result<VirshOutput> {
        let xml = render_host_xml(operation, host)?;
        let args = [
            "net-update",
            network,
            command,
            "ip-dhcp-host",
            xml.as_str(),
            "--live",
            "--config",
        ];
        self.run(operation, &args).await
    }
}

#[async_trait]
impl ControlPlane for VirshControlPlane {
    fn backend_type(&self) -> BackendType {
        BackendType::Virsh
    }

    #[instrument(skip(self, definition), fields(network = %definition.name, subnet = %definition.subnet))]
    async fn define_network(&self, definition: &NetworkDefinition) -> Result<DefineOutcome> {
        const OP: &str = "define_network";

        if let Some(xml) = self.dump_xml(OP, &definition.name).await? {
            return compare_existing(definition, &xml);
        }

        let xml = render_network_xml(definition, &self.bridge_name(definition))?;
        let mut file = tempfile::Builder::new()
            .prefix("tenant-net-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| Error::control_plane(OP, format!("failed to create temp file: {}", e)))?;
        file.write_all(xml.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::control_plane(OP, format!("failed to write network xml: {}", e)))?;

        let path = file.path().to_string_lossy().to_string();
        let args = ["net-define", path.as_str()];
        let output = self.run(OP, &args).await?;
        if output.success {
            debug!("Defined network");
            return Ok(DefineOutcome::Created);
        }
        // Lost a race against a concurrent definer
        if output.stderr_contains("already exists") {
            if let Some(xml) = self.dump_xml(OP, &definition.name).await? {
                return compare_existing(definition, &xml);
            }
        }
        Err(Self::failed(OP, &args, &output))
    }

    #[instrument(skip(self))]
    async fn start_network(&self, name: &str) -> Result<()> {
        const OP: &str = "start_network";
        let args = ["net-start", name];
        let output = self.run(OP, &args).await?;
        if output.success || output.stderr_contains("already active") {
            return Ok(());
        }
        Err(Self::failed(OP, &args, &output))
    }

    #[instrument(skip(self))]
    async fn autostart_network(&self, name: &str) -> Result<()> {
        self.run_checked("autostart_network", &["net-autostart", name])
            .await
            .map(|_| ())
    }

    async fn is_live(&self, name: &str) -> Result<bool> {
        const OP: &str = "is_live";
        let args = ["net-info", name];
        let output = self.run(OP, &args).await?;
        if output.success {
            return Ok(parse_active(&output.stdout));
        }
        if output.network_missing() {
            return Ok(false);
        }
        Err(Self::failed(OP, &args, &output))
    }

    #[instrument(skip(self, host), fields(mac = %host.mac, ip = %host.ip))]
    async fn add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<()> {
        const OP: &str = "add_dhcp_host";
        let output = self.update_host(OP, "add", network, host).await?;
        if output.success {
            return Ok(());
        }
        Err(Error::control_plane(
            OP,
            format!("net-update add on {} failed: {}", network, output.stderr),
        ))
    }

    #[instrument(skip(self, host), fields(mac = %host.mac, ip = %host.ip))]
    async fn delete_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<bool> {
        const OP: &str = "delete_dhcp_host";

        // libvirt deletes only exact matches, so look up the overlapping entries first
        let Some(xml) = self.dump_xml(OP, network).await? else {
            return Err(Error::control_plane(
                OP,
                format!("network {} not found", network),
            ));
        };
        let stale: Vec<DhcpHost> = parse_network_xml(OP, &xml)?
            .hosts()
            .into_iter()
            .filter(|entry| {
                entry.mac == host.mac || entry.name == host.name || entry.ip == host.ip
            })
            .collect();

        for entry in &stale {
            let output = self.update_host(OP, "delete", network, entry).await?;
            if !output.success && !output.stderr_contains("matching dhcp host entry") {
                return Err(Error::control_plane(
                    OP,
                    format!("net-update delete on {} failed: {}", network, output.stderr),
                ));
            }
            if entry != host {
                warn!(
                    network,
                    mac = %entry.mac,
                    name = %entry.name,
                    ip = %entry.ip,
                    "Removed overlapping DHCP host entry"
                );
            }
        }
        Ok(!stale.is_empty())
    }
}

/// Check a `net-dumpxml` result against the wanted definition
fn compare_existing(definition: &NetworkDefinition, xml: &str) -> Result<DefineOutcome> {
    let mismatch = |detail: String| Error::DefinitionMismatch {
        name: definition.name.clone(),
        detail,
    };
    let document: NetworkXml = quick_xml::de::from_str(xml)
        .map_err(|e| mismatch(format!("existing definition is unreadable: {}", e)))?;
    let existing = document.definition().ok_or_else(|| {
        mismatch("existing definition has no usable <ip>/<range> element".to_string())
    })?;
    match definition.mismatch(&existing) {
        None => Ok(DefineOutcome::AlreadyDefined),
        Some(detail) => Err(mismatch(detail)),
    }
}

// libvirt network XML, as much of it as the engine renders or reads back.
// Attributes carry the `@` prefix quick-xml maps to XML attributes.

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "network")]
struct NetworkXml {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forward: Option<ForwardXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bridge: Option<BridgeXml>,
    #[serde(default)]
    ip: Vec<IpXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ForwardXml {
    #[serde(rename = "@mode")]
    mode: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BridgeXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@stp", default, skip_serializing_if = "Option::is_none")]
    stp: Option<String>,
    #[serde(rename = "@delay", default, skip_serializing_if = "Option::is_none")]
    delay: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IpXml {
    #[serde(rename = "@family", default, skip_serializing_if = "Option::is_none")]
    family: Option<String>,
    #[serde(rename = "@address")]
    address: String,
    #[serde(rename = "@netmask", default, skip_serializing_if = "Option::is_none")]
    netmask: Option<String>,
    #[serde(rename = "@prefix", default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dhcp: Option<DhcpXml>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DhcpXml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<RangeXml>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    host: Vec<HostXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeXml {
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "@end")]
    end: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "host")]
struct HostXml {
    #[serde(rename = "@mac", default, skip_serializing_if = "Option::is_none")]
    mac: Option<String>,
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "@ip", default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
}

impl NetworkXml {
    /// The IPv4 `<ip>` element; libvirt leaves `family` off for IPv4
    fn ipv4(&self) -> Option<&IpXml> {
        self.ip
            .iter()
            .find(|ip| ip.family.as_deref().map_or(true, |f| f == "ipv4"))
    }

    /// Rebuild the definition this document describes
    fn definition(&self) -> Option<NetworkDefinition> {
        let ip = self.ipv4()?;
        let gateway: Ipv4Addr = ip.address.parse().ok()?;
        let prefix = match (&ip.netmask, &ip.prefix) {
            (Some(netmask), _) => u32::from(netmask.parse::<Ipv4Addr>().ok()?).count_ones() as u8,
            (None, Some(prefix)) => prefix.parse().ok()?,
            (None, None) => return None,
        };
        let subnet = Ipv4Net::new(gateway, prefix).ok()?.trunc();
        let range = ip.dhcp.as_ref()?.range.as_ref()?;

        Some(NetworkDefinition {
            name: self.name.clone(),
            subnet,
            gateway,
            dhcp_range: DhcpRange {
                start: range.start.parse().ok()?,
                end: range.end.parse().ok()?,
            },
        })
    }

    /// Static host entries, skipping any that lack a MAC or IP
    fn hosts(&self) -> Vec<DhcpHost> {
        self.ipv4()
            .and_then(|ip| ip.dhcp.as_ref())
            .map(|dhcp| dhcp.host.iter().filter_map(HostXml::to_host).collect())
            .unwrap_or_default()
    }
}

impl HostXml {
    fn to_host(&self) -> Option<DhcpHost> {
        let mac: MacAddress = self.mac.as_deref()?.parse().ok()?;
        let ip: Ipv4Addr = self.ip.as_deref()?.parse().ok()?;
        Some(DhcpHost {
            mac,
            name: self.name.clone().unwrap_or_default(),
            ip,
        })
    }
}

impl From<&DhcpHost> for HostXml {
    fn from(host: &DhcpHost) -> Self {
        Self {
            mac: Some(host.mac.to_string()),
            name: Some(host.name.clone()),
            ip: Some(host.ip.to_string()),
        }
    }
}

/// NAT-forwarded network with the gateway on a bridge and a DHCP range
fn render_network_xml(definition: &NetworkDefinition, bridge: &str) -> Result<String> {
    let document = NetworkXml {
        name: definition.name.clone(),
        forward: Some(ForwardXml {
            mode: "nat".to_string(),
        }),
        bridge: Some(BridgeXml {
            name: bridge.to_string(),
            stp: Some("on".to_string()),
            delay: Some("0".to_string()),
        }),
        ip: vec![IpXml {
            family: None,
            address: definition.gateway.to_string(),
            netmask: Some(definition.subnet.netmask().to_string()),
            prefix: None,
            dhcp: Some(DhcpXml {
                range: Some(RangeXml {
                    start: definition.dhcp_range.start.to_string(),
                    end: definition.dhcp_range.end.to_string(),
                }),
                host: Vec::new(),
            }),
        }],
    };
    quick_xml::se::to_string(&document).map_err(|e| {
        Error::control_plane(
            "define_network",
            format!("failed to render network xml: {}", e),
        )
    })
}

fn render_host_xml(operation: &'static str, host: &DhcpHost) -> Result<String> {
    quick_xml::se::to_string(&HostXml::from(host)).map_err(|e| {
        Error::control_plane(operation, format!("failed to render host xml: {}", e))
    })
}

/// Parse `net-dumpxml` output
fn parse_network_xml(operation: &'static str, xml: &str) -> Result<NetworkXml> {
    quick_xml::de::from_str(xml).map_err(|e| {
        Error::control_plane(operation, format!("unreadable network xml: {}", e))
    })
}

/// Read the `Active:` line of `net-info` output
fn parse_active(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("active"))
        .map(|(_, value)| value.trim().eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantNetwork;

    fn definition() -> NetworkDefinition {
        NetworkDefinition::from(&TenantNetwork::new(
            "userA",
            "10.200.10.0/24".parse().unwrap(),
        ))
    }

    #[test]
    fn test_render_network_xml() {
        let def = definition();
        let xml = render_network_xml(&def, "vbr10").unwrap();

        assert!(xml.starts_with("<network>"));
        assert!(xml.contains(&format!("<name>{}</name>", def.name)));
        assert!(xml.contains(r#"mode="nat""#));
        assert!(xml.contains(r#"name="vbr10""#));
        assert!(xml.contains(r#"address="10.200.10.1" netmask="255.255.255.0""#));
        assert!(xml.contains(r#"start="10.200.10.2" end="10.200.10.254""#));
    }

    #[test]
    fn test_rendered_xml_parses_back() {
        let def = definition();
        let xml = render_network_xml(&def, "vbr10").unwrap();

        let parsed = parse_network_xml("test", &xml).unwrap();
        assert_eq!(parsed.definition().unwrap(), def);
        assert!(parsed.hosts().is_empty());
        assert!(matches!(
            compare_existing(&def, &xml),
            Ok(DefineOutcome::AlreadyDefined)
        ));
    }

    #[test]
    fn test_parse_dumpxml() {
        let xml = r#"<network connections='2'>
  <name>tn-1a2b3c4d-10</name>
  <uuid>5c1f2b8e-0000-4000-8000-000000000000</uuid>
  <!-- edited by hand -->
  <forward mode="nat">
    <nat>
      <port start='1024' end='65535'/>
    </nat>
  </forward>
  <bridge name="vbr10" stp="on" delay="0"/>
  <mac address="52:54:00:aa:bb:cc"/>
  <ip address="10.200.10.1" netmask="255.255.255.0">
    <dhcp>
      <range start="10.200.10.2" end="10.200.10.254"/>
      <host mac="52:54:00:01:02:03" name="vm&apos;1" ip="10.200.10.10"/>
      <host mac='52:54:00:04:05:06' ip='10.200.10.11'/>
      <host id='0:4:7e:7d:f0:7d' ip='10.200.10.12'/>
    </dhcp>
  </ip>
  <ip family="ipv6" address="fd00::1" prefix="64"/>
</network>"#;

        let parsed = parse_network_xml("test", xml).unwrap();
        let def = parsed.definition().unwrap();
        assert_eq!(def.name, "tn-1a2b3c4d-10");
        assert_eq!(def.subnet, "10.200.10.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(def.gateway, Ipv4Addr::new(10, 200, 10, 1));

        let hosts = parsed.hosts();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].name, "vm'1");
        assert_eq!(hosts[0].ip, Ipv4Addr::new(10, 200, 10, 10));
        assert_eq!(hosts[1].name, "");
    }

    #[test]
    fn test_prefix_form_of_ip() {
        let xml = r#"<network><name>n</name><ip address="10.200.10.1" prefix="24"><dhcp><range start="10.200.10.2" end="10.200.10.254"/></dhcp></ip></network>"#;
        let def = parse_network_xml("test", xml).unwrap().definition().unwrap();
        assert_eq!(def.subnet, "10.200.10.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_mismatched_or_unreadable_existing_definition() {
        let def = definition();
        let mut other = def.clone();
        other.subnet = "10.200.11.0/24".parse().unwrap();
        other.gateway = Ipv4Addr::new(10, 200, 11, 1);
        other.dhcp_range = DhcpRange::for_subnet(other.subnet);
        let xml = render_network_xml(&other, "vbr11").unwrap();

        assert!(matches!(
            compare_existing(&def, &xml),
            Err(Error::DefinitionMismatch { .. })
        ));
        assert!(matches!(
            compare_existing(&def, "<network><name>x</name></network>"),
            Err(Error::DefinitionMismatch { .. })
        ));
        assert!(matches!(
            compare_existing(&def, "<network><name>"),
            Err(Error::DefinitionMismatch { .. })
        ));
    }

    #[test]
    fn test_host_xml_escapes_name() {
        let host = DhcpHost {
            mac: "52:54:00:01:02:03".parse().unwrap(),
            name: r#"vm" ip="6.6.6.6' <x>&"#.to_string(),
            ip: Ipv4Addr::new(10, 200, 10, 10),
        };
        let xml = render_host_xml("add_dhcp_host", &host).unwrap();

        assert!(xml.starts_with("<host "));
        assert!(!xml.contains(r#"ip="6.6.6.6""#));
        assert!(!xml.contains("<x>"));

        let document = format!(
            "<network><name>n</name><ip address=\"10.200.10.1\" netmask=\"255.255.255.0\"><dhcp>{}</dhcp></ip></network>",
            xml
        );
        let parsed = parse_network_xml("test", &document).unwrap();
        assert_eq!(parsed.hosts(), vec![host]);
    }

    #[test]
    fn test_parse_active() {
        let info = "Name:           tn-1a2b3c4d-10\nUUID:           x\nActive:         yes\nPersistent:     yes\nAutostart:      yes\nBridge:         vbr10\n";
        assert!(parse_active(info));
        assert!(!parse_active(&info.replace("Active:         yes", "Active:         no")));
        assert!(!parse_active(""));
    }

    #[test]
    fn test_from_config() {
        let config = ControlPlaneConfig {
            bridge_prefix: "tbr".to_string(),
            ..Default::default()
        };
        let cp = VirshControlPlane::from_config(&config);
        assert_eq!(cp.backend_type(), BackendType::Virsh);
        assert_eq!(cp.bridge_name(&definition()), "tbr10");
    }

    #[tokio::test]
    async fn test_missing_binary_is_control_plane_error() {
        let cp = VirshControlPlane::new("/nonexistent/virsh-binary", None);
        let err = cp.is_live("tn-x-10").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ControlPlaneUnavailable);
    }
}

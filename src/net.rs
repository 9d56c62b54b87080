//! OS network helpers: outbound-interface and neighbor lookups.
//!
//! Ingress farms need each backend's MAC and the interface it is reached
//! through. The shipped prober asks iproute2 (`ip -j`); tests plug in their
//! own implementations to script resolution outcomes.

use std::process::Command;

use crate::address::Family;
use crate::error::{Error, Result};

pub trait NetProber: Send + Sync {
    /// Resolve the local interface serving `remote_ip` to `(ifindex, name)`.
    fn local_ifindex(&self, remote_ip: &str) -> Result<(u32, String)>;

    /// Resolve the MAC of `dst_ip` as seen from `src_ip` over `ifidx`.
    ///
    /// `src_mac` is the probing interface's own MAC; a raw ARP/NDP prober
    /// needs it, the iproute2 implementation only consults the kernel
    /// neighbor cache and ignores it.
    fn neigh_ether(
        &self,
        family: Family,
        src_mac: &str,
        src_ip: &str,
        dst_ip: &str,
        ifidx: u32,
    ) -> Result<String>;

    /// Resolve an interface name to `(ifindex, mac)`.
    fn iface_info(&self, iface: &str) -> Result<(u32, String)>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// iproute2 prober
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct SystemNet;

impl SystemNet {
    fn ip_json(args: &[&str]) -> Result<serde_json::Value> {
        let out = Command::new("ip")
            .arg("-j")
            .args(args)
            .output()
            .map_err(|e| Error::Net(format!("spawning ip: {e}")))?;
        if !out.status.success() {
            return Err(Error::Net(format!(
                "ip {} exited {}",
                args.join(" "),
                out.status
            )));
        }
        Ok(serde_json::from_slice(&out.stdout)?)
    }
}

impl NetProber for SystemNet {
    fn local_ifindex(&self, remote_ip: &str) -> Result<(u32, String)> {
        let routes = Self::ip_json(&["route", "get", remote_ip])?;
        let dev = routes
            .as_array()
            .and_then(|a| a.first())
            .and_then(|r| r.get("dev"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::Net(format!("no route to {remote_ip}")))?
            .to_string();
        let (ifidx, _mac) = self.iface_info(&dev)?;
        Ok((ifidx, dev))
    }

    fn neigh_ether(
        &self,
        family: Family,
        _src_mac: &str,
        _src_ip: &str,
        dst_ip: &str,
        _ifidx: u32,
    ) -> Result<String> {
        let fam_flag = match family {
            Family::Ipv6 => "-6",
            _ => "-4",
        };
        let neighs = Self::ip_json(&[fam_flag, "neigh", "show", "to", dst_ip])?;
        neighs
            .as_array()
            .and_then(|a| a.first())
            .and_then(|n| n.get("lladdr"))
            .and_then(|l| l.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Net(format!("no neighbor entry for {dst_ip}")))
    }

    fn iface_info(&self, iface: &str) -> Result<(u32, String)> {
        let links = Self::ip_json(&["link", "show", "dev", iface])?;
        let link = links
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| Error::Net(format!("no such interface {iface}")))?;
        let ifidx = link
            .get("ifindex")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| Error::Net(format!("no ifindex for {iface}")))? as u32;
        let mac = link
            .get("address")
            .and_then(|a| a.as_str())
            .unwrap_or_default()
            .to_string();
        Ok((ifidx, mac))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unreachable prober
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Prober that resolves nothing. Backends of ingress farms stay in their
/// configuration-error state until a real prober answers.
pub struct UnreachableProber;

impl NetProber for UnreachableProber {
    fn local_ifindex(&self, remote_ip: &str) -> Result<(u32, String)> {
        Err(Error::Net(format!("no route to {remote_ip}")))
    }

    fn neigh_ether(
        &self,
        _family: Family,
        _src_mac: &str,
        _src_ip: &str,
        dst_ip: &str,
        _ifidx: u32,
    ) -> Result<String> {
        Err(Error::Net(format!("no neighbor entry for {dst_ip}")))
    }

    fn iface_info(&self, iface: &str) -> Result<(u32, String)> {
        Err(Error::Net(format!("no such interface {iface}")))
    }
}

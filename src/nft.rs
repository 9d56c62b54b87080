//! Rule emitter interface and the thin nft(8) driver.
//!
//! The control plane never builds packet-filter programs itself; it hands a
//! dirty object snapshot plus its pending action to a `RuleEmitter`. The
//! shipped implementation drives the system `nft` binary at object
//! granularity (table/chain/set lifecycle); anything finer-grained lives on
//! the other side of this boundary.

use std::io::Write as _;
use std::process::{Command, Stdio};

use crate::action::Action;
use crate::address::{Address, Family};
use crate::error::{Error, Result};
use crate::farm::Farm;
use crate::policy::Policy;

pub const NFT_TABLE: &str = "nftbal";

/// One rulerize request: object snapshot plus the action to apply.
#[derive(Debug)]
pub enum RuleRequest<'a> {
    Policy {
        policy: &'a Policy,
        action: Action,
    },
    Farm {
        farm: &'a Farm,
        addresses: Vec<(&'a Address, Action)>,
        policies: Vec<&'a Policy>,
        action: Action,
    },
    Address {
        address: &'a Address,
        policies: Vec<&'a Policy>,
        action: Action,
    },
    /// Whole-table teardown on shutdown.
    FlushAll,
}

pub trait RuleEmitter: Send + Sync {
    /// Apply one object's pending action to the kernel. A non-ok return
    /// leaves the object dirty for retry.
    fn rulerize(&self, req: &RuleRequest<'_>) -> Result<()>;

    /// Fetch the kernel persistence set of a farm/address pair as the
    /// textual `elements = { … }` listing.
    fn sessions_buffer(&self, farm: &Farm, address: &Address) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// nft(8) driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn nft_family(family: Family) -> &'static str {
    match family {
        Family::Ipv4 => "ip",
        Family::Ipv6 => "ip6",
        Family::Dual => "inet",
    }
}

fn set_type(family: Family) -> &'static str {
    match family {
        Family::Ipv6 => "ipv6_addr",
        _ => "ipv4_addr",
    }
}

/// Emitter backed by the system `nft` binary.
pub struct NftEmitter {
    /// Run one command per invocation instead of a single batch.
    serialize: bool,
}

impl NftEmitter {
    pub fn new(serialize: bool) -> NftEmitter {
        NftEmitter { serialize }
    }

    fn run_batch(&self, script: &str) -> Result<()> {
        if script.is_empty() {
            return Ok(());
        }
        if self.serialize {
            for line in script.lines().filter(|l| !l.is_empty()) {
                self.run_nft(line)?;
            }
            Ok(())
        } else {
            self.run_nft(script)
        }
    }

    fn run_nft(&self, script: &str) -> Result<()> {
        tracing::trace!(script, "nft");
        let mut child = Command::new("nft")
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Net(format!("spawning nft: {e}")))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(script.as_bytes())?;
        }

        let out = child.wait_with_output()?;
        if !out.status.success() {
            return Err(Error::Net(format!(
                "nft exited {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    fn policy_script(&self, p: &Policy, action: Action) -> String {
        let fam = nft_family(p.family);
        let mut s = String::new();
        match action {
            Action::Start | Action::Reload | Action::Flush => {
                s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                let timeout = if p.timeout > 0 {
                    format!(" timeout {}s ;", p.timeout)
                } else {
                    String::new()
                };
                s.push_str(&format!(
                    "add set {fam} {NFT_TABLE} {} {{ type {} ; flags interval ;{timeout} }}\n",
                    p.name,
                    set_type(p.family)
                ));
                s.push_str(&format!("flush set {fam} {NFT_TABLE} {}\n", p.name));
                for e in &p.elements {
                    s.push_str(&format!(
                        "add element {fam} {NFT_TABLE} {} {{ {} }}\n",
                        p.name, e.data
                    ));
                }
            }
            Action::Stop | Action::Delete => {
                s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                s.push_str(&format!(
                    "add set {fam} {NFT_TABLE} {} {{ type {} ; }}\n",
                    p.name,
                    set_type(p.family)
                ));
                s.push_str(&format!("delete set {fam} {NFT_TABLE} {}\n", p.name));
            }
            Action::None => {}
        }
        s
    }

    fn farm_script(&self, farm: &Farm, addresses: &[(&Address, Action)], action: Action) -> String {
        let mut s = String::new();
        for (a, _fa_action) in addresses {
            let fam = nft_family(a.family);
            let chain = format!("{}-{}", farm.name, a.name);
            match action {
                Action::Start | Action::Reload | Action::Flush => {
                    s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                    s.push_str(&format!("add chain {fam} {NFT_TABLE} {chain}\n"));
                    s.push_str(&format!("flush chain {fam} {NFT_TABLE} {chain}\n"));
                    if !farm.persistence.is_empty() {
                        s.push_str(&format!(
                            "add map {fam} {NFT_TABLE} persist-{} {{ type {} : mark ; timeout {}s ; }}\n",
                            farm.name,
                            set_type(a.family),
                            farm.persist_ttl
                        ));
                    }
                }
                Action::Stop | Action::Delete => {
                    s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                    s.push_str(&format!("add chain {fam} {NFT_TABLE} {chain}\n"));
                    s.push_str(&format!("delete chain {fam} {NFT_TABLE} {chain}\n"));
                    if !farm.persistence.is_empty() {
                        s.push_str(&format!(
                            "add map {fam} {NFT_TABLE} persist-{} {{ type {} : mark ; }}\n",
                            farm.name,
                            set_type(a.family)
                        ));
                        s.push_str(&format!(
                            "delete map {fam} {NFT_TABLE} persist-{}\n",
                            farm.name
                        ));
                    }
                }
                Action::None => {}
            }
        }
        s
    }

    fn address_script(&self, a: &Address, action: Action) -> String {
        let fam = nft_family(a.family);
        let chain = format!("addr-{}", a.name);
        let mut s = String::new();
        match action {
            Action::Start | Action::Reload | Action::Flush => {
                s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                s.push_str(&format!("add chain {fam} {NFT_TABLE} {chain}\n"));
                s.push_str(&format!("flush chain {fam} {NFT_TABLE} {chain}\n"));
            }
            Action::Stop | Action::Delete => {
                s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                s.push_str(&format!("add chain {fam} {NFT_TABLE} {chain}\n"));
                s.push_str(&format!("delete chain {fam} {NFT_TABLE} {chain}\n"));
            }
            Action::None => {}
        }
        s
    }
}

impl RuleEmitter for NftEmitter {
    fn rulerize(&self, req: &RuleRequest<'_>) -> Result<()> {
        let script = match req {
            RuleRequest::Policy { policy, action } => self.policy_script(policy, *action),
            RuleRequest::Farm {
                farm,
                addresses,
                action,
                ..
            } => self.farm_script(farm, addresses, *action),
            RuleRequest::Address {
                address, action, ..
            } => self.address_script(address, *action),
            RuleRequest::FlushAll => {
                let mut s = String::new();
                for fam in ["ip", "ip6", "inet"] {
                    s.push_str(&format!("add table {fam} {NFT_TABLE}\n"));
                    s.push_str(&format!("delete table {fam} {NFT_TABLE}\n"));
                }
                s
            }
        };
        self.run_batch(&script)
    }

    fn sessions_buffer(&self, farm: &Farm, address: &Address) -> Result<String> {
        let map_name = format!("persist-{}", farm.name);
        let out = Command::new("nft")
            .args(["list", "map", nft_family(address.family), NFT_TABLE, map_name.as_str()])
            .output()
            .map_err(|e| Error::Net(format!("spawning nft: {e}")))?;

        if !out.status.success() {
            return Err(Error::Net(format!(
                "nft list map exited {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// No-op emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emitter that accepts everything and touches nothing. Drives the model
/// without a kernel (tests, dry runs).
#[derive(Default)]
pub struct NullEmitter;

impl RuleEmitter for NullEmitter {
    fn rulerize(&self, req: &RuleRequest<'_>) -> Result<()> {
        tracing::trace!(req = ?req, "rulerize (noop)");
        Ok(())
    }

    fn sessions_buffer(&self, _farm: &Farm, _address: &Address) -> Result<String> {
        Ok(String::new())
    }
}

//! Command line surface and configuration file loading.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{Error, Result};
use crate::registry::Registry;

#[derive(Debug, Parser)]
#[command(
    name = "nftbal",
    version,
    about = "nftables layer-3/4 load balancer control plane"
)]
pub struct Cli {
    /// Launch with the given configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level (error|warn|info|debug|trace).
    #[arg(short = 'l', long = "log", default_value = "info")]
    pub log: String,

    /// Log output format (plain|json).
    #[arg(short = 'L', long = "log-output", default_value = "plain")]
    pub log_output: String,

    /// Authentication key for the admin API; the NFTBAL_SERVER_KEY
    /// environment variable takes precedence.
    #[arg(short = 'k', long = "key")]
    pub key: Option<String>,

    /// Load the configuration, program the kernel and exit.
    #[arg(short = 'e', long = "exit")]
    pub exit: bool,

    /// Run in daemon mode.
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Listen on IPv6.
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Host for the admin API listener.
    #[arg(short = 'H', long = "host")]
    pub host: Option<String>,

    /// Port for the admin API listener.
    #[arg(short = 'P', long = "port", default_value_t = 5555)]
    pub port: u16,

    /// Serialize nft commands instead of batching them.
    #[arg(short = 'S', long = "serial")]
    pub serial: bool,

    /// Masquerade mark in hex.
    #[arg(short = 'm', long = "masquerade-mark", default_value = "0x80000000")]
    pub masquerade_mark: String,
}

impl Cli {
    pub fn masq_mark(&self) -> Result<u32> {
        let raw = self.masquerade_mark.trim_start_matches("0x");
        u32::from_str_radix(raw, 16)
            .map_err(|_| Error::Config(format!("invalid masquerade mark {}", self.masquerade_mark)))
    }

    pub fn bind_host(&self) -> String {
        match &self.host {
            Some(h) => h.clone(),
            None if self.ipv6 => "::".to_string(),
            None => "127.0.0.1".to_string(),
        }
    }
}

/// Load a JSON configuration file into the registry.
pub fn load_file(reg: &mut Registry, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let doc: serde_json::Value = serde_json::from_str(&content)?;
    reg.load_json(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masquerade_mark_accepts_bare_and_prefixed_hex() {
        let cli = Cli::parse_from(["nftbal", "-m", "0x80000000"]);
        assert_eq!(cli.masq_mark().unwrap(), 0x80000000);
        let cli = Cli::parse_from(["nftbal", "-m", "4000"]);
        assert_eq!(cli.masq_mark().unwrap(), 0x4000);
        let cli = Cli::parse_from(["nftbal", "-m", "zz"]);
        assert!(cli.masq_mark().is_err());
    }

    #[test]
    fn ipv6_flag_switches_the_default_host() {
        let cli = Cli::parse_from(["nftbal"]);
        assert_eq!(cli.bind_host(), "127.0.0.1");
        let cli = Cli::parse_from(["nftbal", "-6"]);
        assert_eq!(cli.bind_host(), "::");
        let cli = Cli::parse_from(["nftbal", "-6", "-H", "10.0.0.1"]);
        assert_eq!(cli.bind_host(), "10.0.0.1");
    }
}

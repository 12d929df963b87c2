use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{fqdn, normalize_host_port};

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Values read from resolv.conf, used as fallbacks for unset flags.
#[derive(Debug, Default, Clone)]
pub struct ResolvConf {
    pub nameservers: Vec<SocketAddr>,
    pub search_domains: Vec<String>,
    pub ndots: Option<usize>,
}

pub fn read(path: &Path) -> Result<ResolvConf> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read resolv.conf: {}", path.display()))?;
    Ok(parse(&text))
}

fn parse(text: &str) -> ResolvConf {
    let mut conf = ResolvConf::default();
    for line in text.lines() {
        let line = line.split(['#', ';']).next().unwrap_or_default().trim();
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => {
                if let Some(addr) = fields.next().and_then(|h| normalize_host_port(h).ok()) {
                    conf.nameservers.push(addr);
                }
            }
            Some("search") => {
                conf.search_domains = fields.map(fqdn).collect();
            }
            Some("domain") => {
                if let Some(domain) = fields.next() {
                    conf.search_domains = vec![fqdn(domain)];
                }
            }
            Some("options") => {
                for option in fields {
                    if let Some(value) = option.strip_prefix("ndots:") {
                        conf.ndots = value.parse().ok();
                    }
                }
            }
            _ => {}
        }
    }
    conf
}

fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_os_string();
    backup.push(".dnsrelay");
    PathBuf::from(backup)
}

/// Registers `addr` as the system's only nameserver, keeping a backup of the
/// previous file for `restore`. An existing backup is left alone so repeated
/// calls cannot clobber the true original.
pub fn store_address(path: &Path, addr: IpAddr) -> Result<()> {
    let backup = backup_path(path);
    if !backup.exists() && path.exists() {
        fs::copy(path, &backup)
            .with_context(|| format!("back up {} to {}", path.display(), backup.display()))?;
    }
    let contents = format!("# generated by dnsrelay\nnameserver {addr}\n");
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    info!(path = %path.display(), nameserver = %addr, "registered as default resolver");
    Ok(())
}

/// Puts the original resolv.conf back if a backup exists; a no-op otherwise.
pub fn restore(path: &Path) -> Result<()> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Ok(());
    }
    fs::copy(&backup, path)
        .with_context(|| format!("restore {} from {}", path.display(), backup.display()))?;
    fs::remove_file(&backup)
        .with_context(|| format!("remove backup {}", backup.display()))?;
    info!(path = %path.display(), "restored resolv.conf");
    Ok(())
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use arc_swap::ArcSwap;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

/// Parsed /etc/hosts-format table: forward (name to addresses) and reverse
/// (address to names) maps. Names are stored as lowercased FQDNs.
#[derive(Debug, Default)]
pub struct HostsTable {
    by_name: HashMap<String, Vec<IpAddr>>,
    by_addr: HashMap<IpAddr, Vec<String>>,
}

impl HostsTable {
    pub fn parse(text: &str) -> Self {
        let mut table = HostsTable::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in fields {
                let mut fqdn = name.to_ascii_lowercase();
                if !fqdn.ends_with('.') {
                    fqdn.push('.');
                }
                table.by_name.entry(fqdn.clone()).or_default().push(addr);
                table.by_addr.entry(addr).or_default().push(fqdn);
            }
        }
        table
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read hosts file: {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Addresses for a lowercased FQDN.
    pub fn lookup_ips(&self, fqdn: &str) -> Option<&[IpAddr]> {
        self.by_name.get(fqdn).map(Vec::as_slice)
    }

    /// Names for an address, for PTR answers.
    pub fn lookup_names(&self, addr: IpAddr) -> Option<&[String]> {
        self.by_addr.get(&addr).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Shared handle on the hosts table; reloads swap the whole table at once.
#[derive(Clone)]
pub struct Hosts {
    table: Arc<ArcSwap<HostsTable>>,
}

impl Hosts {
    pub fn empty() -> Self {
        Self {
            table: Arc::new(ArcSwap::from_pointee(HostsTable::default())),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let table = HostsTable::load(path)?;
        info!(path = %path.display(), entries = table.len(), "hosts file loaded");
        Ok(Self {
            table: Arc::new(ArcSwap::from_pointee(table)),
        })
    }

    pub fn current(&self) -> Arc<HostsTable> {
        self.table.load_full()
    }

    /// Watches the hosts file and swaps in a freshly parsed table on change.
    pub fn spawn_watcher(&self, path: PathBuf) {
        let table = Arc::clone(&self.table);
        thread::spawn(move || {
            if let Err(err) = run_watcher(path, table) {
                error!(error = %err, "hosts watcher exited with error");
            }
        });
    }
}

fn run_watcher(path: PathBuf, table: Arc<ArcSwap<HostsTable>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, NotifyConfig::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(path = %path.display(), "hosts watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // retry briefly to ride out truncate+write races
                let mut retries = 3;
                while retries > 0 {
                    match HostsTable::load(&path) {
                        Ok(new_table) => {
                            info!(path = %path.display(), entries = new_table.len(), "hosts file reloaded");
                            table.store(Arc::new(new_table));
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(path = %path.display(), error = %err, "hosts reload failed, keeping old table");
                            } else {
                                std::thread::sleep(std::time::Duration::from_millis(50));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "hosts watcher event error");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SAMPLE: &str = "\
# local entries
127.0.0.1   localhost
10.1.2.3    db.corp.example.com db
2001:db8::7 v6host.example.com
garbage line without an address
";

    #[test]
    fn parse_builds_forward_and_reverse_maps() {
        let table = HostsTable::parse(SAMPLE);

        assert_eq!(
            table.lookup_ips("localhost."),
            Some(&[IpAddr::V4(Ipv4Addr::LOCALHOST)][..])
        );
        assert_eq!(
            table.lookup_ips("db.corp.example.com."),
            Some(&[IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))][..])
        );
        // short alias resolves too
        assert!(table.lookup_ips("db.").is_some());

        let v6: Ipv6Addr = "2001:db8::7".parse().unwrap();
        assert_eq!(
            table.lookup_ips("v6host.example.com."),
            Some(&[IpAddr::V6(v6)][..])
        );

        let names = table
            .lookup_names(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)))
            .unwrap();
        assert_eq!(names, &["db.corp.example.com.", "db."]);
    }

    #[test]
    fn parse_ignores_comments_and_garbage() {
        let table = HostsTable::parse(SAMPLE);
        assert_eq!(table.len(), 4);
        assert!(table.lookup_ips("garbage.").is_none());
    }

    #[test]
    fn lookups_are_case_insensitive_via_lowercased_keys() {
        let table = HostsTable::parse("192.0.2.1 MixedCase.Example.COM");
        assert!(table.lookup_ips("mixedcase.example.com.").is_some());
    }

    #[test]
    fn empty_handle_answers_nothing() {
        let hosts = Hosts::empty();
        assert!(hosts.current().is_empty());
        assert!(hosts.current().lookup_ips("localhost.").is_none());
    }
}

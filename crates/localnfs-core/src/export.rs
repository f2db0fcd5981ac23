//! Export table in the style of exports(5) and the access decisions
//! derived from it.
//!
//! Each non-empty line names a path inside the served tree followed by
//! client entries:
//!
//! ```text
//! # path      clients
//! /           *(rw,no_root_squash)
//! /public     10.0.0.0/8(ro) *.example.org(rw,all_squash,anonuid=1000)
//! ```
//!
//! A client entry is a pattern with an optional parenthesised
//! option list. Patterns are `*`, a single address, a CIDR network (prefix
//! length or dotted netmask) or a hostname glob. Recognised options are
//! `rw`, `ro`, `root_squash`, `no_root_squash`, `all_squash`,
//! `no_all_squash`, `anonuid=N`, `anongid=N`, `sync` and `async`; unknown
//! options are ignored. Defaults are `ro,root_squash,sync` with anonymous
//! ids 65534.

use std::fs;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

/// Anonymous id used by squashing when no `anonuid`/`anongid` is given.
pub const DEFAULT_ANON_ID: u32 = 65534;

/// Export table applied when no exports file is configured.
pub const DEFAULT_EXPORTS: &str = "/ *(rw,no_root_squash)\n";

#[derive(Debug, Error)]
pub enum ExportParseError {
    #[error("failed to read exports file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exports line {line}: {message}")]
    Syntax { line: usize, message: String },
}

impl ExportParseError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Credential squashing applied to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Squash {
    None,
    Root,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPattern {
    Any,
    Address(IpAddr),
    Network { addr: IpAddr, prefix: u8 },
    /// Lowercased hostname glob where `*` matches any run of characters
    /// and `?` a single one.
    Hostname(String),
}

impl ClientPattern {
    pub fn matches(&self, addr: IpAddr, hostname: Option<&str>) -> bool {
        let addr = addr.to_canonical();
        match self {
            Self::Any => true,
            Self::Address(expected) => expected.to_canonical() == addr,
            Self::Network { addr: net, prefix } => in_network(addr, net.to_canonical(), *prefix),
            Self::Hostname(glob) => {
                hostname.is_some_and(|host| glob_match(glob.as_bytes(), host.to_ascii_lowercase().as_bytes()))
            }
        }
    }
}

impl FromStr for ClientPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "*" {
            return Ok(Self::Any);
        }
        if let Some((addr, mask)) = s.split_once('/') {
            let addr: IpAddr = addr
                .parse()
                .map_err(|_| format!("invalid network address {addr:?}"))?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            let prefix = match mask.parse::<u8>() {
                Ok(prefix) if prefix <= max => prefix,
                Ok(_) => return Err(format!("prefix length {mask} out of range")),
                Err(_) => netmask_prefix(mask).ok_or_else(|| format!("invalid netmask {mask:?}"))?,
            };
            return Ok(Self::Network { addr, prefix });
        }
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Self::Address(addr));
        }
        Ok(Self::Hostname(s.to_ascii_lowercase()))
    }
}

fn netmask_prefix(mask: &str) -> Option<u8> {
    let mask: std::net::Ipv4Addr = mask.parse().ok()?;
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    // Contiguous masks only.
    (bits.checked_shl(ones).unwrap_or(0) == 0).then(|| u8::try_from(ones).unwrap_or(32))
}

fn in_network(addr: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (addr, net) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(a) & mask == u32::from(n) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(a) & mask == u128::from(n) & mask
        }
        _ => false,
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Options applying to clients matching one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRule {
    pub pattern: ClientPattern,
    pub access: AccessMode,
    pub squash: Squash,
    pub anon_uid: u32,
    pub anon_gid: u32,
    /// Writes must reach stable storage before they are acknowledged.
    pub sync: bool,
}

impl ClientRule {
    pub fn new(pattern: ClientPattern) -> Self {
        Self {
            pattern,
            access: AccessMode::ReadOnly,
            squash: Squash::Root,
            anon_uid: DEFAULT_ANON_ID,
            anon_gid: DEFAULT_ANON_ID,
            sync: true,
        }
    }

    fn apply_option(&mut self, option: &str, line: usize) -> Result<(), ExportParseError> {
        let parse_id = |value: &str| {
            value
                .parse::<u32>()
                .map_err(|_| ExportParseError::syntax(line, format!("invalid id in {option:?}")))
        };
        match option.split_once('=') {
            Some(("anonuid", value)) => self.anon_uid = parse_id(value)?,
            Some(("anongid", value)) => self.anon_gid = parse_id(value)?,
            _ => match option {
                "rw" => self.access = AccessMode::ReadWrite,
                "ro" => self.access = AccessMode::ReadOnly,
                "root_squash" => self.squash = Squash::Root,
                "no_root_squash" | "no_all_squash" => self.squash = Squash::None,
                "all_squash" => self.squash = Squash::All,
                "sync" => self.sync = true,
                "async" => self.sync = false,
                "" => {}
                other => debug!(line, option = other, "ignoring unsupported export option"),
            },
        }
        Ok(())
    }
}

/// One exported path with its client rules, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub path: PathBuf,
    pub clients: Vec<ClientRule>,
}

/// Outcome of [`ExportList::authorize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub read_only: bool,
    pub squash: Squash,
    pub anon_uid: u32,
    pub anon_gid: u32,
    pub sync: bool,
}

impl Decision {
    pub fn deny() -> Self {
        Self {
            allow: false,
            read_only: true,
            squash: Squash::All,
            anon_uid: DEFAULT_ANON_ID,
            anon_gid: DEFAULT_ANON_ID,
            sync: true,
        }
    }

    pub fn root_squash(&self) -> bool {
        self.squash != Squash::None
    }

    /// Map client credentials to the ones the request runs with.
    pub fn map_credentials(&self, uid: u32, gid: u32) -> (u32, u32) {
        match self.squash {
            Squash::None => (uid, gid),
            Squash::Root => (
                if uid == 0 { self.anon_uid } else { uid },
                if gid == 0 { self.anon_gid } else { gid },
            ),
            Squash::All => (self.anon_uid, self.anon_gid),
        }
    }
}

/// Parsed export table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportList {
    entries: Vec<ExportEntry>,
}

impl Default for ExportList {
    fn default() -> Self {
        // The built-in table is known to parse.
        Self::parse(DEFAULT_EXPORTS).unwrap_or(Self {
            entries: Vec::new(),
        })
    }
}

impl ExportList {
    pub fn load(path: &Path) -> Result<Self, ExportParseError> {
        let text = fs::read_to_string(path).map_err(|source| ExportParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ExportParseError> {
        let mut entries = Vec::new();
        let mut pending = String::new();
        let mut start_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split_once('#').map_or(raw, |(before, _)| before);
            if pending.is_empty() {
                start_line = line_no;
            }
            if let Some(continued) = line.trim_end().strip_suffix('\\') {
                pending.push_str(continued);
                pending.push(' ');
                continue;
            }
            pending.push_str(line);
            let logical = std::mem::take(&mut pending);
            if let Some(entry) = parse_line(&logical, start_line)? {
                entries.push(entry);
            }
        }
        if !pending.is_empty()
            && let Some(entry) = parse_line(&pending, start_line)?
        {
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ExportEntry] {
        &self.entries
    }

    /// The export covering `path`; the longest matching export path wins.
    pub fn export_for(&self, path: &Path) -> Option<&ExportEntry> {
        self.entries
            .iter()
            .filter(|entry| path.starts_with(&entry.path))
            .max_by_key(|entry| entry.path.components().count())
    }

    /// Decide whether a client may access `path` in the requested mode.
    /// Within an export the first matching client rule applies.
    pub fn authorize(
        &self,
        addr: IpAddr,
        hostname: Option<&str>,
        path: &Path,
        requested: AccessMode,
    ) -> Decision {
        let Some(entry) = self.export_for(path) else {
            return Decision::deny();
        };
        let Some(rule) = entry
            .clients
            .iter()
            .find(|rule| rule.pattern.matches(addr, hostname))
        else {
            return Decision::deny();
        };
        let read_only = rule.access == AccessMode::ReadOnly;
        Decision {
            allow: !(read_only && requested == AccessMode::ReadWrite),
            read_only,
            squash: rule.squash,
            anon_uid: rule.anon_uid,
            anon_gid: rule.anon_gid,
            sync: rule.sync,
        }
    }
}

fn parse_line(line: &str, line_no: usize) -> Result<Option<ExportEntry>, ExportParseError> {
    let mut tokens = line.split_whitespace();
    let Some(path) = tokens.next() else {
        return Ok(None);
    };
    let path = PathBuf::from(path);
    if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return Err(ExportParseError::syntax(
            line_no,
            format!("export path {} must be absolute", path.display()),
        ));
    }

    let mut clients = Vec::new();
    for token in tokens {
        let (pattern, options) = match token.split_once('(') {
            Some((pattern, rest)) => {
                let options = rest.strip_suffix(')').ok_or_else(|| {
                    ExportParseError::syntax(line_no, format!("unterminated options in {token:?}"))
                })?;
                (pattern, Some(options))
            }
            None => (token, None),
        };
        let pattern = pattern
            .parse::<ClientPattern>()
            .map_err(|message| ExportParseError::syntax(line_no, message))?;
        let mut rule = ClientRule::new(pattern);
        for option in options.into_iter().flat_map(|o| o.split(',')) {
            rule.apply_option(option.trim(), line_no)?;
        }
        clients.push(rule);
    }
    if clients.is_empty() {
        clients.push(ClientRule::new(ClientPattern::Any));
    }
    Ok(Some(ExportEntry { path, clients }))
}

/// Operations permitted on the served tree, derived from the export table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    pub read_only: bool,
    pub sync_writes: bool,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            read_only: false,
            sync_writes: true,
        }
    }
}

impl AccessPolicy {
    /// Policy for the export covering `path`, taken as the most permissive
    /// of its client rules. Paths not exported at all are read-only.
    pub fn for_export(exports: &ExportList, path: &Path) -> Self {
        match exports.export_for(path) {
            Some(entry) => Self {
                read_only: entry
                    .clients
                    .iter()
                    .all(|rule| rule.access == AccessMode::ReadOnly),
                sync_writes: entry.clients.iter().any(|rule| rule.sync),
            },
            None => Self {
                read_only: true,
                sync_writes: true,
            },
        }
    }

    /// Policy summarising every export: writable when any export admits
    /// writes, synchronous when any rule asks for it.
    pub fn for_tree(exports: &ExportList) -> Self {
        let rules = || exports.entries().iter().flat_map(|entry| entry.clients.iter());
        Self {
            read_only: rules().all(|rule| rule.access == AccessMode::ReadOnly),
            sync_writes: exports.entries().is_empty() || rules().any(|rule| rule.sync),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_exports_allow_everyone_rw() {
        let exports = ExportList::default();
        let decision = exports.authorize(ip("192.0.2.1"), None, Path::new("/"), AccessMode::ReadWrite);
        assert!(decision.allow);
        assert!(!decision.read_only);
        assert!(!decision.root_squash());
    }

    #[test]
    fn test_parse_rules_and_defaults() {
        let exports = ExportList::parse(
            "# comment\n\n/data 10.0.0.0/8(rw,all_squash,anonuid=1000,anongid=100) host.example.org\n",
        )
        .unwrap();
        let entry = &exports.entries()[0];
        assert_eq!(entry.path, PathBuf::from("/data"));
        assert_eq!(entry.clients.len(), 2);

        let first = &entry.clients[0];
        assert_eq!(
            first.pattern,
            ClientPattern::Network {
                addr: ip("10.0.0.0"),
                prefix: 8
            }
        );
        assert_eq!(first.access, AccessMode::ReadWrite);
        assert_eq!(first.squash, Squash::All);
        assert_eq!((first.anon_uid, first.anon_gid), (1000, 100));

        let second = &entry.clients[1];
        assert_eq!(second.access, AccessMode::ReadOnly);
        assert_eq!(second.squash, Squash::Root);
        assert!(second.sync);
    }

    #[test]
    fn test_unknown_options_ignored() {
        let exports = ExportList::parse("/ *(rw,secure,subtree_check,fsid=0)").unwrap();
        assert_eq!(exports.entries()[0].clients[0].access, AccessMode::ReadWrite);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            ExportList::parse("relative *(rw)"),
            Err(ExportParseError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            ExportList::parse("/\n/x *(rw"),
            Err(ExportParseError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            ExportList::parse("/ *(anonuid=nobody)"),
            Err(ExportParseError::Syntax { .. })
        ));
        assert!(matches!(
            ExportList::parse("/ 10.0.0.0/40(rw)"),
            Err(ExportParseError::Syntax { .. })
        ));
    }

    #[test]
    fn test_line_continuation() {
        let exports = ExportList::parse("/data \\\n  *(rw)\n").unwrap();
        assert_eq!(exports.entries().len(), 1);
        assert_eq!(exports.entries()[0].clients[0].access, AccessMode::ReadWrite);
    }

    #[test]
    fn test_longest_export_wins() {
        let exports = ExportList::parse("/ *(ro)\n/data *(rw)\n").unwrap();
        let rw = exports.authorize(ip("192.0.2.1"), None, Path::new("/data/sub"), AccessMode::ReadWrite);
        assert!(rw.allow);
        let ro = exports.authorize(ip("192.0.2.1"), None, Path::new("/database"), AccessMode::ReadWrite);
        assert!(!ro.allow);
        let read = exports.authorize(ip("192.0.2.1"), None, Path::new("/database"), AccessMode::ReadOnly);
        assert!(read.allow);
        assert!(read.read_only);
    }

    #[test]
    fn test_first_matching_client_applies() {
        let exports = ExportList::parse("/ 192.0.2.7(ro) 192.0.2.0/24(rw)").unwrap();
        let specific = exports.authorize(ip("192.0.2.7"), None, Path::new("/"), AccessMode::ReadOnly);
        assert!(specific.read_only);
        let network = exports.authorize(ip("192.0.2.8"), None, Path::new("/"), AccessMode::ReadWrite);
        assert!(network.allow);
        let other = exports.authorize(ip("198.51.100.1"), None, Path::new("/"), AccessMode::ReadOnly);
        assert!(!other.allow);
    }

    #[test]
    fn test_unexported_path_denied() {
        let exports = ExportList::parse("/data *(rw)").unwrap();
        let decision = exports.authorize(ip("192.0.2.1"), None, Path::new("/etc"), AccessMode::ReadOnly);
        assert!(!decision.allow);
    }

    #[test]
    fn test_hostname_glob() {
        let pattern: ClientPattern = "*.Example.org".parse().unwrap();
        assert!(pattern.matches(ip("192.0.2.1"), Some("ws1.example.org")));
        assert!(!pattern.matches(ip("192.0.2.1"), Some("example.org")));
        assert!(!pattern.matches(ip("192.0.2.1"), None));

        let single: ClientPattern = "node?".parse().unwrap();
        assert!(single.matches(ip("192.0.2.1"), Some("node1")));
        assert!(!single.matches(ip("192.0.2.1"), Some("node12")));
    }

    #[test]
    fn test_netmask_and_ipv6_networks() {
        let v4: ClientPattern = "172.16.0.0/255.240.0.0".parse().unwrap();
        assert_eq!(
            v4,
            ClientPattern::Network {
                addr: ip("172.16.0.0"),
                prefix: 12
            }
        );
        assert!(v4.matches(IpAddr::V4(Ipv4Addr::new(172, 31, 255, 1)), None));
        assert!(!v4.matches(IpAddr::V4(Ipv4Addr::new(172, 32, 0, 1)), None));

        let v6: ClientPattern = "2001:db8::/32".parse().unwrap();
        assert!(v6.matches(ip("2001:db8:1::5"), None));
        assert!(!v6.matches(ip("2001:db9::5"), None));

        // IPv4 clients seen through a dual-stack socket.
        let mapped = IpAddr::V6(Ipv4Addr::new(172, 16, 1, 1).to_ipv6_mapped());
        assert!(v4.matches(mapped, None));
        assert!(!v4.matches(IpAddr::V6(Ipv6Addr::LOCALHOST), None));
    }

    #[test]
    fn test_credential_squashing() {
        let exports = ExportList::parse("/ a(rw) *(rw,no_root_squash)").unwrap();
        let squashed = exports.authorize(ip("192.0.2.1"), Some("a"), Path::new("/"), AccessMode::ReadWrite);
        assert_eq!(squashed.map_credentials(0, 0), (DEFAULT_ANON_ID, DEFAULT_ANON_ID));
        assert_eq!(squashed.map_credentials(1000, 1000), (1000, 1000));

        let trusted = exports.authorize(ip("192.0.2.1"), Some("b"), Path::new("/"), AccessMode::ReadWrite);
        assert_eq!(trusted.map_credentials(0, 0), (0, 0));
    }

    #[test]
    fn test_access_policy() {
        let ro = ExportList::parse("/ *(ro)").unwrap();
        assert!(AccessPolicy::for_export(&ro, Path::new("/")).read_only);

        let mixed = ExportList::parse("/ 10.0.0.1(rw,async) *(ro)").unwrap();
        let policy = AccessPolicy::for_export(&mixed, Path::new("/"));
        assert!(!policy.read_only);
        assert!(policy.sync_writes);

        let none = ExportList::parse("/data *(rw)").unwrap();
        assert!(AccessPolicy::for_export(&none, Path::new("/")).read_only);
        assert!(!AccessPolicy::for_export(&none, Path::new("/data/sub")).read_only);
    }

    #[test]
    fn test_access_policy_for_tree() {
        let subtree = ExportList::parse("/ *(ro)\n/data *(rw,async)").unwrap();
        let policy = AccessPolicy::for_tree(&subtree);
        assert!(!policy.read_only);
        assert!(!policy.sync_writes);

        let ro = ExportList::parse("/a *(ro)\n/b *(ro,sync)").unwrap();
        let policy = AccessPolicy::for_tree(&ro);
        assert!(policy.read_only);
        assert!(policy.sync_writes);
    }
}

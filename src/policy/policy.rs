use crate::error::ServerError;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;

/// One entry in an access list: a network and, optionally, a stream
/// limit pattern the protocol layer applies to clients admitted through
/// this entry.
///
#[derive(Debug, Clone)]
pub struct NetEntry {
    pub net: IpNet,
    pub limit: Option<Regex>,
}

impl PartialEq for NetEntry {
    fn eq(&self, other: &Self) -> bool {
        // Regex carries no equality of its own; the pattern text is
        // what the config file said, so that is what we compare.
        self.net == other.net
            && self.limit.as_ref().map(|r| r.as_str()) == other.limit.as_ref().map(|r| r.as_str())
    }
}

/// An ordered list of networks.  Lookup is first match wins, searching
/// in insertion order, and an address only matches entries of its own
/// family.
///
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetList {
    entries: Vec<NetEntry>,
}

impl NetList {
    pub fn new() -> NetList {
        NetList {
            entries: Vec::new(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Parse and append one entry.  `text` is `addr/prefix` or a bare
    /// address (which gets a host prefix).  `pattern`, when given, is
    /// compiled as the entry's stream limit.
    ///
    pub fn push(&mut self, text: &str, pattern: Option<&str>) -> Result<(), ServerError> {
        let net = parse_net(text)?;
        let limit = match pattern {
            Some(p) => Some(
                Regex::new(p).map_err(|e| ServerError::BadPattern(String::from(p), e))?,
            ),
            None => None,
        };
        self.entries.push(NetEntry { net, limit });
        Ok(())
    }
    /// Return the first entry containing `addr`, or None.
    ///
    pub fn lookup(&self, addr: IpAddr) -> Option<&NetEntry> {
        self.entries.iter().find(|e| e.net.contains(&addr))
    }
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.lookup(addr).is_some()
    }
}

/// Parse a CIDR string, accepting a bare address as a /32 (or /128)
/// host network.
///
pub fn parse_net(text: &str) -> Result<IpNet, ServerError> {
    if text.contains('/') {
        text.parse::<IpNet>()
            .map_err(|e| ServerError::BadNetwork(String::from(text), e.to_string()))
    } else {
        let addr = text
            .parse::<IpAddr>()
            .map_err(|e| ServerError::BadNetwork(String::from(text), e.to_string()))?;
        Ok(IpNet::from(addr))
    }
}

/// What the listener learns about an admitted source from the policy
/// lists.  The connection caps are applied separately because they need
/// the live client registry.
///
#[derive(Debug, Clone)]
pub struct Grant {
    pub write_permitted: bool,
    pub trusted: bool,
    pub limit: Option<Regex>,
}

/// Why a source was turned away before any protocol bytes were read.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Refusal {
    /// A match list exists and the source is on none of its entries.
    NotMatched,
    /// The source is on the reject list.
    Rejected,
    /// The per-address connection cap would be exceeded.
    SourceCap,
    /// The global client cap (plus the write list reserve) is exhausted.
    GlobalCap,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Refusal::NotMatched => "not on match list",
            Refusal::Rejected => "on reject list",
            Refusal::SourceCap => "too many connections from address",
            Refusal::GlobalCap => "maximum client count reached",
        };
        write!(f, "{}", text)
    }
}

/// The five access lists, applied in the order the listener needs them.
///
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessPolicy {
    pub match_list: NetList,
    pub reject_list: NetList,
    pub write_list: NetList,
    pub trusted_list: NetList,
    pub limit_list: NetList,
}

impl AccessPolicy {
    pub fn new() -> AccessPolicy {
        AccessPolicy::default()
    }
    /// Screen a source address against the match and reject lists and,
    /// on success, derive its grant.  Match is evaluated strictly
    /// before reject; both strictly before any connection cap.
    ///
    pub fn screen(&self, addr: IpAddr) -> Result<Grant, Refusal> {
        if !self.match_list.is_empty() && !self.match_list.matches(addr) {
            return Err(Refusal::NotMatched);
        }
        if self.reject_list.matches(addr) {
            return Err(Refusal::Rejected);
        }
        Ok(Grant {
            write_permitted: self.write_list.matches(addr),
            trusted: self.trusted_list.matches(addr),
            limit: self
                .limit_list
                .lookup(addr)
                .and_then(|e| e.limit.clone()),
        })
    }
}

#[cfg(test)]
mod netlist_tests {
    use super::*;

    fn v4(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn parse_1() {
        let net = parse_net("10.0.0.0/8").unwrap();
        assert!(net.contains(&v4("10.1.2.3")));
        assert!(!net.contains(&v4("11.0.0.1")));
    }
    #[test]
    fn parse_2() {
        // A bare address becomes a host network.
        let net = parse_net("127.0.0.1").unwrap();
        assert!(net.contains(&v4("127.0.0.1")));
        assert!(!net.contains(&v4("127.0.0.2")));
    }
    #[test]
    fn parse_3() {
        assert!(parse_net("not-an-address").is_err());
        assert!(parse_net("10.0.0.0/33").is_err());
    }
    #[test]
    fn lookup_1() {
        // First match wins in insertion order.
        let mut list = NetList::new();
        list.push("10.0.0.0/8", Some("^AA_.*")).unwrap();
        list.push("10.1.0.0/16", Some("^BB_.*")).unwrap();
        let hit = list.lookup(v4("10.1.2.3")).unwrap();
        assert_eq!("^AA_.*", hit.limit.as_ref().unwrap().as_str());
    }
    #[test]
    fn lookup_2() {
        // Families never cross.
        let mut list = NetList::new();
        list.push("10.0.0.0/8", None).unwrap();
        assert!(list.lookup("::1".parse().unwrap()).is_none());
    }
    #[test]
    fn lookup_3() {
        let mut list = NetList::new();
        list.push("2001:db8::/32", None).unwrap();
        assert!(list.matches("2001:db8::42".parse().unwrap()));
        assert!(!list.matches(v4("10.0.0.1")));
    }
    #[test]
    fn push_1() {
        let mut list = NetList::new();
        assert!(list.push("10.0.0.0/8", Some("[unclosed")).is_err());
        assert!(list.is_empty());
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    fn v4(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn policy(match_nets: &[&str], reject_nets: &[&str]) -> AccessPolicy {
        let mut p = AccessPolicy::new();
        for n in match_nets {
            p.match_list.push(n, None).unwrap();
        }
        for n in reject_nets {
            p.reject_list.push(n, None).unwrap();
        }
        p
    }

    #[test]
    fn screen_1() {
        // No lists at all: everything is admitted, with no privileges.
        let p = AccessPolicy::new();
        let grant = p.screen(v4("192.0.2.1")).unwrap();
        assert!(!grant.write_permitted);
        assert!(!grant.trusted);
        assert!(grant.limit.is_none());
    }
    #[test]
    fn screen_2() {
        // Outside the match list is refused.
        let p = policy(&["10.0.0.0/8"], &[]);
        assert_eq!(Err(Refusal::NotMatched), p.screen(v4("192.0.2.1")).map(|_| ()));
        assert!(p.screen(v4("10.0.0.6")).is_ok());
    }
    #[test]
    fn screen_3() {
        // Reject wins inside match.
        let p = policy(&["10.0.0.0/8"], &["10.0.0.5/32"]);
        assert_eq!(Err(Refusal::Rejected), p.screen(v4("10.0.0.5")).map(|_| ()));
        assert!(p.screen(v4("10.0.0.6")).is_ok());
    }
    #[test]
    fn screen_4() {
        let mut p = AccessPolicy::new();
        p.write_list.push("127.0.0.1/32", None).unwrap();
        p.trusted_list.push("127.0.0.0/8", None).unwrap();
        let grant = p.screen(v4("127.0.0.1")).unwrap();
        assert!(grant.write_permitted);
        assert!(grant.trusted);
        let grant = p.screen(v4("127.0.0.2")).unwrap();
        assert!(!grant.write_permitted);
        assert!(grant.trusted);
    }
    #[test]
    fn screen_5() {
        // The limit list attaches a stream pattern to the grant.
        let mut p = AccessPolicy::new();
        p.limit_list.push("10.0.0.0/8", Some("^NET_.*")).unwrap();
        let grant = p.screen(v4("10.9.9.9")).unwrap();
        assert_eq!("^NET_.*", grant.limit.unwrap().as_str());
        assert!(p.screen(v4("192.0.2.1")).unwrap().limit.is_none());
    }
}

//! Route table and routing decisions.
//!
//! Routes map a device ID to a backend endpoint, per listen port:
//! - `*` is the wildcard, used only when nothing more specific matches
//! - a bare integer is an exact device ID
//! - `A-B` is an inclusive range; `A > B` is legal and matches nothing
//! - lists separate tokens with `,` or `;`, whitespace is ignored
//!
//! Non-wildcard rules are evaluated in declaration order and the first
//! match wins. The table is built once at startup and never mutated, so
//! sessions share it behind an `Arc` without locking.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::endpoint;
use crate::error::RouteError;

/// Listen port used when a mapping does not name one.
pub const DEFAULT_LISTEN_PORT: u16 = 3000;

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

/// A route mapping as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Device ID matcher: `*`, an integer, or a list of integers and ranges.
    #[serde(alias = "From")]
    pub from: String,
    /// Backend endpoint, `host:port` or bare `host`.
    #[serde(alias = "To")]
    pub to: String,
    /// Local port whose listener serves this mapping.
    #[serde(default = "default_listen_port", alias = "Port")]
    pub port: u16,
}

impl RouteSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>, port: u16) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            port,
        }
    }
}

/// Device ID matcher for a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    Exact(u32),
    /// Inclusive on both ends.
    Range { low: u32, high: u32 },
    Wildcard,
}

impl Matcher {
    /// Parse a matcher specifier into one matcher per token.
    pub fn parse_list(source: &str) -> Result<Vec<Matcher>, RouteError> {
        let compact: String = source.chars().filter(|c| !c.is_whitespace()).collect();

        if compact == "*" {
            return Ok(vec![Matcher::Wildcard]);
        }

        let matchers = compact
            .split([',', ';'])
            .filter(|token| !token.is_empty())
            .map(Matcher::parse_token)
            .collect::<Result<Vec<_>, _>>()?;

        if matchers.is_empty() {
            return Err(RouteError::EmptyMatcher);
        }
        Ok(matchers)
    }

    fn parse_token(token: &str) -> Result<Matcher, RouteError> {
        match token.split_once('-') {
            Some((low, high)) => {
                let invalid = || RouteError::InvalidRange(token.to_string());
                let low = low.parse::<u32>().map_err(|_| invalid())?;
                let high = high.parse::<u32>().map_err(|_| invalid())?;
                Ok(Matcher::Range { low, high })
            }
            None => token
                .parse::<u32>()
                .map(Matcher::Exact)
                .map_err(|_| RouteError::InvalidId(token.to_string())),
        }
    }

    /// Whether this matcher accepts the device ID. The wildcard accepts all.
    pub fn matches(&self, device_id: u32) -> bool {
        match *self {
            Matcher::Exact(id) => id == device_id,
            Matcher::Range { low, high } => (low..=high).contains(&device_id),
            Matcher::Wildcard => true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Matcher::Wildcard)
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact(id) => write!(f, "{id}"),
            Matcher::Range { low, high } => write!(f, "{low}-{high}"),
            Matcher::Wildcard => f.write_str("*"),
        }
    }
}

/// A compiled rule bound to a resolved backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub matcher: Matcher,
    pub backend: SocketAddr,
    pub listen_port: u16,
}

impl RouteRule {
    /// Compile a mapping into rules, resolving its endpoint once.
    ///
    /// The matcher is parsed before the resolver is consulted, so a bad
    /// specifier never costs a DNS query.
    pub fn compile(spec: &RouteSpec) -> Result<Vec<RouteRule>, RouteError> {
        let matchers = Matcher::parse_list(&spec.from)?;
        let backend = endpoint::resolve(spec.to.trim())?;

        Ok(matchers
            .into_iter()
            .map(|matcher| RouteRule {
                matcher,
                backend,
                listen_port: spec.port,
            })
            .collect())
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision<'a> {
    /// An exact or range rule matched.
    Matched(&'a RouteRule),
    /// Nothing specific matched; the port's wildcard applies.
    Wildcard(&'a RouteRule),
    /// No rule and no wildcard.
    NoRoute,
}

impl RoutingDecision<'_> {
    pub fn backend(&self) -> Option<SocketAddr> {
        match self {
            RoutingDecision::Matched(rule) | RoutingDecision::Wildcard(rule) => Some(rule.backend),
            RoutingDecision::NoRoute => None,
        }
    }
}

/// Rules sharing one listen port.
#[derive(Debug, Clone, Default)]
struct PortRoutes {
    /// Exact and range rules, in declaration order.
    rules: Vec<RouteRule>,
    wildcard: Option<RouteRule>,
}

/// Route table grouped by listen port.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    by_port: HashMap<u16, PortRoutes>,
}

impl RouteTable {
    /// Create an empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from mappings, failing on the first bad one.
    pub fn build(specs: &[RouteSpec]) -> Result<Self, RouteError> {
        let mut table = Self::new();
        for spec in specs {
            table.add(spec)?;
        }

        info!(
            rule_count = table.len(),
            port_count = table.by_port.len(),
            "Route table built"
        );
        Ok(table)
    }

    /// Compile and append one mapping.
    ///
    /// On error the table is left unchanged. Returns the number of rules
    /// added.
    pub fn add(&mut self, spec: &RouteSpec) -> Result<usize, RouteError> {
        let rules = RouteRule::compile(spec)?;
        let count = rules.len();

        let port_routes = self.by_port.entry(spec.port).or_default();
        if port_routes.wildcard.is_some() && rules.iter().any(|r| r.matcher.is_wildcard()) {
            return Err(RouteError::DuplicateWildcard { port: spec.port });
        }

        for rule in rules {
            debug!(
                listen_port = rule.listen_port,
                matcher = %rule.matcher,
                backend_addr = %rule.backend,
                "Route added"
            );
            if rule.matcher.is_wildcard() {
                port_routes.wildcard = Some(rule);
            } else {
                port_routes.rules.push(rule);
            }
        }

        Ok(count)
    }

    /// Make a routing decision for a device ID arriving on a listen port.
    pub fn route(&self, device_id: u32, listen_port: u16) -> RoutingDecision<'_> {
        let Some(port_routes) = self.by_port.get(&listen_port) else {
            return RoutingDecision::NoRoute;
        };

        if let Some(rule) = port_routes
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(device_id))
        {
            return RoutingDecision::Matched(rule);
        }

        match &port_routes.wildcard {
            Some(rule) => RoutingDecision::Wildcard(rule),
            None => RoutingDecision::NoRoute,
        }
    }

    /// Backend endpoint for a device ID, if any rule applies.
    pub fn lookup(&self, device_id: u32, listen_port: u16) -> Option<SocketAddr> {
        self.route(device_id, listen_port).backend()
    }

    /// Listen ports that have at least one rule, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .by_port
            .iter()
            .filter(|(_, routes)| !routes.rules.is_empty() || routes.wildcard.is_some())
            .map(|(port, _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Rules for a port in evaluation order, wildcard last.
    pub fn rules_for_port(&self, listen_port: u16) -> Vec<RouteRule> {
        self.by_port
            .get(&listen_port)
            .map(|routes| {
                routes
                    .rules
                    .iter()
                    .chain(routes.wildcard.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of compiled rules.
    pub fn len(&self) -> usize {
        self.by_port
            .values()
            .map(|routes| routes.rules.len() + usize::from(routes.wildcard.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const PORT: u16 = DEFAULT_LISTEN_PORT;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("*", vec![Matcher::Wildcard])]
    #[case(" * ", vec![Matcher::Wildcard])]
    #[case("42", vec![Matcher::Exact(42)])]
    #[case("1000-10000", vec![Matcher::Range { low: 1000, high: 10000 }])]
    #[case("1, 2;3-4", vec![Matcher::Exact(1), Matcher::Exact(2), Matcher::Range { low: 3, high: 4 }])]
    #[case("5 - 1", vec![Matcher::Range { low: 5, high: 1 }])]
    #[case("7,,8;", vec![Matcher::Exact(7), Matcher::Exact(8)])]
    #[case("4294967295", vec![Matcher::Exact(u32::MAX)])]
    fn parses_matcher_lists(#[case] source: &str, #[case] expected: Vec<Matcher>) {
        assert_eq!(Matcher::parse_list(source).unwrap(), expected);
    }

    #[rstest]
    #[case("abc")]
    #[case("-5")]
    #[case("4294967296")]
    #[case("1,*")]
    #[case("1.5")]
    fn rejects_bad_ids(#[case] source: &str) {
        let err = Matcher::parse_list(source).unwrap_err();
        assert!(
            matches!(err, RouteError::InvalidId(_) | RouteError::InvalidRange(_)),
            "unexpected error for {source:?}: {err}"
        );
    }

    #[rstest]
    #[case("1-")]
    #[case("-")]
    #[case("1-2-3")]
    #[case("a-10")]
    fn rejects_bad_ranges(#[case] source: &str) {
        assert!(matches!(
            Matcher::parse_list(source),
            Err(RouteError::InvalidRange(_))
        ));
    }

    #[rstest]
    #[case("")]
    #[case(" ; , ")]
    fn rejects_empty_matchers(#[case] source: &str) {
        assert!(matches!(
            Matcher::parse_list(source),
            Err(RouteError::EmptyMatcher)
        ));
    }

    #[test]
    fn matcher_display_round_trips_through_parser() {
        for source in ["*", "17", "3-9"] {
            let matcher = Matcher::parse_list(source).unwrap()[0];
            assert_eq!(matcher.to_string(), source);
        }
    }

    #[test]
    fn range_and_exact_lookup() {
        let table = RouteTable::build(&[
            RouteSpec::new("1000-10000", "127.0.0.1:9001", PORT),
            RouteSpec::new("23425", "127.0.0.1:9002", PORT),
        ])
        .unwrap();

        assert_eq!(table.lookup(5000, PORT), Some(addr("127.0.0.1:9001")));
        assert_eq!(table.lookup(1000, PORT), Some(addr("127.0.0.1:9001")));
        assert_eq!(table.lookup(10000, PORT), Some(addr("127.0.0.1:9001")));
        assert_eq!(table.lookup(23425, PORT), Some(addr("127.0.0.1:9002")));
        assert_eq!(table.lookup(53200, PORT), None);
        assert_eq!(table.route(53200, PORT), RoutingDecision::NoRoute);
    }

    #[test]
    fn earliest_declaration_wins_on_overlap() {
        let table = RouteTable::build(&[
            RouteSpec::new("1-100", "127.0.0.1:1001", PORT),
            RouteSpec::new("50-150", "127.0.0.1:1002", PORT),
            RouteSpec::new("75", "127.0.0.1:1003", PORT),
        ])
        .unwrap();

        assert_eq!(table.lookup(75, PORT), Some(addr("127.0.0.1:1001")));
        assert_eq!(table.lookup(120, PORT), Some(addr("127.0.0.1:1002")));
    }

    #[test]
    fn wildcard_only_applies_when_nothing_matches() {
        let table = RouteTable::build(&[
            RouteSpec::new("*", "127.0.0.1:2000", PORT),
            RouteSpec::new("7", "127.0.0.1:2001", PORT),
        ])
        .unwrap();

        assert!(matches!(table.route(7, PORT), RoutingDecision::Matched(_)));
        assert_eq!(table.lookup(7, PORT), Some(addr("127.0.0.1:2001")));
        assert!(matches!(table.route(8, PORT), RoutingDecision::Wildcard(_)));
        assert_eq!(table.lookup(8, PORT), Some(addr("127.0.0.1:2000")));
    }

    #[test]
    fn inverted_range_matches_nothing() {
        let table = RouteTable::build(&[RouteSpec::new("10-1", "127.0.0.1:3001", PORT)]).unwrap();

        assert_eq!(table.len(), 1);
        for id in [0, 1, 5, 10, 11] {
            assert_eq!(table.lookup(id, PORT), None);
        }
    }

    #[test]
    fn routes_are_isolated_per_port() {
        let table = RouteTable::build(&[
            RouteSpec::new("1", "127.0.0.1:4001", 4000),
            RouteSpec::new("*", "127.0.0.1:5001", 5000),
        ])
        .unwrap();

        assert_eq!(table.lookup(1, 4000), Some(addr("127.0.0.1:4001")));
        assert_eq!(table.lookup(2, 4000), None);
        assert_eq!(table.lookup(1, 5000), Some(addr("127.0.0.1:5001")));
        assert_eq!(table.lookup(1, 6000), None);
        assert_eq!(table.ports(), vec![4000, 5000]);
    }

    #[test]
    fn list_mapping_expands_to_rules_in_order() {
        let table =
            RouteTable::build(&[RouteSpec::new("9; 1-3, 7", "127.0.0.1:6001", PORT)]).unwrap();

        let matchers: Vec<Matcher> = table
            .rules_for_port(PORT)
            .into_iter()
            .map(|rule| rule.matcher)
            .collect();
        assert_eq!(
            matchers,
            vec![
                Matcher::Exact(9),
                Matcher::Range { low: 1, high: 3 },
                Matcher::Exact(7)
            ]
        );
    }

    #[test]
    fn second_wildcard_on_same_port_is_rejected() {
        let mut table = RouteTable::new();
        table.add(&RouteSpec::new("*", "127.0.0.1:7001", PORT)).unwrap();

        let err = table
            .add(&RouteSpec::new("*", "127.0.0.1:7002", PORT))
            .unwrap_err();
        assert!(matches!(err, RouteError::DuplicateWildcard { port: PORT }));
        assert_eq!(table.lookup(1, PORT), Some(addr("127.0.0.1:7001")));

        table.add(&RouteSpec::new("*", "127.0.0.1:7003", 3001)).unwrap();
        assert_eq!(table.lookup(1, 3001), Some(addr("127.0.0.1:7003")));
    }

    #[test]
    fn failed_add_leaves_table_unchanged() {
        let mut table = RouteTable::new();
        assert!(table.add(&RouteSpec::new("1,x", "127.0.0.1:80", PORT)).is_err());
        assert!(table.add(&RouteSpec::new("1", "127.0.0.1:80:1", PORT)).is_err());
        assert!(table.is_empty());
        assert!(table.ports().is_empty());
    }

    #[test]
    fn bad_endpoint_fails_build() {
        let err = RouteTable::build(&[RouteSpec::new("1", "127.0.0.1:port", PORT)]).unwrap_err();
        assert_eq!(err.reason_code(), "invalid_endpoint");
    }

    #[test]
    fn spec_deserializes_with_default_port_and_aliases() {
        let spec: RouteSpec = serde_json::from_str(r#"{"from": "1", "to": "a:1"}"#).unwrap();
        assert_eq!(spec.port, DEFAULT_LISTEN_PORT);

        let spec: RouteSpec =
            serde_json::from_str(r#"{"From": "*", "To": "b", "Port": 15000}"#).unwrap();
        assert_eq!(spec, RouteSpec::new("*", "b", 15000));
    }

    proptest! {
        #[test]
        fn range_lookup_follows_bounds(low in any::<u32>(), high in any::<u32>(), id in any::<u32>()) {
            let table = RouteTable::build(&[
                RouteSpec::new(format!("{low}-{high}"), "127.0.0.1:8001", PORT),
            ]).unwrap();

            let expected = (low <= id && id <= high).then(|| addr("127.0.0.1:8001"));
            prop_assert_eq!(table.lookup(id, PORT), expected);
        }

        #[test]
        fn exact_beats_wildcard(id in any::<u32>(), other in any::<u32>()) {
            let table = RouteTable::build(&[
                RouteSpec::new("*", "127.0.0.1:8100", PORT),
                RouteSpec::new(id.to_string(), "127.0.0.1:8101", PORT),
            ]).unwrap();

            prop_assert_eq!(table.lookup(id, PORT), Some(addr("127.0.0.1:8101")));
            if other != id {
                prop_assert_eq!(table.lookup(other, PORT), Some(addr("127.0.0.1:8100")));
            }
        }

        #[test]
        fn building_twice_gives_identical_lookups(
            ids in proptest::collection::vec(any::<u32>(), 1..8),
            probes in proptest::collection::vec(any::<u32>(), 1..32),
        ) {
            let specs: Vec<RouteSpec> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| RouteSpec::new(
                    format!("{}-{}", id / 2, id),
                    format!("127.0.0.1:{}", 9000 + i),
                    PORT,
                ))
                .collect();

            let first = RouteTable::build(&specs).unwrap();
            let second = RouteTable::build(&specs).unwrap();
            for probe in probes.iter().chain(ids.iter()) {
                prop_assert_eq!(first.lookup(*probe, PORT), second.lookup(*probe, PORT));
            }
        }
    }
}

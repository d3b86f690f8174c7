use std::collections::BTreeMap;

use anyhow::bail;


/// What a link offers. Links report their specification, and profiles select links by matching
///  requirements against it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Specification {
    /// MBit/s
    pub speed: u32,
    /// percent
    pub reliability: u8,
    pub connection_oriented: bool,
    /// typical round trip in milliseconds
    pub ping_millis: u32,
    /// KB of buffer memory available to the link
    pub memory_kb: u64,
    pub protocol: String,
    pub custom: BTreeMap<String, String>,
}

impl Specification {
    /// in-process delivery: as good as it gets
    pub fn loopback() -> Specification {
        Specification {
            speed: u32::MAX,
            reliability: 100,
            connection_oriented: true,
            ping_millis: 0,
            memory_kb: u64::MAX,
            protocol: "loopback".to_string(),
            custom: Default::default(),
        }
    }

    pub fn stream(protocol: &str) -> Specification {
        Specification {
            speed: 100,
            reliability: 100,
            connection_oriented: true,
            ping_millis: 1,
            memory_kb: 1024,
            protocol: protocol.to_string(),
            custom: Default::default(),
        }
    }

    pub fn with_custom(mut self, name: &str, value: &str) -> Specification {
        self.custom.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Requirement {
    MinSpeed(u32),
    MinReliability(u8),
    ConnectionOriented,
    MaxPing(u32),
    MinMemory(u64),
    Protocol(String),
    Custom { name: String, value: String },
}

impl Requirement {
    /// names of the built-in requirements - custom requirements must not use them
    pub const RESERVED_NAMES: [&'static str; 6] = ["speed", "reliability", "connectionOriented", "ping", "memory", "protocol"];

    pub fn matches(&self, spec: &Specification) -> bool {
        match self {
            Requirement::MinSpeed(min) => spec.speed >= *min,
            Requirement::MinReliability(min) => spec.reliability >= *min,
            Requirement::ConnectionOriented => spec.connection_oriented,
            Requirement::MaxPing(max) => spec.ping_millis <= *max,
            Requirement::MinMemory(min) => spec.memory_kb >= *min,
            Requirement::Protocol(protocol) => &spec.protocol == protocol,
            Requirement::Custom { name, value } => spec.custom.get(name) == Some(value),
        }
    }
}

/// A named set of requirements for selecting among the links to a node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkProfile {
    name: String,
    requirements: Vec<Requirement>,
}

impl LinkProfile {
    pub fn new(name: &str, requirements: Vec<Requirement>) -> anyhow::Result<LinkProfile> {
        for req in &requirements {
            if let Requirement::Custom { name: req_name, .. } = req {
                if Requirement::RESERVED_NAMES.contains(&req_name.as_str()) {
                    bail!("profile {:?}: custom requirement must not use the reserved name {:?}", name, req_name);
                }
            }
        }

        Ok(LinkProfile {
            name: name.to_string(),
            requirements,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, spec: &Specification) -> bool {
        self.requirements.iter()
            .all(|r| r.matches(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], true)]
    #[case::speed_ok(vec![Requirement::MinSpeed(100)], true)]
    #[case::speed_too_low(vec![Requirement::MinSpeed(101)], false)]
    #[case::reliability(vec![Requirement::MinReliability(100)], true)]
    #[case::connection_oriented(vec![Requirement::ConnectionOriented], true)]
    #[case::ping_ok(vec![Requirement::MaxPing(1)], true)]
    #[case::ping_too_high(vec![Requirement::MaxPing(0)], false)]
    #[case::memory(vec![Requirement::MinMemory(2048)], false)]
    #[case::protocol(vec![Requirement::Protocol("tcp".to_string())], true)]
    #[case::other_protocol(vec![Requirement::Protocol("udp".to_string())], false)]
    #[case::custom(vec![Requirement::Custom { name: "zone".to_string(), value: "a".to_string() }], true)]
    #[case::custom_mismatch(vec![Requirement::Custom { name: "zone".to_string(), value: "b".to_string() }], false)]
    #[case::all_must_match(vec![Requirement::MinSpeed(1), Requirement::MaxPing(0)], false)]
    fn test_matches(#[case] requirements: Vec<Requirement>, #[case] expected: bool) {
        let spec = Specification::stream("tcp").with_custom("zone", "a");
        let profile = LinkProfile::new("p", requirements).unwrap();
        assert_eq!(profile.matches(&spec), expected);
    }

    #[rstest]
    #[case::ping("ping")]
    #[case::protocol("protocol")]
    fn test_reserved_custom_name(#[case] name: &str) {
        let req = Requirement::Custom { name: name.to_string(), value: "x".to_string() };
        assert!(LinkProfile::new("p", vec![req]).is_err());
    }

    #[test]
    fn test_loopback_matches_everything_built_in() {
        let profile = LinkProfile::new("fast", vec![
            Requirement::MinSpeed(10_000),
            Requirement::MinReliability(100),
            Requirement::ConnectionOriented,
            Requirement::MaxPing(0),
            Requirement::MinMemory(1 << 40),
        ]).unwrap();
        assert!(profile.matches(&Specification::loopback()));
        assert!(!profile.matches(&Specification::stream("tcp")));
    }
}

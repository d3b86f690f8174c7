use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;


/// Globally unique identity of a running node. It is generated randomly when a node context is
///  created and never changes afterwards, so a restarted node has a different id.
///
/// NB: Uniqueness is probabilistic (64 random bits). That is sufficient for telling nodes apart,
///      it is not a security feature.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId {
    pub unique: u64,
}

impl NodeId {
    const PREFIX: &'static str = "Node:";

    pub fn new_random() -> NodeId {
        NodeId {
            unique: rand::random(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.unique);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
        Ok(NodeId {
            unique: buf.try_get_u64()?,
        })
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:016x}]", self.unique)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:016x}", Self::PREFIX, self.unique)
    }
}

impl FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix(Self::PREFIX)
            .ok_or_else(|| anyhow!("node id string form must start with {:?}: {:?}", Self::PREFIX, s))?;
        if hex.is_empty() || hex.len() > 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("node id string form has an invalid unique part: {:?}", s);
        }
        let unique = u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow!("node id string form has an invalid unique part {:?}: {}", s, e))?;
        Ok(NodeId { unique })
    }
}


/// The domain a node belongs to. Nodes outside any domain belong to the 'null domain'.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct DomainId {
    name: Option<String>,
}

impl DomainId {
    const PREFIX: &'static str = "Domain :";
    const NULL_DOMAIN: &'static str = "NullDomain";

    pub fn new(name: &str) -> anyhow::Result<DomainId> {
        if name.is_empty() || name == Self::NULL_DOMAIN {
            bail!("{:?} is not a valid domain name", name);
        }
        Ok(DomainId { name: Some(name.to_string()) })
    }

    pub fn null_domain() -> DomainId {
        DomainId { name: None }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_null_domain(&self) -> bool {
        self.name.is_none()
    }
}

impl Display for DomainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.name.as_deref().unwrap_or(Self::NULL_DOMAIN))
    }
}

impl FromStr for DomainId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix(Self::PREFIX)
            .ok_or_else(|| anyhow!("domain string form must start with {:?}: {:?}", Self::PREFIX, s))?;
        if name == Self::NULL_DOMAIN {
            return Ok(DomainId::null_domain());
        }
        DomainId::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0)]
    #[case::small(0x1234)]
    #[case::max(u64::MAX)]
    fn test_node_id_string_form(#[case] unique: u64) {
        let id = NodeId { unique };
        let s = id.to_string();
        assert!(s.starts_with("Node:"));
        assert_eq!(NodeId::from_str(&s).unwrap(), id);
    }

    #[rstest]
    #[case::no_prefix("1234")]
    #[case::empty_unique("Node:")]
    #[case::not_hex("Node:xyz")]
    #[case::plus_sign("Node:+1")]
    #[case::minus_sign("Node:-1")]
    #[case::whitespace("Node: 1")]
    #[case::too_long("Node:00000000000000000")]
    fn test_node_id_malformed(#[case] s: &str) {
        assert!(NodeId::from_str(s).is_err());
    }

    #[test]
    fn test_node_id_ser() {
        let id = NodeId { unique: 0x0102030405060708 };
        let mut buf = BytesMut::new();
        id.ser(&mut buf);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(NodeId::try_deser(&mut buf).unwrap(), id);
    }

    #[rstest]
    #[case::named("Domain :physics", Some("physics"))]
    #[case::null("Domain :NullDomain", None)]
    fn test_domain_string_form(#[case] s: &str, #[case] expected_name: Option<&str>) {
        let domain = DomainId::from_str(s).unwrap();
        assert_eq!(domain.name(), expected_name);
        assert_eq!(domain.to_string(), s);
    }

    #[rstest]
    #[case::no_space("Domain:physics")]
    #[case::empty("Domain :")]
    #[case::garbage("physics")]
    fn test_domain_malformed(#[case] s: &str) {
        assert!(DomainId::from_str(s).is_err());
    }
}

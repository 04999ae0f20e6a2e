use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Stable key of a resource across desired-state versions.
///
/// Format: `<entity type>[<agent>,<attribute>=<value>]`, for example
/// `std::File[host1,path=/etc/motd]`. The agent segment routes every task for
/// the resource to exactly one agent queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    raw: String,
    type_end: usize,
    agent_end: usize,
}

impl ResourceId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let invalid = |why: &str| CoreError::InvalidResourceId(raw.clone(), why.to_string());

        let open = raw.find('[').ok_or_else(|| invalid("missing '['"))?;
        if !raw.ends_with(']') {
            return Err(invalid("missing trailing ']'"));
        }
        if open == 0 {
            return Err(invalid("empty entity type"));
        }
        let body = &raw[open + 1..raw.len() - 1];
        let comma = body.find(',').ok_or_else(|| invalid("missing attribute segment"))?;
        if comma == 0 {
            return Err(invalid("empty agent name"));
        }
        let attr = &body[comma + 1..];
        match attr.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {}
            _ => return Err(invalid("attribute segment must be key=value")),
        }

        Ok(Self {
            type_end: open,
            agent_end: open + 1 + comma,
            raw,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.raw[..self.type_end]
    }

    /// Name of the agent owning this resource.
    pub fn agent(&self) -> &str {
        &self.raw[self.type_end + 1..self.agent_end]
    }

    /// The `key=value` part identifying the resource within its agent.
    pub fn attribute(&self) -> &str {
        &self.raw[self.agent_end + 1..self.raw.len() - 1]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ResourceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segments() {
        let id = ResourceId::parse("std::File[host1,path=/etc/motd]").unwrap();
        assert_eq!(id.entity_type(), "std::File");
        assert_eq!(id.agent(), "host1");
        assert_eq!(id.attribute(), "path=/etc/motd");
        assert_eq!(id.to_string(), "std::File[host1,path=/etc/motd]");
    }

    #[test]
    fn attribute_value_may_contain_separators() {
        let id = ResourceId::parse("net::Route[router,dest=10.0.0.0/8,via=gw]").unwrap();
        assert_eq!(id.agent(), "router");
        assert_eq!(id.attribute(), "dest=10.0.0.0/8,via=gw");
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in ["", "std::File", "[a,k=v]", "std::File[,k=v]", "std::File[a]", "std::File[a,k]", "std::File[a,k=v"] {
            assert!(ResourceId::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn serde_goes_through_parse() {
        let id: ResourceId = serde_json::from_str("\"test::Resource[agent1,key=key1]\"").unwrap();
        assert_eq!(id.agent(), "agent1");
        assert!(serde_json::from_str::<ResourceId>("\"nonsense\"").is_err());
    }
}

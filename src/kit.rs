use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ComposerError;

/// One entry of a kit: every tool of every server, every tool of one
/// server, or a single tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Selector {
    AllServers,
    Server(String),
    Tool { server: String, tool: String },
}

impl Selector {
    pub fn matches(&self, server: &str, tool: &str) -> bool {
        match self {
            Self::AllServers => true,
            Self::Server(name) => name == server,
            Self::Tool {
                server: name,
                tool: tool_id,
            } => name == server && tool_id == tool,
        }
    }

    /// The server this selector names, if it names one.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::AllServers => None,
            Self::Server(name) | Self::Tool { server: name, .. } => Some(name),
        }
    }
}

impl FromStr for Selector {
    type Err = ComposerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::AllServers);
        }

        // Tool ids may themselves contain '/', server names may not.
        let selector = match s.split_once('/') {
            Some((server, tool)) => Self::Tool {
                server: server.to_string(),
                tool: tool.to_string(),
            },
            None => Self::Server(s.to_string()),
        };

        let valid = match &selector {
            Self::Server(server) => !server.is_empty(),
            Self::Tool { server, tool } => !server.is_empty() && server != "*" && !tool.is_empty(),
            Self::AllServers => true,
        };
        if !valid {
            return Err(ComposerError::InvalidSelector(s.to_string()));
        }
        Ok(selector)
    }
}

impl TryFrom<String> for Selector {
    type Error = ComposerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllServers => f.write_str("*"),
            Self::Server(server) => f.write_str(server),
            Self::Tool { server, tool } => write!(f, "{}/{}", server, tool),
        }
    }
}

/// A named, read-only view over the registry. Holds selectors only; which
/// tools it exposes is decided against registry state on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Kit {
    pub name: String,
    pub selectors: Vec<Selector>,
}

impl Kit {
    pub fn new(name: impl Into<String>, selectors: Vec<Selector>) -> Self {
        Self {
            name: name.into(),
            selectors,
        }
    }

    pub fn parse<S: AsRef<str>>(name: &str, selectors: &[S]) -> Result<Self, ComposerError> {
        let selectors = selectors
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<Selector>, _>>()?;
        Ok(Self::new(name, selectors))
    }

    /// A kit exposing everything the registry exposes.
    pub fn everything(name: impl Into<String>) -> Self {
        Self::new(name, vec![Selector::AllServers])
    }

    pub fn matches(&self, server: &str, tool: &str) -> bool {
        self.selectors.iter().any(|s| s.matches(server, tool))
    }

    pub fn referenced_servers(&self) -> impl Iterator<Item = &str> {
        self.selectors.iter().filter_map(Selector::server)
    }
}

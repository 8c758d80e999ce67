//! MCP tool-execution endpoint registrations

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpConnectionType {
    Http,
    Sse,
    Stdio,
}

impl McpConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
            Self::Stdio => "stdio",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            "stdio" => Ok(Self::Stdio),
            other => Err(Error::Validation(format!(
                "Unknown MCP connection type: {}",
                other
            ))),
        }
    }
}

/// Command line for a locally spawned MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpClientConfig {
    pub name: String,
    pub connection_type: McpConnectionType,

    /// URL for http/sse connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdio_config: Option<StdioConfig>,

    #[serde(default)]
    pub tools_to_execute: Vec<String>,

    #[serde(default)]
    pub tools_to_skip: Vec<String>,
}

impl McpClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("MCP client name must not be empty".to_string()));
        }
        match self.connection_type {
            McpConnectionType::Http | McpConnectionType::Sse => {
                if self.connection_string.as_deref().is_none_or(str::is_empty) {
                    return Err(Error::Validation(format!(
                        "MCP client {} requires a connection string",
                        self.name
                    )));
                }
            }
            McpConnectionType::Stdio => {
                if self.stdio_config.is_none() {
                    return Err(Error::Validation(format!(
                        "MCP client {} requires a stdio config",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Validate a complete MCP client set; names are unique
pub fn validate_mcp_clients(clients: &[McpClientConfig]) -> Result<()> {
    let mut names = HashSet::new();
    for client in clients {
        client.validate()?;
        if !names.insert(client.name.as_str()) {
            return Err(Error::Conflict(format!(
                "MCP client {} is submitted more than once",
                client.name
            )));
        }
    }
    Ok(())
}

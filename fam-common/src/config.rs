//! Configuration loading (spec.md §6). The teacher has no config-file
//! loader of its own to imitate, so this is grounded on the `toml` crate
//! used by the pack's `oxidecomputer-hubris` build tooling (`xtask`,
//! `packager`) for the same kind of small, flat settings table.

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::{FamError, FamResult};

fn default_provider() -> String {
    "sockets".into()
}

fn default_interface_type() -> String {
    "rpc".into()
}

fn default_rpc_framework() -> String {
    "grpc".into()
}

fn default_memsrv_list() -> String {
    "0:127.0.0.1:8787".into()
}

fn default_cis_addr() -> String {
    "127.0.0.1:8791".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FamConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_interface_type")]
    pub memsrv_interface_type: String,
    #[serde(default = "default_interface_type")]
    pub metadata_interface_type: String,
    #[serde(default = "default_rpc_framework")]
    pub rpc_framework_type: String,
    #[serde(default = "default_memsrv_list")]
    pub memsrv_list: String,
    #[serde(default = "default_memsrv_list")]
    pub metadata_list: String,
    /// Where the client library dials the CIS coordinator. Not part of
    /// the upstream option table; grounded on the original's `cis_ip`
    /// config key (`config/fam_config_info.cpp`).
    #[serde(default = "default_cis_addr")]
    pub cis_addr: String,
}

impl Default for FamConfig {
    fn default() -> Self {
        FamConfig {
            provider: default_provider(),
            memsrv_interface_type: default_interface_type(),
            metadata_interface_type: default_interface_type(),
            rpc_framework_type: default_rpc_framework(),
            memsrv_list: default_memsrv_list(),
            metadata_list: default_memsrv_list(),
            cis_addr: default_cis_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

fn parse_server_list(list: &str) -> FamResult<Vec<ServerEntry>> {
    let mut entries = Vec::new();
    let mut seen_ids = HashSet::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = item.splitn(3, ':');
        let id: u64 = parts
            .next()
            .ok_or_else(|| FamError::InvalidOption(format!("missing id in '{item}'")))?
            .parse()
            .map_err(|_| FamError::InvalidOption(format!("bad id in '{item}'")))?;
        let host = parts
            .next()
            .ok_or_else(|| FamError::InvalidOption(format!("missing host in '{item}'")))?
            .to_string();
        let port: u16 = parts
            .next()
            .ok_or_else(|| FamError::InvalidOption(format!("missing port in '{item}'")))?
            .parse()
            .map_err(|_| FamError::InvalidOption(format!("bad port in '{item}'")))?;

        if !seen_ids.insert(id) {
            return Err(FamError::InvalidOption(format!(
                "duplicate server id {id} in list"
            )));
        }
        entries.push(ServerEntry { id, host, port });
    }
    Ok(entries)
}

impl FamConfig {
    pub fn from_toml_str(contents: &str) -> FamResult<FamConfig> {
        toml::from_str(contents)
            .map_err(|e| FamError::InvalidOption(format!("failed to parse config: {e}")))
    }

    pub fn from_file(path: &std::path::Path) -> FamResult<FamConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FamError::InvalidOption(format!("failed to read {path:?}: {e}")))?;
        Self::from_toml_str(&contents)
    }

    pub fn memservers(&self) -> FamResult<Vec<ServerEntry>> {
        let entries = parse_server_list(&self.memsrv_list)?;
        if entries.is_empty() {
            return Err(FamError::MemservListEmpty);
        }
        Ok(entries)
    }

    pub fn metadata_servers(&self) -> FamResult<Vec<ServerEntry>> {
        parse_server_list(&self.metadata_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = FamConfig::default();
        assert_eq!(config.provider, "sockets");
        assert_eq!(config.rpc_framework_type, "grpc");
        let servers = config.memservers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, 0);
        assert_eq!(servers[0].host, "127.0.0.1");
        assert_eq!(servers[0].port, 8787);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let config = FamConfig {
            memsrv_list: "0:a:1,0:b:2".into(),
            ..Default::default()
        };
        assert!(config.memservers().is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config = FamConfig::from_toml_str("provider = \"verbs\"\n").unwrap();
        assert_eq!(config.provider, "verbs");
        assert_eq!(config.rpc_framework_type, "grpc");
    }
}

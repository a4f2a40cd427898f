use super::frame::{MessageType, encode_frame};
use crate::core::{DbError, Result, ResultCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::connection::config::Host;

pub const INFO_NODE: &str = "node";
pub const INFO_PARTITION_GENERATION: &str = "partition-generation";
pub const INFO_SERVICES: &str = "services";
pub const INFO_PARTITIONS: &str = "partitions";
pub const INFO_REPLICAS_MASTER: &str = "replicas-master";
pub const INFO_REPLICAS_PROLE: &str = "replicas-prole";

/// Names requested when pinging a node.
pub const PING_NAMES: [&str; 3] = [INFO_NODE, INFO_PARTITION_GENERATION, INFO_SERVICES];

/// Names requested when the partition generation moved.
pub const REPLICA_NAMES: [&str; 3] = [
    INFO_PARTITION_GENERATION,
    INFO_REPLICAS_MASTER,
    INFO_REPLICAS_PROLE,
];

/// Parsed info response: requested name to raw value.
pub type InfoMap = HashMap<String, String>;

/// Encodes an info request frame for the given names.
pub fn encode_info_request(names: &[&str]) -> Result<Vec<u8>> {
    let mut body = String::new();
    for name in names {
        if name.is_empty() || name.contains('\n') || name.contains('\t') {
            return Err(DbError::InvalidArgument(format!(
                "invalid info name {:?}",
                name
            )));
        }
        body.push_str(name);
        body.push('\n');
    }
    encode_frame(MessageType::Info, body.as_bytes())
}

/// Parses the body of an info response.
///
/// Each line is `name\tvalue`. A value carrying an `ERROR:` or `FAIL:`
/// marker turns the whole response into a server error.
pub fn parse_info_response(body: &[u8]) -> Result<InfoMap> {
    let text = std::str::from_utf8(body)
        .map_err(|e| DbError::Protocol(format!("info response is not utf-8: {}", e)))?;

    let mut map = InfoMap::new();
    for line in text.split('\n').filter(|line| !line.is_empty()) {
        let (name, value) = match line.split_once('\t') {
            Some((name, value)) => (name, value),
            None => (line, ""),
        };
        if let Some(message) = error_marker(value) {
            return Err(DbError::Server {
                code: ResultCode::SERVER_ERROR,
                message: format!("info {} failed: {}", name, message),
            });
        }
        map.insert(name.to_string(), value.to_string());
    }
    Ok(map)
}

fn error_marker(value: &str) -> Option<&str> {
    ["ERROR:", "FAIL:"]
        .iter()
        .find_map(|marker| value.strip_prefix(marker))
}

/// Looks up a required name, failing with a parse error when absent.
pub fn require<'a>(map: &'a InfoMap, name: &str) -> Result<&'a str> {
    map.get(name)
        .map(String::as_str)
        .ok_or_else(|| DbError::ParseError(format!("info response lacks '{}'", name)))
}

/// Parses a `host:port;host:port` peer list. Malformed entries are skipped.
pub fn parse_services(value: &str) -> Vec<Host> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match Host::from_str(entry) {
            Ok(host) => Some(host),
            Err(err) => {
                log::debug!("skipping service entry {:?}: {}", entry, err);
                None
            }
        })
        .collect()
}

/// Identity and topology hints returned by a node ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub partition_generation: u32,
    pub services: Vec<Host>,
}

impl NodeInfo {
    pub fn from_map(map: &InfoMap) -> Result<Self> {
        let name = require(map, INFO_NODE)?.trim();
        if name.is_empty() {
            return Err(DbError::ParseError("node name is empty".to_string()));
        }
        let generation = require(map, INFO_PARTITION_GENERATION)?.trim();
        let partition_generation = generation.parse::<u32>().map_err(|_| {
            DbError::ParseError(format!("invalid partition generation {:?}", generation))
        })?;
        let services = map
            .get(INFO_SERVICES)
            .map(|value| parse_services(value))
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            partition_generation,
            services,
        })
    }
}

/// Parses the `partitions` reply.
pub fn parse_partition_count(map: &InfoMap) -> Result<u32> {
    let raw = require(map, INFO_PARTITIONS)?.trim();
    match raw.parse::<u32>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(DbError::ParseError(format!(
            "invalid partition count {:?}",
            raw
        ))),
    }
}

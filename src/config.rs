// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;

/// Tunables of a [Node](struct.Node.html).
///
/// A port of 0 means "scan upward from the default base port until a free one
/// is found", which is the right choice for everything but fixed deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Preferred control-plane port, 0 to pick a free one.
    pub node_port: u16,
    /// Preferred data-plane port, 0 to pick a free one.
    pub pub_port: u16,
    /// Permit sessions from this very node, loopback-to-self.
    pub allow_local: bool,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            node_port: 0,
            pub_port: 0,
            allow_local: false,
        }
    }
}

impl NodeConfig {
    /// Build a config from a string key/value map, the form configuration
    /// files and command lines hand around.
    ///
    /// Recognized keys: `node.port.node`, `node.port.pub`, `node.allowLocal`.
    /// Unknown keys are ignored, unparsable values fall back to the default.
    pub fn from_options(options: &HashMap<String, String>) -> NodeConfig {
        let mut config = NodeConfig::default();

        if let Some(port) = options.get("node.port.node").and_then(|v| v.parse().ok()) {
            config.node_port = port;
        }
        if let Some(port) = options.get("node.port.pub").and_then(|v| v.parse().ok()) {
            config.pub_port = port;
        }
        if let Some(allow) = options.get("node.allowLocal").and_then(|v| parse_bool(v)) {
            config.allow_local = allow;
        }

        config
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

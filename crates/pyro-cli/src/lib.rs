// Copyright 2025 Pyro Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Pyro CLI
//!
//! Command-line tools for the Pyro remote object engine.
//!
//! ## Key Commands
//!
//! - `pyro echo-server`: serve the test echo object
//! - `pyro ping`: check that a remote object is reachable
//! - `pyro call`: call a remote method (outputs raw JSON for scripting)

pub mod echo;

use anyhow::{anyhow, Result};
use pyro_common::Location;

/// Parses a `host:port` bind address.
///
/// IPv6 hosts may be given in brackets, `[::1]:9090`.
pub fn parse_bind(bind: &str) -> Result<Location> {
    let (host, port) = bind
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid bind address '{}': expected host:port", bind))?;
    let port = port
        .parse()
        .map_err(|e| anyhow!("Invalid port in bind address '{}': {}", bind, e))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("Invalid bind address '{}': missing host", bind));
    }
    Ok(Location::Tcp {
        host: host.to_string(),
        port,
    })
}

/// Parses the `--args` option of `pyro call`: a JSON array of positional
/// arguments.
pub fn parse_call_args(args: &str) -> Result<Vec<serde_json::Value>> {
    match serde_json::from_str(args).map_err(|e| anyhow!("Invalid JSON in args: {}", e))? {
        serde_json::Value::Array(values) => Ok(values),
        other => Err(anyhow!("Args must be a JSON array, got {}", other)),
    }
}

// Copyright Istio Authors
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

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::mesh::{Dataplane, Mesh};

const STATS_PORT: &str = "STATS_PORT";
const LOCAL_CONFIG_PATH: &str = "LOCAL_CONFIG_PATH";
const RECONCILE_INTERVAL: &str = "RECONCILE_INTERVAL";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";

const DEFAULT_STATS_PORT: u16 = 5680;
const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub stats_addr: SocketAddr,

    /// Meshes and dataplanes to reconcile. Without it the process only serves metrics.
    pub local_config: Option<ConfigSource>,
    pub reconcile_interval: Duration,
    pub termination_grace_period: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// Human friendly durations such as `10s` or `1h`.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(HumanDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, env: &str) -> Result<Option<T>, Error> {
    match lookup(env) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    env: &str,
    default: T,
) -> Result<T, Error> {
    parse(lookup, env).map(|v| v.unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(|k| std::env::var(k).ok())
}

pub fn construct_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    let reconcile_interval =
        parse_default(&lookup, RECONCILE_INTERVAL, HumanDuration(DEFAULT_RECONCILE_INTERVAL))?.0;
    if reconcile_interval.is_zero() {
        return Err(Error::EnvVar(
            RECONCILE_INTERVAL.to_string(),
            format!("{reconcile_interval:?}"),
        ));
    }
    Ok(Config {
        stats_addr: SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            parse_default(&lookup, STATS_PORT, DEFAULT_STATS_PORT)?,
        ),
        local_config: parse::<PathBuf>(&lookup, LOCAL_CONFIG_PATH)?.map(ConfigSource::File),
        reconcile_interval,
        termination_grace_period: parse_default(
            &lookup,
            TERMINATION_GRACE_PERIOD,
            HumanDuration(DEFAULT_DRAIN_DURATION),
        )?
        .0,
    })
}

/// LocalConfig is the file based source of meshes and dataplanes.
#[derive(serde::Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub meshes: Vec<Mesh>,
    #[serde(default)]
    pub dataplanes: Vec<Dataplane>,
}

impl LocalConfig {
    pub async fn load(source: &ConfigSource) -> anyhow::Result<Self> {
        let s = source.read_to_string().await?;
        Ok(serde_yaml::from_str(&s)?)
    }

    pub fn mesh(&self, name: &str) -> Option<&Mesh> {
        self.meshes.iter().find(|m| m.name == name)
    }
}

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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::network;

const LISTEN_ADDR: &str = "LISTEN_ADDR";
const DRAIN_QUIET_PERIOD: &str = "DRAIN_QUIET_PERIOD";
const HEALTH_CHECK_USER_AGENTS: &str = "HEALTH_CHECK_USER_AGENTS";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const WORKER_THREADS: &str = "WORKER_THREADS";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_WORKER_THREADS: usize = 2;

/// DrainerConfig configures a [`crate::Drainer`].
#[derive(serde::Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainerConfig {
    /// How long a drain must go without ordinary traffic before it completes.
    /// Falls back to [`network::DEFAULT_DRAIN_TIMEOUT`] when unset or zero.
    pub quiet_period: Option<Duration>,
    /// User-Agent prefixes recognized as health probes, in addition to the kubelet's.
    pub health_check_user_agents: Vec<String>,
}

impl DrainerConfig {
    pub fn with_quiet_period(mut self, d: Duration) -> Self {
        self.quiet_period = Some(d);
        self
    }

    pub fn with_health_check_user_agents<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.health_check_user_agents = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
            .filter(|d| !d.is_zero())
            .unwrap_or(network::DEFAULT_DRAIN_TIMEOUT)
    }
}

/// Config for the `drainer` binary.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub drainer: DrainerConfig,
    /// Upper bound on the whole shutdown: waiting for the quiet period, then closing
    /// connections that are still open.
    pub termination_grace_period: Duration,
    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// DurationStr parses human friendly durations such as `45s` or `1m30s`.
struct DurationStr(Duration);

impl FromStr for DurationStr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(DurationStr)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, Error> {
    match env(name) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(name.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, Error> {
    parse(env, name).map(|v| v.unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(|name| std::env::var(name).ok())
}

/// Builds a [`Config`] from variables resolved by `env`.
pub fn construct_config(env: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    let quiet_period = parse::<DurationStr>(&env, DRAIN_QUIET_PERIOD)?.map(|d| d.0);
    let health_check_user_agents = env(HEALTH_CHECK_USER_AGENTS)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let num_worker_threads = parse_default(&env, WORKER_THREADS, DEFAULT_WORKER_THREADS)?;
    if num_worker_threads == 0 {
        return Err(Error::EnvVar(WORKER_THREADS.to_string(), "0".to_string()));
    }

    Ok(Config {
        listen_addr: parse_default(
            &env,
            LISTEN_ADDR,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
        )?,
        drainer: DrainerConfig {
            quiet_period,
            health_check_user_agents,
        },
        termination_grace_period: parse::<DurationStr>(&env, TERMINATION_GRACE_PERIOD)?
            .map(|d| d.0)
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD),
        num_worker_threads,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        construct_config(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.drainer, DrainerConfig::default());
        assert_eq!(cfg.drainer.quiet_period(), network::DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(60));
        assert_eq!(cfg.num_worker_threads, 2);
    }

    #[test]
    fn overrides() {
        let cfg = config_from(&[
            (LISTEN_ADDR, "127.0.0.1:9000"),
            (DRAIN_QUIET_PERIOD, "10s"),
            (HEALTH_CHECK_USER_AGENTS, "lb-checker/, ,probe-bot"),
            (TERMINATION_GRACE_PERIOD, "2m"),
            (WORKER_THREADS, "4"),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.drainer.quiet_period(), Duration::from_secs(10));
        assert_eq!(
            cfg.drainer.health_check_user_agents,
            vec!["lb-checker/".to_string(), "probe-bot".to_string()]
        );
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(120));
        assert_eq!(cfg.num_worker_threads, 4);
    }

    #[test]
    fn invalid_values() {
        for (name, val) in [
            (LISTEN_ADDR, "not an address"),
            (DRAIN_QUIET_PERIOD, "soon"),
            (WORKER_THREADS, "-1"),
            (WORKER_THREADS, "0"),
        ] {
            let err = config_from(&[(name, val)]).unwrap_err();
            assert_eq!(err.to_string(), format!("invalid env var {name}={val}"));
        }
    }

    #[test]
    fn zero_quiet_period_uses_default() {
        let cfg = config_from(&[(DRAIN_QUIET_PERIOD, "0s")]).unwrap();
        assert_eq!(cfg.drainer.quiet_period, Some(Duration::ZERO));
        assert_eq!(cfg.drainer.quiet_period(), network::DEFAULT_DRAIN_TIMEOUT);

        let cfg = DrainerConfig::default().with_quiet_period(Duration::ZERO);
        assert_eq!(cfg.quiet_period(), network::DEFAULT_DRAIN_TIMEOUT);
    }

    #[test]
    fn builder() {
        let cfg = DrainerConfig::default()
            .with_quiet_period(Duration::from_millis(100))
            .with_health_check_user_agents(["extra"]);
        assert_eq!(cfg.quiet_period(), Duration::from_millis(100));
        assert_eq!(cfg.health_check_user_agents, vec!["extra".to_string()]);
    }
}

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

use std::sync::Arc;

use http::header::USER_AGENT;
use http::{HeaderMap, Request};

use crate::network;

/// RequestKind determines how the drainer routes a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// A probe sent between infrastructure components. Always answered directly.
    NetworkProbe,
    /// A liveness or readiness probe from the orchestrator. Never counts as traffic.
    HealthProbe,
    /// Application traffic.
    Ordinary,
}

/// Classifier sorts requests into [`RequestKind`]s based on their headers alone.
///
/// Health probes are recognized by User-Agent prefix. The kubelet prefix is always
/// recognized; callers may add more.
#[derive(Clone, Debug)]
pub struct Classifier {
    user_agent_prefixes: Arc<[String]>,
}

impl Classifier {
    pub fn new<I, S>(user_agent_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let user_agent_prefixes = user_agent_prefixes
            .into_iter()
            .map(Into::into)
            // An empty prefix would match every request.
            .filter(|p: &String| !p.is_empty())
            .collect();
        Classifier {
            user_agent_prefixes,
        }
    }

    pub fn classify<B>(&self, req: &Request<B>) -> RequestKind {
        self.classify_headers(req.headers())
    }

    pub fn classify_headers(&self, headers: &HeaderMap) -> RequestKind {
        if is_network_probe(headers) {
            RequestKind::NetworkProbe
        } else if self.is_health_probe(headers) {
            RequestKind::HealthProbe
        } else {
            RequestKind::Ordinary
        }
    }

    /// Reports whether the User-Agent marks this as a health probe. This does not check for
    /// network probes, which take precedence in [`Classifier::classify`].
    pub fn is_health_probe(&self, headers: &HeaderMap) -> bool {
        let Some(ua) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        if ua.is_empty() {
            return false;
        }
        ua.starts_with(network::KUBE_PROBE_UA_PREFIX)
            || self
                .user_agent_prefixes
                .iter()
                .any(|prefix| ua.starts_with(prefix.as_str()))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(std::iter::empty::<String>())
    }
}

/// Reports whether the request is a probe from another infrastructure component. The probe
/// header must match exactly.
pub fn is_network_probe(headers: &HeaderMap) -> bool {
    headers
        .get(network::PROBE_HEADER_NAME)
        .is_some_and(|v| v == network::PROBE_HEADER_VALUE)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use test_case::test_case;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test_case(&[], false; "no header")]
    #[test_case(&[("k-network-probe", "probe")], true; "exact value")]
    #[test_case(&[("K-Network-Probe", "probe")], true; "header name is case insensitive")]
    #[test_case(&[("k-network-probe", "no matter")], false; "other value")]
    #[test_case(&[("k-network-probe", "probe2")], false; "value prefix")]
    #[test_case(&[("k-network-probe", "PROBE")], false; "value case")]
    #[test_case(&[("k-network-probe", "")], false; "empty value")]
    fn network_probe(pairs: &[(&str, &str)], want: bool) {
        assert_eq!(is_network_probe(&headers(pairs)), want);
    }

    #[test_case(&[], &[], RequestKind::Ordinary; "no headers")]
    #[test_case(&[("user-agent", "kube-probe/1.30")], &[], RequestKind::HealthProbe; "kubelet")]
    #[test_case(&[("user-agent", "kube-probe/")], &[], RequestKind::HealthProbe; "kubelet bare prefix")]
    #[test_case(&[("user-agent", "Kube-Probe/1.30")], &[], RequestKind::Ordinary; "prefix is case sensitive")]
    #[test_case(&[("user-agent", "curl/8.0 kube-probe/1.30")], &[], RequestKind::Ordinary; "prefix must lead")]
    #[test_case(&[("user-agent", "extra")], &["extra"], RequestKind::HealthProbe; "extra prefix")]
    #[test_case(&[("user-agent", "extra-checker/2")], &["other", "extra"], RequestKind::HealthProbe; "second extra prefix")]
    #[test_case(&[("user-agent", "extra")], &[], RequestKind::Ordinary; "extra prefix not configured")]
    #[test_case(&[("user-agent", "not-a-probe")], &["extra"], RequestKind::Ordinary; "unmatched agent")]
    #[test_case(&[("user-agent", "")], &[], RequestKind::Ordinary; "empty agent")]
    #[test_case(&[("user-agent", "anything")], &[""], RequestKind::Ordinary; "empty prefix ignored")]
    #[test_case(&[("user-agent", "kube-probe/1.30"), ("k-network-probe", "probe")], &[], RequestKind::NetworkProbe; "network probe wins")]
    #[test_case(&[("user-agent", "kube-probe/1.30"), ("k-network-probe", "nope")], &[], RequestKind::HealthProbe; "bad network probe falls through")]
    #[test_case(&[("user-agent", "curl/8.0"), ("user-agent", "kube-probe/1.30")], &[], RequestKind::Ordinary; "first value is used")]
    fn classify(pairs: &[(&str, &str)], prefixes: &[&str], want: RequestKind) {
        let c = Classifier::new(prefixes.iter().copied());
        assert_eq!(c.classify_headers(&headers(pairs)), want);
    }

    #[test]
    fn classify_request_uses_headers_not_path() {
        let c = Classifier::default();
        let req = Request::get("/healthz").body(()).unwrap();
        assert_eq!(c.classify(&req), RequestKind::Ordinary);

        let req = Request::get("/")
            .header(USER_AGENT, "kube-probe/1.30")
            .body(())
            .unwrap();
        assert_eq!(c.classify(&req), RequestKind::HealthProbe);
    }

    #[test]
    fn non_utf8_agent_never_matches() {
        let c = Classifier::new(["kube"]);
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_bytes(b"kube-probe/\xff").unwrap(),
        );
        assert_eq!(c.classify_headers(&h), RequestKind::Ordinary);
    }

    #[test]
    fn empty_prefixes_are_dropped() {
        let c = Classifier::new(["", "a", ""]);
        assert_eq!(
            c.classify_headers(&headers(&[("user-agent", "b")])),
            RequestKind::Ordinary
        );
        assert_eq!(
            c.classify_headers(&headers(&[("user-agent", "a/1")])),
            RequestKind::HealthProbe
        );
    }
}

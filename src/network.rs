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

//! Wire values shared with the rest of the networking stack.
//!
//! These must stay in sync with the components that send probes; they are
//! not configurable per drainer.

use std::time::Duration;

use http::HeaderName;

/// Header carried by probes exchanged between infrastructure components.
pub const PROBE_HEADER_NAME: HeaderName = HeaderName::from_static("k-network-probe");

/// Value `PROBE_HEADER_NAME` must hold, exactly, for a request to be an internal probe.
pub const PROBE_HEADER_VALUE: &str = "probe";

/// Header an internal probe sends and expects echoed back on success.
pub const HASH_HEADER_NAME: HeaderName = HeaderName::from_static("k-network-hash");

/// User-Agent prefix sent by the kubelet when running liveness and readiness probes.
pub const KUBE_PROBE_UA_PREFIX: &str = "kube-probe/";

/// Quiet period used when a drainer is not configured with one.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(45);

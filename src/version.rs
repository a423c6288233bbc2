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

use std::fmt;
use std::fmt::{Display, Formatter};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_RUST_VERSION: &str = env!("CARGO_PKG_RUST_VERSION");
// Set by release tooling; local builds report "unknown".
const BUILD_GIT_REVISION: Option<&str> = option_env!("DRAINER_BUILD_GIT_REVISION");

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct BuildInfo {
    version: String,
    git_revision: String,
    rust_version: String,
}

impl BuildInfo {
    pub fn new() -> Self {
        BuildInfo {
            version: BUILD_VERSION.to_string(),
            git_revision: BUILD_GIT_REVISION.unwrap_or("unknown").to_string(),
            rust_version: BUILD_RUST_VERSION.to_string(),
        }
    }
}

impl Display for BuildInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version.BuildInfo{{Version:\"{}\", GitRevision:\"{}\", MinRustVersion:\"{}\"}}",
            self.version, self.git_revision, self.rust_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::BuildInfo;

    #[test]
    fn display_includes_package_version() {
        let info = BuildInfo::new().to_string();
        assert!(info.contains(env!("CARGO_PKG_VERSION")), "{info}");
    }
}

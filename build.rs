// Copyright 2024 The Devicemock Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;

fn main() {
    let git_hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map_or_else(
            || "UNKNOWN".to_string(),
            |output| String::from_utf8_lossy(&output.stdout).trim().to_string(),
        );

    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "UNKNOWN".to_string());

    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rustc-env=DEVICEMOCK_APP_VERSION={version}");
    println!("cargo:rustc-env=DEVICEMOCK_GIT_COMMIT_HASH={git_hash}");
}

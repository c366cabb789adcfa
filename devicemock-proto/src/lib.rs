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

// The message and service code under `genproto/` is generated. To update it, run:
// `cargo run -p devicemock-proto --features gen -- proto/v1beta1/api.proto -o genproto`

#![allow(clippy::default_trait_access, clippy::doc_markdown)]

pub mod v1beta1 {
    include!("../genproto/v1beta1.pb.rs");

    /// API version sent in every `RegisterRequest`.
    pub const VERSION: &str = "v1beta1";

    /// Directory where kubelet and device plugins keep their sockets.
    pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

    /// File name of the kubelet registration socket inside
    /// [`DEVICE_PLUGIN_PATH`].
    pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

    pub const HEALTHY: &str = "Healthy";
    pub const UNHEALTHY: &str = "Unhealthy";
}

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

pub mod serde_utils;

use std::path::PathBuf;

use devicemock_error::{Error, ResultExt};
use devicemock_proto::v1beta1::{DEVICE_PLUGIN_PATH, KUBELET_SOCKET_NAME};
use serde::{Deserialize, Serialize};

use crate::serde_utils::convert_string_with_shellexpand;

/// File name of the socket the plugin listens on. It does not depend on the
/// resource name, so only one instance can run per device plugin directory.
pub const SOCKET_NAME: &str = "devicemock.sock";

pub const DEFAULT_ROOT_PATH: &str = "/mnt/fake/";
pub const DEFAULT_PREFIX: &str = "fdpm_";
pub const DEFAULT_RESOURCE_NAME: &str = "fake.com/device";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DevicePluginConfig {
    /// Directory whose children are advertised as devices.
    ///
    /// Default: `/mnt/fake/`
    #[serde(
        default = "default_root_path",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub root_path: String,

    /// Only children of `root_path` whose name starts with this prefix are
    /// advertised. The match is case sensitive.
    ///
    /// Default: `fdpm_`
    #[serde(
        default = "default_prefix",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub prefix: String,

    /// Extended resource name registered with the kubelet, eg:
    /// `fake.com/device`. Pods request devices under this name.
    ///
    /// Default: `fake.com/device`
    #[serde(
        default = "default_resource_name",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub resource_name: String,

    /// Directory holding the kubelet socket and the plugin socket. Only
    /// useful to change when running against a fake kubelet.
    ///
    /// Default: `/var/lib/kubelet/device-plugins/`
    #[serde(
        default = "default_device_plugin_path",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub device_plugin_path: String,
}

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_string()
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_resource_name() -> String {
    DEFAULT_RESOURCE_NAME.to_string()
}

fn default_device_plugin_path() -> String {
    DEVICE_PLUGIN_PATH.to_string()
}

impl Default for DevicePluginConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            prefix: default_prefix(),
            resource_name: default_resource_name(),
            device_plugin_path: default_device_plugin_path(),
        }
    }
}

impl DevicePluginConfig {
    /// # Errors
    ///
    /// Will return `Err` if we can't load the file or if it is not a valid
    /// config.
    pub fn try_from_json5_file(config_file: &str) -> Result<Self, Error> {
        let json_contents = std::fs::read_to_string(config_file)
            .err_tip(|| format!("Could not open config file {config_file}"))?;
        serde_json5::from_str(&json_contents)
            .err_tip(|| format!("Could not parse config file {config_file}"))
    }

    /// Path of the socket the plugin serves on.
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.device_plugin_path).join(SOCKET_NAME)
    }

    /// Path of the kubelet registration socket.
    pub fn kubelet_socket_path(&self) -> PathBuf {
        PathBuf::from(&self.device_plugin_path).join(KUBELET_SOCKET_NAME)
    }
}

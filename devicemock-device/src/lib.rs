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

//! Directory backed device inventory.
//!
//! Every child directory of a root path whose name starts with a prefix is
//! one device. Nothing is cached: each call reads the directory again so
//! devices created or removed out of band show up on the next scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use devicemock_error::{Error, ResultExt};
use tracing::{Level, event};

/// One advertisable device. `name` is also the device id on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDirectory {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    root_path: PathBuf,
    prefix: String,
}

impl DirectoryScanner {
    pub fn new(root_path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            prefix: prefix.into(),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn list(&self) -> Result<Vec<DeviceDirectory>, Error> {
        list_directories(&self.root_path, &self.prefix).await
    }

    pub async fn list_as_map(&self) -> Result<HashMap<String, DeviceDirectory>, Error> {
        list_directories_to_map(&self.root_path, &self.prefix).await
    }
}

/// Lists the immediate child directories of `root_path` whose name starts
/// with `prefix`, sorted by name.
///
/// Symlinks are not followed, so a link to a directory is not a device.
/// Names that are not valid UTF-8 are skipped since they can't be sent as
/// device ids.
pub async fn list_directories(
    root_path: &Path,
    prefix: &str,
) -> Result<Vec<DeviceDirectory>, Error> {
    let mut read_dir = tokio::fs::read_dir(root_path)
        .await
        .err_tip(|| format!("Failed to read device root {}", root_path.display()))?;

    let mut devices = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .err_tip(|| format!("Failed to list device root {}", root_path.display()))?
    {
        let file_type = entry
            .file_type()
            .await
            .err_tip(|| format!("Failed to stat {}", entry.path().display()))?;
        if !file_type.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            event!(
                Level::DEBUG,
                path = ?entry.path(),
                "Skipping directory with non UTF-8 name"
            );
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        devices.push(DeviceDirectory {
            path: root_path.join(&name),
            name,
        });
    }
    devices.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Same scan as [`list_directories`], keyed by device name.
pub async fn list_directories_to_map(
    root_path: &Path,
    prefix: &str,
) -> Result<HashMap<String, DeviceDirectory>, Error> {
    Ok(list_directories(root_path, prefix)
        .await?
        .into_iter()
        .map(|device| (device.name.clone(), device))
        .collect())
}

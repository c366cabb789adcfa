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
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use devicemock_error::{Error, ResultExt};
use rand::Rng;

/// Removes the file at `path`. Returns `Ok(false)` if there was nothing to
/// remove.
pub async fn remove_file_if_exists(path: impl AsRef<Path>) -> Result<bool, Error> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).err_tip(|| format!("Failed to remove {}", path.display())),
    }
}

pub async fn create_dir_all(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .err_tip(|| format!("Failed to create directory {}", path.display()))
}

/// Creates a fresh, uniquely named directory under `TEST_TMPDIR` (or the
/// system temp dir) and returns `<dir>/<name>`. Only the parent is created.
///
/// Keep `name` short: the result is often used for unix sockets, whose path
/// is limited to about 100 bytes.
pub async fn make_temp_path(name: &str) -> Result<PathBuf, Error> {
    let base = env::var_os("TEST_TMPDIR").map_or_else(env::temp_dir, PathBuf::from);
    let dir = base.join(rand::rng().random::<u64>().to_string());
    create_dir_all(&dir).await?;
    Ok(dir.join(name))
}

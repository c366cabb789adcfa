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

use core::time::Duration;

use devicemock_error::{Code, Error};
use devicemock_macro::devicemock_test;
use devicemock_util::fs::{make_temp_path, remove_file_if_exists};
use devicemock_util::{background_spawn, init_tracing, spawn};
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

#[devicemock_test]
async fn remove_file_if_exists_reports_whether_it_removed() -> Result<(), Error> {
    let path = make_temp_path("stale.sock").await?;
    tokio::fs::write(&path, b"").await?;

    assert!(remove_file_if_exists(&path).await?);
    assert!(!path.exists());
    // Second removal is not an error.
    assert!(!remove_file_if_exists(&path).await?);
    Ok(())
}

#[devicemock_test]
async fn remove_file_if_exists_propagates_other_errors() -> Result<(), Error> {
    let dir = make_temp_path("not_a_file").await?;
    tokio::fs::create_dir(&dir).await?;

    let err = remove_file_if_exists(&dir).await.unwrap_err();
    assert!(err.message_string().contains("Failed to remove"), "{err}");
    Ok(())
}

#[devicemock_test]
async fn make_temp_path_creates_unique_parents() -> Result<(), Error> {
    let first = make_temp_path("a").await?;
    let second = make_temp_path("a").await?;
    assert!(first.parent().is_some_and(std::path::Path::is_dir));
    assert!(!first.exists());
    assert!(first != second);
    Ok(())
}

#[devicemock_test]
async fn init_tracing_only_succeeds_once() -> Result<(), Error> {
    // The test macro already installed the subscriber.
    let err = init_tracing().unwrap_err();
    assert_eq!(err.code, Code::Internal);
    Ok(())
}

#[devicemock_test]
async fn background_spawn_runs_to_completion() -> Result<(), Error> {
    let handle = background_spawn!("answer", async { 42 });
    assert_eq!(handle.await?, 42);
    Ok(())
}

#[devicemock_test]
async fn dropping_spawn_guard_aborts_task() -> Result<(), Error> {
    let (tx, rx) = oneshot::channel::<()>();
    let guard = spawn!("held_forever", async move {
        // Holds `tx` until aborted.
        let _tx = tx;
        core::future::pending::<()>().await;
    });
    drop(guard);

    // The sender is dropped once the task is aborted.
    let result = tokio::time::timeout(Duration::from_secs(5), rx).await?;
    assert!(result.is_err());
    Ok(())
}

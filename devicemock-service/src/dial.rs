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
use std::path::Path;

use devicemock_error::{Code, Error, ResultExt};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Timeout for the server self check in `start` and for reaching the kubelet.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a gRPC channel over the unix socket at `socket_path`. Fails with
/// `DeadlineExceeded` if the connection is not up within `timeout`.
pub async fn dial(socket_path: &Path, timeout: Duration) -> Result<Channel, Error> {
    let path = socket_path.to_path_buf();
    // The authority is ignored, every connection goes to the unix socket.
    let endpoint = Endpoint::try_from("http://[::]:50051")
        .err_tip(|| "Failed to create unix socket endpoint")?
        .connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }));

    tokio::time::timeout(timeout, connect)
        .await
        .err_tip_with_code(|_| {
            (
                Code::DeadlineExceeded,
                format!("Timed out connecting to {}", socket_path.display()),
            )
        })?
        .err_tip(|| format!("Failed to connect to {}", socket_path.display()))
}

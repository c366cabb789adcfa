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

//! Lifecycle of the device plugin: serving the `DevicePlugin` service on a
//! unix socket and registering it with the kubelet.
//!
//! ```text
//! new() -> start() -> register() -> ... -> stop()
//!          \______ serve() ______/
//! ```
//!
//! A failed `register` stops the endpoint before returning. `stop` can be
//! called any number of times.

use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use devicemock_config::DevicePluginConfig;
use devicemock_device::DirectoryScanner;
use devicemock_error::{Code, Error, ResultExt, make_err};
use devicemock_proto::v1beta1::registration_client::RegistrationClient;
use devicemock_proto::v1beta1::{RegisterRequest, VERSION};
use devicemock_util::fs::remove_file_if_exists;
use devicemock_util::spawn;
use devicemock_util::task::JoinHandleDropGuard;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, event};

use crate::device_plugin_service::{DevicePluginService, HealthReceiver};
use crate::dial::{DIAL_TIMEOUT, dial};

/// How long `stop` waits for the server to drain before aborting it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reports devices as unhealthy to the open inventory stream.
///
/// The conduit buffers a single event. A second report waits until a stream
/// takes the first one, so don't await a report on the task that will call
/// `stop`. Events still buffered when the endpoint starts are discarded.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<String>,
}

impl HealthReporter {
    pub async fn report_unhealthy(&self, device_id: impl Into<String>) -> Result<(), Error> {
        self.tx.send(device_id.into()).await.map_err(|e| {
            make_err!(
                Code::Unavailable,
                "Device plugin endpoint is gone, dropped health event for {}",
                e.0
            )
        })
    }
}

// Only exists between a successful `start` and the end of `stop`. `stop`
// keeps it in place until the socket is gone, so an interrupted `stop`
// leaves the cleanup to the next `stop` or to `Drop`.
#[derive(Debug)]
struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    server_shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandleDropGuard<Result<(), Error>>>,
}

#[derive(Debug)]
pub struct PluginEndpoint {
    socket_path: PathBuf,
    kubelet_socket_path: PathBuf,
    resource_name: String,
    scanner: DirectoryScanner,
    health_tx: mpsc::Sender<String>,
    health_rx: HealthReceiver,
    running: Option<RunningServer>,
}

impl PluginEndpoint {
    pub fn new(config: &DevicePluginConfig) -> Self {
        let (health_tx, health_rx) = mpsc::channel(1);
        Self {
            socket_path: config.socket_path(),
            kubelet_socket_path: config.kubelet_socket_path(),
            resource_name: config.resource_name.clone(),
            scanner: DirectoryScanner::new(&config.root_path, config.prefix.as_str()),
            health_tx,
            health_rx: Arc::new(Mutex::new(health_rx)),
            running: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn health_reporter(&self) -> HealthReporter {
        HealthReporter {
            tx: self.health_tx.clone(),
        }
    }

    /// Binds the plugin socket and serves the `DevicePlugin` service on it,
    /// then connects once to make sure it accepts connections. Any stale
    /// socket file from an earlier run is removed first.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.running.is_some() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Device plugin is already serving on {}",
                self.socket_path.display()
            ));
        }
        self.drain_stale_health_events().await;
        remove_file_if_exists(&self.socket_path)
            .await
            .err_tip(|| "While removing stale device plugin socket")?;
        let listener = UnixListener::bind(&self.socket_path)
            .err_tip(|| format!("Failed to bind {}", self.socket_path.display()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel::<()>();
        let service =
            DevicePluginService::new(self.scanner.clone(), self.health_rx.clone(), shutdown_rx)
                .into_service();
        let server = spawn!(
            "device_plugin_server",
            async move {
                Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(
                        UnixListenerStream::new(listener),
                        async move {
                            // A dropped sender means the endpoint went away.
                            server_shutdown_rx.await.unwrap_or(());
                        },
                    )
                    .await
                    .err_tip(|| "Device plugin server failed")
            },
            socket = ?self.socket_path
        );
        self.running = Some(RunningServer {
            shutdown_tx,
            server_shutdown_tx: Some(server_shutdown_tx),
            server: Some(server),
        });

        // Waits for the server to come up by opening a connection.
        if let Err(err) = dial(&self.socket_path, DIAL_TIMEOUT)
            .await
            .err_tip(|| "While checking that the device plugin server is up")
        {
            return Err::<(), _>(err).merge(self.stop().await);
        }
        Ok(())
    }

    // Reports made while no server ran belong to an earlier session.
    async fn drain_stale_health_events(&self) {
        let mut health_rx = self.health_rx.lock().await;
        while let Ok(device_id) = health_rx.try_recv() {
            event!(
                Level::DEBUG,
                %device_id,
                "Dropping health event reported while stopped",
            );
        }
    }

    /// Registers the plugin's resource with the kubelet. On failure the
    /// endpoint is stopped before the error is returned.
    pub async fn register(&mut self) -> Result<(), Error> {
        if self.running.is_none() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Device plugin must be started before registering"
            ));
        }
        if let Err(err) = self.inner_register().await {
            return Err::<(), _>(err).merge(self.stop().await);
        }
        Ok(())
    }

    async fn inner_register(&self) -> Result<(), Error> {
        let endpoint = self
            .socket_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                make_err!(
                    Code::InvalidArgument,
                    "Bad device plugin socket path {}",
                    self.socket_path.display()
                )
            })?;
        let channel = dial(&self.kubelet_socket_path, DIAL_TIMEOUT)
            .await
            .err_tip(|| "While connecting to the kubelet")?;

        let request = RegisterRequest {
            version: VERSION.to_string(),
            endpoint: endpoint.to_string(),
            resource_name: self.resource_name.clone(),
            options: None,
        };
        event!(Level::DEBUG, ?request, "Registering with kubelet");
        tokio::time::timeout(
            DIAL_TIMEOUT,
            RegistrationClient::new(channel).register(request),
        )
        .await
        .err_tip_with_code(|_| (Code::DeadlineExceeded, "Kubelet did not answer Register"))?
        .err_tip(|| format!("Kubelet rejected resource {}", self.resource_name))?;
        Ok(())
    }

    /// Ends open inventory streams, shuts the server down and removes the
    /// socket file. Does nothing if the endpoint is not serving.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };

        running.shutdown_tx.send_replace(true);
        let server_gone = running
            .server_shutdown_tx
            .take()
            .is_some_and(|server_shutdown_tx| server_shutdown_tx.send(()).is_err());
        if server_gone {
            event!(Level::DEBUG, "Device plugin server already exited");
        }
        // Dropping the guard on timeout aborts the server task.
        let server_result = match running.server.take() {
            Some(server) => match tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    Err(Error::from(join_err).append("Device plugin server task failed"))
                }
                Err(_) => {
                    event!(
                        Level::WARN,
                        "Device plugin server did not shut down in time, aborting it",
                    );
                    Ok(())
                }
            },
            None => Ok(()),
        };

        let cleanup = remove_file_if_exists(&self.socket_path)
            .await
            .map(|_removed| ());
        self.running = None;
        event!(Level::INFO, socket = ?self.socket_path, "Stopped device plugin");
        server_result.merge(cleanup)
    }

    /// `start` followed by `register`. Returns as soon as the kubelet
    /// accepted the registration; the server keeps running until `stop`.
    pub async fn serve(&mut self) -> Result<(), Error> {
        self.start().await.inspect_err(|err| {
            event!(Level::ERROR, ?err, "Could not start device plugin");
        })?;
        event!(Level::INFO, socket = ?self.socket_path, "Started device plugin");

        self.register().await.inspect_err(|err| {
            event!(Level::ERROR, ?err, "Could not register device plugin");
        })?;
        event!(
            Level::INFO,
            resource_name = %self.resource_name,
            "Registered device plugin with kubelet",
        );
        Ok(())
    }
}

impl Drop for PluginEndpoint {
    fn drop(&mut self) {
        // The server task, if still there, is aborted by its drop guard.
        if self.running.is_some() {
            if let Err(err) = std::fs::remove_file(&self.socket_path) {
                event!(Level::WARN, ?err, "Failed to remove device plugin socket on drop");
            }
        }
    }
}

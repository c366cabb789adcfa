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

use core::pin::Pin;
use std::sync::Arc;

use devicemock_device::DirectoryScanner;
use devicemock_error::{Error, ResultExt};
use devicemock_proto::v1beta1::device_plugin_server::{
    DevicePlugin, DevicePluginServer as Server,
};
use devicemock_proto::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    DeviceSpec, Empty, HEALTHY, ListAndWatchResponse, PreStartContainerRequest,
    PreStartContainerResponse, PreferredAllocationRequest, PreferredAllocationResponse,
    UNHEALTHY,
};
use futures::Stream;
use futures::stream::unfold;
use tokio::sync::{Mutex, mpsc, watch};
use tonic::{Request, Response, Status};
use tracing::{Level, event, instrument};

/// Every allocated device shows up at this path inside the container. The
/// devices are fake, so nothing in the container looks at it.
pub const CONTAINER_PATH: &str = "/tmp";

/// Cgroup permissions granted on allocated devices.
pub const DEVICE_PERMISSIONS: &str = "rwm";

pub type ListAndWatchStream =
    Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + 'static>>;

/// Receiving half of the health conduit. Only one inventory stream consumes
/// it at a time.
pub type HealthReceiver = Arc<Mutex<mpsc::Receiver<String>>>;

enum WatchEvent {
    Shutdown,
    Unhealthy(String),
    HealthClosed,
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    // The sender is only dropped without signaling if the endpoint itself
    // was dropped, which ends the stream all the same.
    if shutdown_rx.wait_for(|stopped| *stopped).await.is_err() {
        event!(Level::DEBUG, "Shutdown sender dropped without signaling");
    }
}

struct WatchState {
    devices: Vec<Device>,
    sent_initial: bool,
    health_rx: HealthReceiver,
    shutdown_rx: watch::Receiver<bool>,
}

/// Answers the kubelet's `DevicePlugin` calls from the devices found by a
/// [`DirectoryScanner`].
#[derive(Debug)]
pub struct DevicePluginService {
    scanner: DirectoryScanner,
    health_rx: HealthReceiver,
    shutdown_rx: watch::Receiver<bool>,
}

impl DevicePluginService {
    /// `shutdown_rx` flips to `true` when the owning endpoint stops; open
    /// inventory streams end at that point.
    pub const fn new(
        scanner: DirectoryScanner,
        health_rx: HealthReceiver,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scanner,
            health_rx,
            shutdown_rx,
        }
    }

    pub fn into_service(self) -> Server<Self> {
        Server::new(self)
    }

    // Directories can be created or deleted at any time, so this always
    // rescans.
    async fn load_devices(&self) -> Result<Vec<Device>, Error> {
        Ok(self
            .scanner
            .list()
            .await?
            .into_iter()
            .map(|dir| Device {
                id: dir.name,
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect())
    }

    async fn inner_list_and_watch(&self) -> Result<Response<ListAndWatchStream>, Error> {
        let devices = self
            .load_devices()
            .await
            .err_tip(|| "Failed to get devices in inner_list_and_watch()")?;
        event!(
            Level::INFO,
            root = ?self.scanner.root_path(),
            prefix = self.scanner.prefix(),
            devices = ?devices.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "Exposing devices",
        );

        let state = WatchState {
            devices,
            sent_initial: false,
            health_rx: self.health_rx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        };
        Ok(Response::new(Box::pin(unfold(state, |mut state| async move {
            if !state.sent_initial {
                state.sent_initial = true;
                let response = ListAndWatchResponse {
                    devices: state.devices.clone(),
                };
                return Some((Ok(response), state));
            }

            let WatchState {
                devices,
                health_rx,
                shutdown_rx,
                ..
            } = &mut state;
            let mut watch_event = tokio::select! {
                () = wait_for_shutdown(shutdown_rx) => WatchEvent::Shutdown,
                device_id = async { health_rx.lock().await.recv().await } => {
                    device_id.map_or(WatchEvent::HealthClosed, WatchEvent::Unhealthy)
                }
            };
            if matches!(watch_event, WatchEvent::HealthClosed) {
                // Nobody can report health anymore, only shutdown is left.
                wait_for_shutdown(shutdown_rx).await;
                watch_event = WatchEvent::Shutdown;
            }

            match watch_event {
                WatchEvent::Unhealthy(device_id) => {
                    // There is no way back to healthy within one stream.
                    match devices.iter_mut().find(|device| device.id == device_id) {
                        Some(device) => {
                            event!(Level::WARN, %device_id, "Device became unhealthy");
                            device.health = UNHEALTHY.to_string();
                        }
                        None => {
                            event!(
                                Level::WARN,
                                %device_id,
                                "Health event for a device that is not exposed",
                            );
                        }
                    }
                    let response = ListAndWatchResponse {
                        devices: devices.clone(),
                    };
                    Some((Ok(response), state))
                }
                WatchEvent::Shutdown | WatchEvent::HealthClosed => {
                    event!(Level::INFO, "Shutdown signaled, closing ListAndWatch stream");
                    None
                }
            }
        }))))
    }

    async fn inner_allocate(
        &self,
        request: AllocateRequest,
    ) -> Result<Response<AllocateResponse>, Error> {
        let devices = self
            .scanner
            .list_as_map()
            .await
            .err_tip(|| "Failed to get devices in inner_allocate()")?;

        let container_responses = request
            .container_requests
            .into_iter()
            .map(|container_request| ContainerAllocateResponse {
                devices: container_request
                    .devices_ids
                    .iter()
                    .map(|device_id| {
                        let host_path = devices.get(device_id).map_or_else(
                            || {
                                event!(
                                    Level::WARN,
                                    %device_id,
                                    "Allocate requested a device that does not exist",
                                );
                                String::new()
                            },
                            |dir| dir.path.to_string_lossy().into_owned(),
                        );
                        DeviceSpec {
                            container_path: CONTAINER_PATH.to_string(),
                            host_path,
                            permissions: DEVICE_PERMISSIONS.to_string(),
                        }
                    })
                    .collect(),
                ..ContainerAllocateResponse::default()
            })
            .collect();

        let response = AllocateResponse {
            container_responses,
        };
        event!(Level::INFO, ?response, "Allocate response");
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    type ListAndWatchStream = ListAndWatchStream;

    #[instrument(
        ret(level = Level::DEBUG),
        level = Level::DEBUG,
        skip_all,
    )]
    async fn get_device_plugin_options(
        &self,
        _grpc_request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(err, level = Level::ERROR, skip_all)]
    async fn list_and_watch(
        &self,
        _grpc_request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let resp = self.inner_list_and_watch().await.map_err(Into::into);
        if resp.is_ok() {
            event!(Level::DEBUG, return = "Ok(<stream>)");
        }
        resp
    }

    #[instrument(
        ret(level = Level::DEBUG),
        level = Level::DEBUG,
        skip_all,
        fields(request = ?grpc_request.get_ref())
    )]
    async fn get_preferred_allocation(
        &self,
        grpc_request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        err,
        level = Level::INFO,
        skip_all,
        fields(request = ?grpc_request.get_ref())
    )]
    async fn allocate(
        &self,
        grpc_request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        self.inner_allocate(grpc_request.into_inner())
            .await
            .map_err(Into::into)
    }

    #[instrument(
        ret(level = Level::DEBUG),
        level = Level::DEBUG,
        skip_all,
        fields(request = ?grpc_request.get_ref())
    )]
    async fn pre_start_container(
        &self,
        grpc_request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

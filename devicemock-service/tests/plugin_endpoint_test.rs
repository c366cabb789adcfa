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

use std::path::Path;
use std::sync::Arc;

use devicemock_config::{DevicePluginConfig, SOCKET_NAME};
use devicemock_error::{Code, Error};
use devicemock_macro::devicemock_test;
use devicemock_proto::v1beta1::device_plugin_client::DevicePluginClient;
use devicemock_proto::v1beta1::registration_server::{Registration, RegistrationServer};
use devicemock_proto::v1beta1::{
    AllocateRequest, ContainerAllocateRequest, DeviceSpec, Empty, HEALTHY,
    ListAndWatchResponse, PreStartContainerRequest, PreferredAllocationRequest, RegisterRequest,
    UNHEALTHY,
};
use devicemock_service::PluginEndpoint;
use devicemock_service::dial::{DIAL_TIMEOUT, dial};
use devicemock_util::background_spawn;
use devicemock_util::fs::make_temp_path;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

const PREFIX: &str = "fdpm_";
const RESOURCE_NAME: &str = "fake.com/device";

/// Records every `Register` call it gets. Rejects them all if `reject` is set.
#[derive(Debug, Default, Clone)]
struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    reject: bool,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().await.push(request.into_inner());
        if self.reject {
            return Err(Status::invalid_argument("resource name is not allowed"));
        }
        Ok(Response::new(Empty {}))
    }
}

fn spawn_fake_kubelet(socket_path: &Path) -> Result<FakeKubelet, Error> {
    serve_fake_kubelet(socket_path, FakeKubelet::default())
}

fn serve_fake_kubelet(socket_path: &Path, kubelet: FakeKubelet) -> Result<FakeKubelet, Error> {
    let listener = UnixListener::bind(socket_path)?;
    let service = RegistrationServer::new(kubelet.clone());
    background_spawn!("fake_kubelet", async move {
        Server::builder()
            .add_service(service)
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
    });
    Ok(kubelet)
}

// A device root holding `fdpm_a`, `fdpm_b` and an unrelated directory, and an
// empty device plugin directory.
async fn make_config() -> Result<DevicePluginConfig, Error> {
    let root = make_temp_path("devices").await?;
    tokio::fs::create_dir(&root).await?;
    tokio::fs::create_dir(root.join("fdpm_a")).await?;
    tokio::fs::create_dir(root.join("fdpm_b")).await?;
    tokio::fs::create_dir(root.join("other")).await?;

    let plugin_dir = make_temp_path("plugins").await?;
    tokio::fs::create_dir(&plugin_dir).await?;

    Ok(DevicePluginConfig {
        root_path: root.to_string_lossy().into_owned(),
        prefix: PREFIX.to_string(),
        resource_name: RESOURCE_NAME.to_string(),
        device_plugin_path: plugin_dir.to_string_lossy().into_owned(),
    })
}

async fn connect(endpoint: &PluginEndpoint) -> Result<DevicePluginClient<Channel>, Error> {
    Ok(DevicePluginClient::new(
        dial(endpoint.socket_path(), DIAL_TIMEOUT).await?,
    ))
}

fn health_of(response: &ListAndWatchResponse) -> Vec<(&str, &str)> {
    response
        .devices
        .iter()
        .map(|device| (device.id.as_str(), device.health.as_str()))
        .collect()
}

#[devicemock_test]
async fn start_then_stop_removes_socket() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    assert_eq!(endpoint.socket_path(), config.socket_path());
    assert!(config.socket_path().ends_with(SOCKET_NAME));

    endpoint.start().await?;
    assert!(endpoint.is_running());
    assert!(endpoint.socket_path().exists());

    endpoint.stop().await?;
    assert!(!endpoint.is_running());
    assert!(!endpoint.socket_path().exists());

    // A second stop is a no-op.
    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn stop_before_start_is_noop() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.stop().await?;
    assert!(!endpoint.is_running());
    Ok(())
}

#[devicemock_test]
async fn start_fails_when_plugin_dir_is_missing() -> Result<(), Error> {
    let config = DevicePluginConfig {
        device_plugin_path: make_temp_path("no_such_dir")
            .await?
            .to_string_lossy()
            .into_owned(),
        ..make_config().await?
    };
    let mut endpoint = PluginEndpoint::new(&config);

    let err = endpoint.start().await.unwrap_err();
    assert_eq!(err.code, Code::NotFound, "{err}");
    assert!(!endpoint.is_running());
    assert!(!endpoint.socket_path().exists());

    endpoint.stop().await?;
    assert!(!endpoint.is_running());
    Ok(())
}

#[devicemock_test]
async fn interrupted_stop_is_finished_by_next_stop() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    // The server task cannot run during a single poll, so this gives up
    // while waiting for it.
    assert!(endpoint.stop().now_or_never().is_none());
    assert!(endpoint.is_running());
    assert!(endpoint.socket_path().exists());

    endpoint.stop().await?;
    assert!(!endpoint.is_running());
    assert!(!endpoint.socket_path().exists());
    Ok(())
}

#[devicemock_test]
async fn drop_after_interrupted_stop_removes_socket() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    assert!(endpoint.stop().now_or_never().is_none());
    drop(endpoint);
    assert!(!config.socket_path().exists());
    Ok(())
}

#[devicemock_test]
async fn start_replaces_stale_socket_file() -> Result<(), Error> {
    let config = make_config().await?;
    tokio::fs::write(config.socket_path(), b"left over").await?;

    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;
    let mut client = connect(&endpoint).await?;
    client.get_device_plugin_options(Empty {}).await?;
    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn start_twice_fails_without_stopping() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let err = endpoint.start().await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert!(endpoint.is_running());
    assert!(endpoint.socket_path().exists());

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn endpoint_can_restart_after_stop() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;
    endpoint.stop().await?;

    endpoint.start().await?;
    let mut client = connect(&endpoint).await?;
    let mut stream = client.list_and_watch(Empty {}).await?.into_inner();
    let first = stream.message().await?.expect("initial device list");
    assert_eq!(first.devices.len(), 2);
    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn register_without_kubelet_stops_endpoint() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let err = endpoint.register().await.unwrap_err();
    assert!(
        err.message_string().contains("While connecting to the kubelet"),
        "{err}"
    );
    assert!(!endpoint.is_running());
    assert!(!endpoint.socket_path().exists());

    // Stopping after the automatic stop is still fine.
    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn register_rejected_by_kubelet_stops_endpoint() -> Result<(), Error> {
    let config = make_config().await?;
    let kubelet = serve_fake_kubelet(
        &config.kubelet_socket_path(),
        FakeKubelet {
            reject: true,
            ..FakeKubelet::default()
        },
    )?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let err = endpoint.register().await.unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument, "{err}");
    assert!(
        err.message_string()
            .contains("Kubelet rejected resource fake.com/device"),
        "{err}"
    );
    assert_eq!(kubelet.requests.lock().await.len(), 1);
    assert!(!endpoint.is_running());
    assert!(!endpoint.socket_path().exists());
    Ok(())
}

#[devicemock_test]
async fn register_before_start_fails() -> Result<(), Error> {
    let config = make_config().await?;
    let kubelet = spawn_fake_kubelet(&config.kubelet_socket_path())?;
    let mut endpoint = PluginEndpoint::new(&config);

    let err = endpoint.register().await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert!(kubelet.requests.lock().await.is_empty());
    Ok(())
}

#[devicemock_test]
async fn serve_registers_with_kubelet() -> Result<(), Error> {
    let config = make_config().await?;
    let kubelet = spawn_fake_kubelet(&config.kubelet_socket_path())?;

    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.serve().await?;
    assert!(endpoint.is_running());

    assert_eq!(
        *kubelet.requests.lock().await,
        vec![RegisterRequest {
            version: "v1beta1".to_string(),
            endpoint: SOCKET_NAME.to_string(),
            resource_name: RESOURCE_NAME.to_string(),
            options: None,
        }]
    );

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn serve_without_kubelet_leaves_endpoint_stopped() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);

    assert!(endpoint.serve().await.is_err());
    assert!(!endpoint.is_running());
    assert!(!endpoint.socket_path().exists());
    Ok(())
}

#[devicemock_test]
async fn list_and_watch_reports_health_changes() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    let reporter = endpoint.health_reporter();
    endpoint.start().await?;

    let mut client = connect(&endpoint).await?;
    let mut stream = client.list_and_watch(Empty {}).await?.into_inner();

    let initial = stream.message().await?.expect("initial device list");
    assert_eq!(
        health_of(&initial),
        vec![("fdpm_a", HEALTHY), ("fdpm_b", HEALTHY)]
    );

    reporter.report_unhealthy("fdpm_a").await?;
    let update = stream.message().await?.expect("health update");
    assert_eq!(
        health_of(&update),
        vec![("fdpm_a", UNHEALTHY), ("fdpm_b", HEALTHY)]
    );

    // Unknown ids leave the list alone but it is still sent again. Unhealthy
    // devices stay unhealthy.
    reporter.report_unhealthy("fdpm_zzz").await?;
    let update = stream.message().await?.expect("second health update");
    assert_eq!(
        health_of(&update),
        vec![("fdpm_a", UNHEALTHY), ("fdpm_b", HEALTHY)]
    );

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn health_event_before_stream_is_delivered_after_initial_list() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    // Fits in the conduit without an open stream.
    endpoint.health_reporter().report_unhealthy("fdpm_b").await?;

    let mut client = connect(&endpoint).await?;
    let mut stream = client.list_and_watch(Empty {}).await?.into_inner();
    let initial = stream.message().await?.expect("initial device list");
    assert_eq!(
        health_of(&initial),
        vec![("fdpm_a", HEALTHY), ("fdpm_b", HEALTHY)]
    );
    let update = stream.message().await?.expect("health update");
    assert_eq!(
        health_of(&update),
        vec![("fdpm_a", HEALTHY), ("fdpm_b", UNHEALTHY)]
    );

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn health_event_reported_while_stopped_is_discarded() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    let reporter = endpoint.health_reporter();
    endpoint.start().await?;
    endpoint.stop().await?;

    // Buffered while nothing serves, then dropped by the next start.
    reporter.report_unhealthy("fdpm_a").await?;
    endpoint.start().await?;

    let mut client = connect(&endpoint).await?;
    let mut stream = client.list_and_watch(Empty {}).await?.into_inner();
    let initial = stream.message().await?.expect("initial device list");
    assert_eq!(
        health_of(&initial),
        vec![("fdpm_a", HEALTHY), ("fdpm_b", HEALTHY)]
    );

    reporter.report_unhealthy("fdpm_b").await?;
    let update = stream.message().await?.expect("health update");
    assert_eq!(
        health_of(&update),
        vec![("fdpm_a", HEALTHY), ("fdpm_b", UNHEALTHY)]
    );

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn stop_ends_list_and_watch_stream_cleanly() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let mut client = connect(&endpoint).await?;
    let mut stream = client.list_and_watch(Empty {}).await?.into_inner();
    stream.message().await?.expect("initial device list");

    let reader = background_spawn!("list_and_watch_reader", async move {
        stream.message().await
    });
    endpoint.stop().await?;

    let next = reader.await??;
    assert_eq!(next, None);
    Ok(())
}

#[devicemock_test]
async fn list_and_watch_fails_when_root_is_missing() -> Result<(), Error> {
    let config = DevicePluginConfig {
        root_path: make_temp_path("missing").await?.to_string_lossy().into_owned(),
        ..make_config().await?
    };
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let mut client = connect(&endpoint).await?;
    let status = client.list_and_watch(Empty {}).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn allocate_maps_known_and_unknown_ids() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let mut client = connect(&endpoint).await?;
    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["fdpm_a".to_string(), "missing".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["fdpm_b".to_string()],
                },
            ],
        })
        .await?
        .into_inner();

    let root = Path::new(&config.root_path);
    let spec = |host_path: String| DeviceSpec {
        container_path: "/tmp".to_string(),
        host_path,
        permissions: "rwm".to_string(),
    };
    assert_eq!(response.container_responses.len(), 2);
    assert_eq!(
        response.container_responses[0].devices,
        vec![
            spec(root.join("fdpm_a").to_string_lossy().into_owned()),
            spec(String::new()),
        ]
    );
    assert_eq!(
        response.container_responses[1].devices,
        vec![spec(root.join("fdpm_b").to_string_lossy().into_owned())]
    );
    assert!(response.container_responses[0].envs.is_empty());
    assert!(response.container_responses[0].mounts.is_empty());

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn allocate_sees_directories_created_after_start() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let new_device = Path::new(&config.root_path).join("fdpm_new");
    tokio::fs::create_dir(&new_device).await?;

    let mut client = connect(&endpoint).await?;
    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["fdpm_new".to_string()],
            }],
        })
        .await?
        .into_inner();
    assert_eq!(
        response.container_responses[0].devices[0].host_path,
        new_device.to_string_lossy()
    );

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn optional_calls_return_empty_responses() -> Result<(), Error> {
    let config = make_config().await?;
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint.start().await?;

    let mut client = connect(&endpoint).await?;
    let options = client.get_device_plugin_options(Empty {}).await?.into_inner();
    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);

    let preferred = client
        .get_preferred_allocation(PreferredAllocationRequest::default())
        .await?
        .into_inner();
    assert!(preferred.container_responses.is_empty());

    client
        .pre_start_container(PreStartContainerRequest {
            devices_ids: vec!["fdpm_a".to_string()],
        })
        .await?;

    endpoint.stop().await?;
    Ok(())
}

#[devicemock_test]
async fn health_reporter_fails_once_endpoint_is_dropped() -> Result<(), Error> {
    let config = make_config().await?;
    let endpoint = PluginEndpoint::new(&config);
    let reporter = endpoint.health_reporter();
    drop(endpoint);

    let err = reporter.report_unhealthy("fdpm_a").await.unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    Ok(())
}

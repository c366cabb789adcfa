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

use clap::{Parser, Subcommand};
use devicemock_config::DevicePluginConfig;
use devicemock_error::{Error, ResultExt};
use devicemock_service::PluginEndpoint;
use devicemock_util::init_tracing;
use mimalloc::MiMalloc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Instrument, Level, event, info_span};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = concat!(
    env!("DEVICEMOCK_APP_VERSION"),
    " (",
    env!("DEVICEMOCK_GIT_COMMIT_HASH"),
    ")"
);

/// Mock kubelet device plugin that advertises directories as devices.
#[derive(Parser, Debug)]
#[clap(version = VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gRPC server of the mock device plugin and register it with
    /// the kubelet.
    Run(RunArgs),
    /// Print the version of this command.
    Version,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON5 config file. Flags take precedence over its values.
    #[clap(long)]
    config: Option<String>,

    /// Directory whose sub directories are advertised as devices.
    /// [default: /mnt/fake/]
    #[clap(short = 'r', long)]
    root_path: Option<String>,

    /// Only sub directories starting with this prefix are devices.
    /// [default: fdpm_]
    #[clap(short = 'p', long)]
    prefix: Option<String>,

    /// Name of the resource as shown in the node description.
    /// [default: fake.com/device]
    #[clap(short = 'n', long)]
    resource_name: Option<String>,

    /// Directory of the kubelet and device plugin sockets.
    /// [default: /var/lib/kubelet/device-plugins/]
    #[clap(long)]
    device_plugin_path: Option<String>,
}

impl RunArgs {
    fn into_config(self) -> Result<DevicePluginConfig, Error> {
        let mut config = match &self.config {
            Some(config_file) => DevicePluginConfig::try_from_json5_file(config_file)?,
            None => DevicePluginConfig::default(),
        };
        if let Some(root_path) = self.root_path {
            config.root_path = root_path;
        }
        if let Some(prefix) = self.prefix {
            config.prefix = prefix;
        }
        if let Some(resource_name) = self.resource_name {
            config.resource_name = resource_name;
        }
        if let Some(device_plugin_path) = self.device_plugin_path {
            config.device_plugin_path = device_plugin_path;
        }
        Ok(config)
    }
}

async fn wait_for_termination() -> Result<(), Error> {
    let mut sigterm =
        signal(SignalKind::terminate()).err_tip(|| "Failed to listen to SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.err_tip(|| "Failed to listen to SIGINT"),
        _ = sigterm.recv() => Ok(()),
    }
}

async fn inner_main(config: DevicePluginConfig) -> Result<(), Error> {
    event!(Level::INFO, ?config, "Attempt to init server");
    let mut endpoint = PluginEndpoint::new(&config);
    endpoint
        .serve()
        .await
        .err_tip(|| "Failed to serve device plugin")?;
    event!(Level::INFO, "Server started");

    wait_for_termination().await?;
    event!(Level::INFO, "Received termination, signaling shutdown");
    endpoint.stop().await
}

fn run(args: RunArgs) -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;
    let config = args.into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime
        .block_on(inner_main(config).instrument(info_span!("main")))
        .err_tip(|| "main() function failed")?;
    Ok(())
}

#[expect(clippy::print_stdout, reason = "the only output of `version`")]
fn print_version() {
    println!("Version: '{VERSION}'");
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    match Args::parse().command {
        Command::Run(run_args) => run(run_args),
        Command::Version => {
            print_version();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use devicemock_macro::devicemock_test;
    use devicemock_util::fs::make_temp_path;
    use pretty_assertions::assert_eq;

    use super::*;

    fn no_flags(config: Option<String>) -> RunArgs {
        RunArgs {
            config,
            root_path: None,
            prefix: None,
            resource_name: None,
            device_plugin_path: None,
        }
    }

    async fn write_config(contents: &str) -> Result<String, Error> {
        let path = make_temp_path("devicemock.json5").await?;
        tokio::fs::write(&path, contents).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    #[devicemock_test]
    async fn no_file_and_no_flags_gives_defaults() -> Result<(), Error> {
        assert_eq!(no_flags(None).into_config()?, DevicePluginConfig::default());
        Ok(())
    }

    #[devicemock_test]
    async fn file_overrides_defaults() -> Result<(), Error> {
        let config_file =
            write_config(r#"{ root_path: "/srv/devices", prefix: "gpu_" }"#).await?;

        assert_eq!(
            no_flags(Some(config_file)).into_config()?,
            DevicePluginConfig {
                root_path: "/srv/devices".to_string(),
                prefix: "gpu_".to_string(),
                ..DevicePluginConfig::default()
            }
        );
        Ok(())
    }

    #[devicemock_test]
    async fn flags_override_file() -> Result<(), Error> {
        let config_file =
            write_config(r#"{ root_path: "/srv/devices", prefix: "gpu_" }"#).await?;
        let args = RunArgs {
            prefix: Some("nic_".to_string()),
            resource_name: Some("example.com/nic".to_string()),
            ..no_flags(Some(config_file))
        };

        assert_eq!(
            args.into_config()?,
            DevicePluginConfig {
                root_path: "/srv/devices".to_string(),
                prefix: "nic_".to_string(),
                resource_name: "example.com/nic".to_string(),
                ..DevicePluginConfig::default()
            }
        );
        Ok(())
    }

    #[test]
    fn cli_flags_parse_into_run_args() {
        let args = Args::parse_from(["devicemock", "run", "-r", "/srv/devices", "-p", "nic_"]);
        let Command::Run(run_args) = args.command else {
            panic!("expected the run subcommand");
        };
        assert_eq!(run_args.root_path.as_deref(), Some("/srv/devices"));
        assert_eq!(run_args.prefix.as_deref(), Some("nic_"));
        assert_eq!(run_args.config, None);
    }
}

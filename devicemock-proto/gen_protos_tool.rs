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

//! Regenerates `genproto/*.pb.rs`. Needs `protoc` on `PATH`:
//!
//! `cargo run -p devicemock-proto --features gen -- proto/v1beta1/api.proto -o genproto`

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use prost_build::Config;

fn main() -> std::io::Result<()> {
    let matches = Command::new("devicemock gRPC codegen")
        .about("Codegen grpc/protobuf bindings for the kubelet device plugin API")
        .arg(
            Arg::new("inputs")
                .required(true)
                .action(ArgAction::Append)
                .help("Input proto files"),
        )
        .arg(
            Arg::new("output_dir")
                .short('o')
                .required(true)
                .long("output_dir")
                .help("Output directory"),
        )
        .get_matches();
    let paths: Vec<&String> = matches
        .get_many::<String>("inputs")
        .into_iter()
        .flatten()
        .collect();
    let output_dir = matches
        .get_one::<String>("output_dir")
        .map(PathBuf::from)
        .unwrap_or_default();

    tonic_build::configure()
        .out_dir(output_dir)
        .compile_protos_with_config(Config::new(), &paths, &["proto"])?;
    Ok(())
}

//! Build script generating the device plugin gRPC stubs.
//!
//! Messages are hand-written prost types in `src/api/mod.rs`; only the
//! service plumbing is generated here, so no `protoc` is needed.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";
const PACKAGE: &str = "v1beta1";

fn method(name: &str, route: &str, input: &str, output: &str) -> tonic_build::manual::MethodBuilder {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::api::{}", input))
        .output_type(format!("crate::api::{}", output))
        .codec_path(CODEC)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let registration = Service::builder()
        .name("Registration")
        .package(PACKAGE)
        .comment("Registration is the service advertised by the kubelet.")
        .method(method("register", "Register", "RegisterRequest", "Empty").build())
        .build();

    let device_plugin = Service::builder()
        .name("DevicePlugin")
        .package(PACKAGE)
        .comment("DevicePlugin is the service advertised by device plugins.")
        .method(
            method(
                "get_device_plugin_options",
                "GetDevicePluginOptions",
                "Empty",
                "DevicePluginOptions",
            )
            .build(),
        )
        .method(
            method("list_and_watch", "ListAndWatch", "Empty", "ListAndWatchResponse")
                .server_streaming()
                .build(),
        )
        .method(
            method(
                "get_preferred_allocation",
                "GetPreferredAllocation",
                "PreferredAllocationRequest",
                "PreferredAllocationResponse",
            )
            .build(),
        )
        .method(method("allocate", "Allocate", "AllocateRequest", "AllocateResponse").build())
        .method(
            method(
                "pre_start_container",
                "PreStartContainer",
                "PreStartContainerRequest",
                "PreStartContainerResponse",
            )
            .build(),
        )
        .build();

    Builder::new().compile(&[registration, device_plugin]);
}

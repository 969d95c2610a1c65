//! Generated gRPC/protobuf bindings for the fleet control plane's wire
//! contracts (spec.md §6).
//!
//! Four services, one module each: the agent-facing discovery stream, the
//! agent command channel, the cross-controller/registry channel, and the
//! poke bridge between control-plane replicas. Grounded on the xDS-shaped
//! `tonic`/`prost` reference files in the pack and on the original's RPC
//! and message names (`controller/client/grpc/server.go`,
//! `controller/client/grpc/controller_server.go`,
//! `control-plane/server/bridge/poke.go`), generalized from their
//! Go/protoreflect types into the generated Rust types `tonic_build`
//! produces for this crate's `proto/` directory.

pub mod discovery {
    tonic::include_proto!("fleetd.discovery");
}

pub mod agent {
    tonic::include_proto!("fleetd.agent");
}

pub mod controller {
    tonic::include_proto!("fleetd.controller");
}

pub mod poke {
    tonic::include_proto!("fleetd.poke");
}

/// Encoded `FileDescriptorSet` for all four services, consumed by
/// `tonic_reflection` (spec.md §6: "reflection enabled").
pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/fleetd_descriptor.bin"));

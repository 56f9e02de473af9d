//! Build script to generate gRPC bindings from the protobuf definition.

/// Regenerates `volo` gRPC code when the protobuf changes.
///
/// Inputs: `proto/lockstep.proto`
/// Output: generated Rust code under Cargo's `OUT_DIR`.
fn main() {
    // Tell Cargo to rerun this build script when the proto file changes.
    println!("cargo:rerun-if-changed=proto/lockstep.proto");

    // Invoke the codegen pipeline for the gRPC service definition.
    volo_build::Builder::protobuf()
        .add_service("proto/lockstep.proto")
        .include_dirs(vec![std::path::PathBuf::from(".")])
        .ignore_unused(false)
        .write()
        .unwrap();
}

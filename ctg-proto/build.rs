use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Proto files live at the workspace root so other tooling can reach them
    let proto_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?)
        .parent()
        .unwrap()
        .join("proto");

    let protos = [
        proto_root.join("ctg/telemetry/v1/telemetry.proto"),
        proto_root.join("ctg/analysis/v1/analysis.proto"),
        proto_root.join("ctg/prediction/v1/prediction.proto"),
    ];

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }
    println!("cargo:rerun-if-changed={}", proto_root.display());

    // No system `protoc` binary is available in this environment, so compile
    // the descriptor set with protox (a pure-Rust protoc implementation)
    // instead of shelling out.
    let fds = protox::compile(&protos, &[&proto_root])?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // JSON-friendly wire types for cache blobs and test fixtures
        .type_attribute(".ctg", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_fds(fds)?;

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let descriptor_path = std::path::PathBuf::from(std::env::var("OUT_DIR")?).join("fleetd_descriptor.bin");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(descriptor_path)
        .compile_protos(&["proto/discovery.proto", "proto/agent.proto", "proto/controller.proto", "proto/poke.proto"], &["proto"])?;
    Ok(())
}

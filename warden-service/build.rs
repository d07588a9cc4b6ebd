use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(out_dir.join("warden_descriptor.bin"))
        .compile_protos(
            &[
                "../proto/envoy/service/auth/v3/external_auth.proto",
                "../proto/envoy/service/ratelimit/v3/rls.proto",
            ],
            &["../proto"],
        )?;

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(
            &[
                "../proto/envoy/service/auth/v3/external_auth.proto",
                "../proto/envoy/service/ratelimit/v3/rls.proto",
            ],
            &["../proto"],
        )?;
    Ok(())
}

pub mod agent;
pub mod api;
pub mod cni;
pub mod datapath;
pub mod ipam;
pub mod link;
pub mod netns;
pub mod proxy;
pub mod xds;

/// Installs the fmt subscriber filtered by `RUST_LOG`, `info` by default.
/// Output goes to stderr; the CNI plugin's stdout carries its result.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> node_hub::Result<()> {
    node_hub::init_tracing();
    let mode = node_hub::parse_command()?;
    tracing::info!(
        version = node_hub::version::VERSION,
        git_sha = node_hub::version::GIT_SHA,
        built_at = node_hub::version::BUILD_TIMESTAMP,
        mode = ?mode,
        "node-hub starting"
    );
    node_hub::run(mode).await
}

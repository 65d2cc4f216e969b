#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use mesh_node::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.server.interfaces.is_empty() && config.connect.peers.is_empty() {
        log::warn!("no interfaces are bound and no peers are configured, nothing to do");
        return Ok(());
    }

    mesh_node::startup(config).await
}

use boxgrid_common::tracing::init_tracing_with_default_env_filter;
use boxgrid_console_service::config::{make_config_loader, ConsoleServiceConfig};
use boxgrid_console_service::ConsoleService;
use tokio::task::JoinSet;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match make_config_loader().load_or_dump_config() {
        Some(config) => {
            init_tracing_with_default_env_filter(&config.tracing);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(config))
        }
        None => Ok(()),
    }
}

async fn run(config: ConsoleServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = ConsoleService::new(config).await?;
    let mut join_set = JoinSet::new();
    service.run(&mut join_set).await?;

    while let Some(result) = join_set.join_next().await {
        result??;
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_inventory::{
    cli::{ClientAction, ClientArgs, Cli, Command, NodeArgs},
    node::NodeServer,
    router::InventoryClient,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => run_node(args).await?,
        Command::Client(args) => run_client(args).await?,
    }

    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let config = args.to_config().context("invalid node configuration")?;
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = NodeServer::new(listener, config)?;
    info!("node {} listening on {}", args.id, server.local_addr()?);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let client = InventoryClient::new(args.to_config());
    match &args.action {
        ClientAction::Status => print_json(&client.get_server_status().await?),
        ClientAction::Search { query } => print_json(&client.search_product(query).await?),
        ClientAction::Buy(item) => print_json(
            &client
                .buy_product(&item.area, &item.shop, &item.item, item.quantity)
                .await?,
        ),
        ClientAction::AddStock(item) => print_json(
            &client
                .add_stock(&item.area, &item.shop, &item.item, item.quantity)
                .await?,
        ),
        ClientAction::Configure { algorithm } => {
            print_json(&client.configure_load_balancer(*algorithm).await?)
        }
        ClientAction::Stats => print_json(&client.get_load_balancer_stats().await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

//! Storefront cart CLI

use std::{process, sync::Arc};

use clap::{Args, Parser, Subcommand};
use storefront_cart::{
    config::CartConfig,
    models::CartItemUuid,
    notifications::TracingNotifier,
    observability,
    scheduler::MutationState,
    session::{CartSession, QuantityChange},
    store::CartSnapshot,
};
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "storefront-cart", about = "Storefront cart client", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: CartConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the current cart
    Show,

    /// Remove lines, waiting out the undo window (Ctrl+C undoes)
    Remove(RemoveArgs),

    /// Set a line's quantity
    Quantity(QuantityArgs),

    /// Empty the cart
    Clear,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    /// Line item UUIDs to remove
    #[arg(required = true)]
    items: Vec<CartItemUuid>,
}

#[derive(Debug, Args)]
struct QuantityArgs {
    /// Line item UUID
    item: CartItemUuid,

    /// New quantity; zero removes the line
    quantity: u32,
}

#[tokio::main]
pub async fn main() {
    let _env = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(error) = observability::init_subscriber(&cli.config.logging) {
        eprintln!("{error}");
        process::exit(1);
    }

    if let Err(error) = run(cli).await {
        error!(%error, "cart command failed");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let session = CartSession::from_config(&cli.config, Arc::new(TracingNotifier))
        .map_err(|error| format!("failed to build cart session: {error}"))?;

    session
        .refresh()
        .await
        .map_err(|error| format!("failed to load cart: {error}"))?;

    match cli.command {
        Commands::Show => {}
        Commands::Remove(args) => remove(&session, &args.items).await?,
        Commands::Quantity(args) => set_quantity(&session, args).await?,
        Commands::Clear => {
            session.clear_cart().await;
        }
    }

    print_cart(&session.snapshot());

    Ok(())
}

async fn remove(session: &CartSession, items: &[CartItemUuid]) -> Result<(), String> {
    let pending = session
        .remove_items(items)
        .map_err(|error| format!("failed to remove lines: {error}"))?;

    info!(deadline = %pending.deadline(), "press Ctrl+C to undo");

    tokio::select! {
        state = pending.finished() => {
            if state == MutationState::Restored {
                return Err("removal was refused by the cart API".to_string());
            }
        }
        _ = signal::ctrl_c() => {
            let restored = session.undo_multiple(items);

            info!(restored, "removal undone");
        }
    }

    Ok(())
}

async fn set_quantity(session: &CartSession, args: QuantityArgs) -> Result<(), String> {
    let change = session
        .update_quantity(args.item, args.quantity)
        .await
        .map_err(|error| format!("failed to update quantity: {error}"))?;

    match change {
        QuantityChange::Updated(outcome) => info!(?outcome, "quantity updated"),
        QuantityChange::RemovalScheduled(_) => session.flush_pending().await,
    }

    Ok(())
}

fn print_cart(snapshot: &CartSnapshot) {
    for item in snapshot.items() {
        println!(
            "{}  {} x{}  {}",
            item.id,
            item.product_name,
            item.quantity,
            item.line_total()
        );
    }

    println!(
        "{} item(s), total {}",
        snapshot.total_items(),
        snapshot.total_price()
    );
}

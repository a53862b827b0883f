mod commands;

use std::sync::Arc;

use anyhow::Context;
use commands::{CommandLine, Commands};
use fulfillment_events::{EventBus, EventEnvelope, InMemoryEventBus};
use fulfillment_infra::{FulfillmentConfig, FulfillmentService, PostgresFulfillmentStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let commands = CommandLine::parse_args();

    fulfillment_observability::init();

    let config = FulfillmentConfig::from_env()?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let store = PostgresFulfillmentStore::connect(&database_url).await?;
    if commands.migrate {
        store.migrate().await?;
        tracing::info!("fulfillment schema ready");
    }

    let bus = Arc::new(InMemoryEventBus::<EventEnvelope<serde_json::Value>>::new());
    let published = bus.subscribe();
    let service = FulfillmentService::new(store, bus, config);

    match commands.command {
        Commands::ProcessBackorders {
            stock_item,
            quantity,
        } => {
            let filled = service.process_backorders(stock_item, quantity).await?;
            println!("filled {} of {quantity} backorders", filled.len());
            for unit in filled {
                println!("  {} (order {})", unit.id_typed(), unit.order_id());
            }
        }
        Commands::FinalizeShipment { shipment } => {
            let updated = service.finalize_shipment(shipment).await?;
            println!("finalized {updated} inventory units");
        }
        Commands::Rates { shipment, audience } => {
            let rates = service.priced_shipping_rates(shipment, audience.into()).await?;
            if rates.is_empty() {
                println!("no shipping rates");
            }
            for priced in rates {
                let selected = if priced.option.rate.is_selected() { "*" } else { " " };
                println!(
                    "{selected} {:<24} {:>14}  {}",
                    priced.option.method.name,
                    priced.display_price,
                    priced.option.rate.id_typed()
                );
            }
        }
    }

    for envelope in published.drain() {
        tracing::info!(
            event_type = envelope.event_type(),
            aggregate_id = %envelope.aggregate_id(),
            sequence_number = envelope.sequence_number(),
            "event published"
        );
    }

    Ok(())
}

use clap::{Parser, Subcommand, ValueEnum};
use fulfillment_core::{ShipmentId, StockItemId};
use fulfillment_shipping::Audience;

#[derive(Parser)]
#[command(name = "fulfillment")]
#[command(about = "Inventory unit and shipping rate operations.")]
pub struct CommandLine {
    /// Create the fulfillment tables before running the command
    #[arg(long, global = true)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fill the oldest backorders of a stock item with newly arrived stock
    #[command(alias = "pb")]
    ProcessBackorders {
        stock_item: StockItemId,
        /// Units of stock that arrived
        quantity: usize,
    },
    /// Clear the pending flag on every unit of a shipment
    #[command(alias = "fs")]
    FinalizeShipment { shipment: ShipmentId },
    /// List a shipment's shipping rates with display prices
    #[command(alias = "r")]
    Rates {
        shipment: ShipmentId,
        #[arg(long, value_enum, default_value_t = Side::Frontend)]
        audience: Side,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Side {
    Frontend,
    Backend,
}

impl From<Side> for Audience {
    fn from(value: Side) -> Self {
        match value {
            Side::Frontend => Audience::Frontend,
            Side::Backend => Audience::Backend,
        }
    }
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

pub mod arb;
pub mod coingecko;
pub mod error;
pub mod market;
pub mod metapool;
pub mod metrics;
pub mod output;
pub mod pool;
pub mod registry;
pub mod sim;
pub mod subgraph;
pub mod sweep;

pub use error::SimError;
pub use metapool::{MetaPool, Pool};
pub use pool::FlatPool;

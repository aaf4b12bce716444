pub mod auction;
pub mod breaker;
pub mod caps;
pub mod config;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod services;
pub mod template;
pub mod transport;

pub use auction::{AuctionEngine, AuctionOutcome, AuctionTuning, Disposition};
pub use breaker::{BreakerConfig, BreakerRegistry, BuyerBreaker, CircuitState};
pub use caps::DailyCapTracker;
pub use config::{load_buyer_directory, BuyerDirectory, EngineSettings};
pub use error::{EngineError, Result, TransportError};
pub use ledger::{
    AuctionStore, LeadMutation, MemoryStore, PostgresStore, RejectionCause,
};
pub use registry::{BuyerRegistry, RegistrySnapshot};
pub use services::{EngineMetrics, HealthServer, HealthState};
pub use template::Template;
pub use transport::{BuyerTransport, DryRunTransport, HttpTransport};

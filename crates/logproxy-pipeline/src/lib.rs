//! Ingestion-to-broadcast pipeline: one reader, one ordered bus, one
//! fan-out loop, any number of independently paced consumers.

pub mod broadcast;
pub mod bus;
pub mod consumer;
pub mod ingest;

pub use broadcast::{BroadcastStats, Broadcaster, Payload};
pub use bus::{BusReceiver, Publisher};
pub use consumer::Subscription;
pub use ingest::{IngestEnd, IngestReport, Ingestor};

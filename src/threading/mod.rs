//! Conversation threading — assigns every message to a session, dedupes
//! re-deliveries, and retroactively repairs conversations split across
//! inconsistent thread headers.

pub mod address;
pub mod ingest;
pub mod resolver;

pub use address::{normalize_address, normalize_subject};
pub use ingest::{InboundEmail, IngestionPipeline};
pub use resolver::ConversationResolver;

//! Mail transport — IMAP polling for inbound, SMTP via lettre for outbound.

pub mod email;
pub mod email_poller;

pub use email::{EmailConfig, FetchedEmail};
pub use email_poller::spawn_email_poller;

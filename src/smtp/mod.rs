//! SMTP protocol surface: parsing, the transaction state machine and the
//! per-connection server loop.

pub mod address;
pub mod command;
pub mod envelope;
pub mod error;
pub mod reply;
pub mod server;
pub mod transaction;

pub use address::Address;
pub use command::{Action, Dispatch};
pub use envelope::Envelope;
pub use error::{SmtpError, SmtpLimits};
pub use reply::Reply;
pub use server::SmtpServer;
pub use transaction::{Mode, Transaction};

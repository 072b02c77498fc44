//! RFC 3261 §17 transaction layer: four small state machines driven by
//! [`manager::TransactionManager`], one `tokio` task per live transaction.

pub mod client_invite;
pub mod client_noninvite;
pub mod key;
pub mod manager;
pub mod server_invite;
pub mod server_noninvite;
pub mod state;
pub mod timer;

pub use key::{Direction, TransactionKey, TransactionKind};
pub use manager::{TransactionEvent, TransactionManager};
pub use state::TransactionState;

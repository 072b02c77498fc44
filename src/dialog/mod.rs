//! The dialog layer (§3-§6): lifecycle state machine, identity, and the
//! `Dialog` handle applications hold.

mod dialog_impl;
pub mod fsm;
pub mod key;
pub mod state;

pub use dialog_impl::{Dialog, DialogDeps, StateChangeEvent, TerminateEvent, TerminateReason};
pub use fsm::{DialogEffect, DialogEvent};
pub use key::DialogKey;
pub use state::{DialogState, Role};

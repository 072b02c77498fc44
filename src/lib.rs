//! A SIP (RFC 3261) dialog, transaction and timer core for a softphone or
//! back-to-back user agent: owns dialog lifecycle, client/server
//! transaction state machines, and retransmission timers, and hands the
//! application a `Dialog` handle per call plus a `Stack` that drives
//! whatever `Transport` it's given. Carries no media or SDP handling of its
//! own — that belongs one layer up, same as the transport itself.

pub mod api;
pub mod body;
pub mod callbacks;
pub mod config;
pub mod dialog;
pub mod error;
pub mod ids;
pub mod observability;
pub mod refer;
pub mod registry;
pub mod routing;
pub mod stack;
pub mod transaction;
pub mod transport;

pub use api::{ApiError, ApiResult, InviteOpts, ReferReplaceTarget, ResponseOpts};
pub use body::Body;
pub use config::{StackConfig, StackConfigBuilder, TimerSettings};
pub use dialog::{Dialog, DialogKey, DialogState, Role, StateChangeEvent, TerminateEvent, TerminateReason};
pub use error::{DialogError, DialogResult};
pub use observability::{CountersSnapshot, HealthReport, MetricsSink, NoopMetricsSink};
pub use stack::Stack;
pub use transport::{Destination, Transport, TransportError};

//! Routes messages the transport hands to `Stack::run` to the owning
//! transaction and dialog (RFC 3261 §12.2 dialog identification), grounded
//! on the teacher's `message_routing`/`dialog_operations` split: matching is
//! plain data lookups against the registry and transaction manager, with no
//! protocol decisions of its own — those stay in [`crate::stack::Stack`] and
//! [`crate::dialog::Dialog`].

use std::net::SocketAddr;
use std::sync::Arc;

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Method, Param, SipMessage};
use tokio::sync::mpsc;

use crate::dialog::Dialog;
use crate::error::{DialogError, DialogResult};
use crate::registry::DialogRegistry;
use crate::transaction::key::{Direction, TransactionKey};
use crate::transaction::manager::{TransactionEvent, TransactionManager};

/// What an incoming message turned out to be, once routed. `Stack::run`
/// matches on this to decide whether to hand the application a brand-new
/// dialog, forward an in-dialog request, or do nothing further (a message
/// already fully handled by the transaction layer, e.g. a retransmission).
pub enum RoutingOutcome {
    /// A request to an existing dialog (BYE, re-INVITE, REFER, ...). The
    /// server transaction has already been adopted and tied to the dialog;
    /// `Stack` still owns interpreting `request.method` and eventually
    /// calling something like `Dialog::handle_incoming_bye`.
    InDialogRequest { dialog: Arc<Dialog>, request: rsip::Request, transaction: TransactionKey },
    /// An initial INVITE with no matching dialog. `Stack` decides whether to
    /// create a UAS dialog (and with which local tag) and surfaces this to
    /// the application's incoming-call callback. `events` is this server
    /// transaction's event stream — `Stack` must keep draining it (at least
    /// for `AckReceived`/`Timeout`) once the dialog exists.
    NewInvite { request: rsip::Request, source: SocketAddr, transaction: TransactionKey, events: mpsc::Receiver<TransactionEvent> },
    /// A CANCEL for a still-ringing INVITE server transaction (RFC 3261
    /// §9.2). `invite_transaction` is the original INVITE's server
    /// transaction key, already matched by shared branch; `Stack` answers
    /// the CANCEL itself with a 200 and tells the dialog to terminate via
    /// `Dialog::handle_incoming_cancel`.
    CancelRequest { dialog: Arc<Dialog>, cancel_request: rsip::Request, cancel_transaction: TransactionKey, invite_transaction: TransactionKey },
    /// A request this stack has no dialog context for and isn't an initial
    /// INVITE (e.g. an OPTIONS ping, or an in-dialog request for a dialog
    /// that has already been torn down). Left for `Stack` to answer, usually
    /// with a 481/405.
    Stray { request: rsip::Request, source: SocketAddr, transaction: TransactionKey },
}

/// Holds no state of its own beyond the registry/transaction manager it was
/// built from; cheap to construct per-`Stack`.
pub struct Router {
    registry: Arc<DialogRegistry>,
    transactions: Arc<TransactionManager>,
}

impl Router {
    pub fn new(registry: Arc<DialogRegistry>, transactions: Arc<TransactionManager>) -> Self {
        Self { registry, transactions }
    }

    /// Routes one inbound message. Responses are always consumed internally
    /// (fed to their client transaction) and this returns `Ok(None)`;
    /// requests may produce a [`RoutingOutcome`] for `Stack` to act on.
    pub async fn handle_incoming(&self, message: SipMessage, source: SocketAddr) -> DialogResult<Option<RoutingOutcome>> {
        match message {
            SipMessage::Response(response) => {
                self.route_response(response).await?;
                Ok(None)
            }
            SipMessage::Request(request) => self.route_request(request, source).await.map(Some),
        }
    }

    async fn route_response(&self, response: rsip::Response) -> DialogResult<()> {
        let branch = response
            .via_header()
            .ok()
            .and_then(|via| via.typed().ok()).and_then(|via| via.branch().map(|b| b.to_string()))
            .ok_or_else(|| DialogError::protocol_error("response missing Via branch"))?;
        let method = response
            .cseq_header()
            .ok()
            .and_then(|c| c.typed().ok())
            .map(|c| c.method)
            .ok_or_else(|| DialogError::protocol_error("response missing CSeq method"))?;
        let key = TransactionKey::new(branch, method, Direction::Client);
        self.transactions.on_response(&key, response).await
    }

    async fn route_request(&self, request: rsip::Request, source: SocketAddr) -> DialogResult<RoutingOutcome> {
        let branch = branch_of(&request)?;

        if request.method == Method::Cancel {
            return self.route_cancel(request, source, branch).await;
        }

        let transaction_matching_method = if request.method == Method::Ack { Method::Invite } else { request.method };
        let key = TransactionKey::new(branch.clone(), transaction_matching_method, Direction::Server);

        if self.transactions.owning_dialog(&key).is_some() || self.retransmit_if_known(&key, &request).await? {
            // Either already tied to a dialog (the dialog's own event loop is
            // draining transaction events) or a pure retransmission that the
            // transaction layer just absorbed; nothing further to route.
            return Ok(RoutingOutcome::Stray { request, source, transaction: key });
        }

        let (from_tag, to_tag) = request_tags(&request)?;
        if let Some(dialog) = self.registry.lookup_by_call_id(&call_id_of(&request)?, &to_tag, &from_tag) {
            let (tx_key, _events) = self.transactions.adopt(request.clone(), source)?;
            self.transactions.set_owning_dialog(&tx_key, dialog.key_snapshot());
            return Ok(RoutingOutcome::InDialogRequest { dialog, request, transaction: tx_key });
        }

        if request.method == Method::Invite && to_tag.is_empty() {
            let (tx_key, events) = self.transactions.adopt(request.clone(), source)?;
            return Ok(RoutingOutcome::NewInvite { request, source, transaction: tx_key, events });
        }

        let (tx_key, _events) = self.transactions.adopt(request.clone(), source)?;
        Ok(RoutingOutcome::Stray { request, source, transaction: tx_key })
    }

    /// CANCEL matches by branch against the INVITE's *method*, not its own
    /// (RFC 3261 §9.2) — it is always its own server transaction (a
    /// `ServerNonInvite`, per [`crate::transaction::key::TransactionKind::for_request`]),
    /// adopted here regardless of whether a matching INVITE is found, so it
    /// gets its own 200 either way.
    async fn route_cancel(&self, request: rsip::Request, source: SocketAddr, branch: String) -> DialogResult<RoutingOutcome> {
        let invite_key = TransactionKey::new(branch, Method::Invite, Direction::Server);
        let (cancel_tx_key, _events) = self.transactions.adopt(request.clone(), source)?;

        let dialog = self.transactions.owning_dialog(&invite_key).and_then(|dialog_key| self.registry.get(&dialog_key));
        match dialog {
            Some(dialog) => Ok(RoutingOutcome::CancelRequest { dialog, cancel_request: request, cancel_transaction: cancel_tx_key, invite_transaction: invite_key }),
            None => Ok(RoutingOutcome::Stray { request, source, transaction: cancel_tx_key }),
        }
    }

    /// Feeds `request` to its transaction if one is already live (a
    /// retransmission or an in-dialog ACK); returns whether it was consumed
    /// that way.
    async fn retransmit_if_known(&self, key: &TransactionKey, request: &rsip::Request) -> DialogResult<bool> {
        match self.transactions.on_request_retransmit(key, request.clone()).await {
            Ok(()) => Ok(true),
            Err(DialogError::TransactionNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn branch_of(request: &rsip::Request) -> DialogResult<String> {
    request
        .via_header()
        .ok()
        .and_then(|via| via.typed().ok()).and_then(|via| via.branch().map(|b| b.to_string()))
        .ok_or_else(|| DialogError::protocol_error("request missing Via branch"))
}

fn call_id_of(request: &rsip::Request) -> DialogResult<String> {
    request.call_id_header().map(|h| h.value().to_string()).map_err(|_| DialogError::protocol_error("request missing Call-ID"))
}

/// `(from_tag, to_tag)` as carried on the wire. RFC 3261 §12.2.2: for a UAS
/// matching an incoming in-dialog request, its own local tag is the
/// request's To-tag and the remote tag is the request's From-tag — the
/// inverse of how `DialogKey` stores `(local_tag, remote_tag)` on the UAC
/// side, which is why callers pass these swapped into `lookup_by_call_id`.
fn request_tags(request: &rsip::Request) -> DialogResult<(String, String)> {
    let from = request.from_header().ok().and_then(|h| h.typed().ok()).ok_or_else(|| DialogError::protocol_error("request missing From header"))?;
    let to = request.to_header().ok().and_then(|h| h.typed().ok()).ok_or_else(|| DialogError::protocol_error("request missing To header"))?;
    let from_tag = from.params.iter().find_map(|p| match p {
        Param::Tag(tag) => Some(tag.to_string()),
        _ => None,
    }).unwrap_or_default();
    let to_tag = to.params.iter().find_map(|p| match p {
        Param::Tag(tag) => Some(tag.to_string()),
        _ => None,
    }).unwrap_or_default();
    Ok((from_tag, to_tag))
}

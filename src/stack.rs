//! `Stack`: the application-facing entry point that owns the registry,
//! transaction manager and id pool, drives the transport's receive loop, and
//! hands fresh dialogs to the application — grounded on the teacher's
//! `DialogManager` (its constructor wiring of transaction manager + dialog
//! store + event sender into one handle) and `coordinator.rs`'s session
//! receive loop, adapted from a session-core/media-aware coordinator to a
//! dialog-only one.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, SipMessage, StatusCode, Uri};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{InviteOpts, ReferReplaceTarget, ResponseOpts};
use crate::body::Body;
use crate::config::StackConfig;
use crate::dialog::{Dialog, DialogDeps, DialogKey, DialogState, Role};
use crate::error::{DialogError, DialogResult};
use crate::ids::IdGeneratorPool;
use crate::observability::{Counters, CountersSnapshot, HealthReport, MetricsSink};
use crate::refer::{self, ReplacesInfo, SubscriptionId};
use crate::registry::DialogRegistry;
use crate::routing::{Router, RoutingOutcome};
use crate::transaction::key::TransactionKey;
use crate::transaction::manager::{TransactionEvent, TransactionManager};
use crate::transport::Transport;

/// Reports every counter increment to the stack's own always-present
/// [`Counters`] and, if the application supplied one, to its
/// [`MetricsSink`] as well.
struct FanoutMetrics {
    counters: Arc<Counters>,
    app: Option<Arc<dyn MetricsSink>>,
}

macro_rules! fanout {
    ($name:ident) => {
        fn $name(&self) {
            self.counters.$name();
            if let Some(app) = &self.app {
                app.$name();
            }
        }
    };
}

impl MetricsSink for FanoutMetrics {
    fanout!(dialog_created);
    fanout!(dialog_terminated);
    fanout!(transaction_timeout);
    fanout!(transaction_transport_failure);
    fanout!(callback_panic);
    fanout!(id_pool_hit);
    fanout!(id_pool_miss);
}

type IncomingInviteHandler = dyn Fn(Arc<Dialog>, rsip::Request) + Send + Sync;
type IncomingReferHandler = dyn Fn(Arc<Dialog>, SubscriptionId, Uri, Option<ReplacesInfo>) + Send + Sync;

/// Owns one stack's worth of dialog/transaction state. Construct with
/// [`Stack::new`], register an [`Stack::on_incoming_invite`] handler, then
/// run [`Stack::run`] against whatever [`Transport`] feeds it.
pub struct Stack {
    config: Arc<StackConfig>,
    registry: Arc<DialogRegistry>,
    transactions: Arc<TransactionManager>,
    ids: Arc<IdGeneratorPool>,
    transport: Arc<dyn Transport>,
    router: Router,
    deps: Arc<DialogDeps>,
    counters: Arc<Counters>,
    incoming_invite_handler: SyncRwLock<Option<Arc<IncomingInviteHandler>>>,
    incoming_refer_handler: SyncRwLock<Option<Arc<IncomingReferHandler>>>,
    cancel: CancellationToken,
}

impl Stack {
    /// Builds a new stack. `metrics` is the application's optional sink;
    /// the stack's own [`Counters`] are always kept regardless.
    pub fn new(transport: Arc<dyn Transport>, config: StackConfig, metrics: Option<Arc<dyn MetricsSink>>) -> Arc<Self> {
        let config = Arc::new(config);
        let counters = Arc::new(Counters::default());
        let sink: Arc<dyn MetricsSink> = Arc::new(FanoutMetrics { counters: counters.clone(), app: metrics });

        let registry = Arc::new(DialogRegistry::new(config.registry_shards));
        let transactions = TransactionManager::new(transport.clone(), config.clone(), sink.clone());
        let ids = Arc::new(IdGeneratorPool::new(&config.local_host_port.0, config.local_host_port.1, config.id_pool_size, sink.clone()));
        let deps = Arc::new(DialogDeps { transactions: transactions.clone(), ids: ids.clone(), metrics: sink, config: config.clone() });
        let router = Router::new(registry.clone(), transactions.clone());

        Arc::new(Self {
            config,
            registry,
            transactions,
            ids,
            transport,
            router,
            deps,
            counters,
            incoming_invite_handler: SyncRwLock::new(None),
            incoming_refer_handler: SyncRwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Registers the callback invoked for every freshly-arrived initial
    /// INVITE. The dialog is already `Ringing`-eligible (its server
    /// transaction has been adopted); the application accepts or rejects it
    /// via `Dialog::accept`/`Dialog::reject`.
    pub fn on_incoming_invite(&self, handler: impl Fn(Arc<Dialog>, rsip::Request) + Send + Sync + 'static) {
        *self.incoming_invite_handler.write() = Some(Arc::new(handler));
    }

    /// Registers the callback invoked once a validated incoming REFER has
    /// already been answered 202 and its implicit subscription seeded. The
    /// application places the referred call and reports its progress back
    /// through `Dialog::send_refer_notify`/`update_refer_subscription`.
    pub fn on_incoming_refer(&self, handler: impl Fn(Arc<Dialog>, SubscriptionId, Uri, Option<ReplacesInfo>) + Send + Sync + 'static) {
        *self.incoming_refer_handler.write() = Some(Arc::new(handler));
    }

    pub fn config(&self) -> &Arc<StackConfig> {
        &self.config
    }

    pub fn metrics(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn health_check(&self) -> HealthReport {
        HealthReport {
            live_dialogs: self.registry.count(),
            live_transactions: self.transactions.live_count(),
            oldest_transaction_age_ms: self.transactions.oldest_age().map(|d| d.as_millis() as u64),
            id_pool_fill_percent: self.ids.fill_percent(),
        }
    }

    /// Starts a brand-new outgoing call. Registers the early dialog (its
    /// `DialogKey` has an empty remote tag until the first dialog-creating
    /// response arrives) before sending the INVITE, so a very fast response
    /// can never race dialog lookup.
    pub async fn new_invite(&self, local_uri: Uri, remote_uri: Uri, opts: InviteOpts) -> DialogResult<Arc<Dialog>> {
        if let Some(max) = self.config.max_concurrent_dialogs {
            if self.registry.count() >= max {
                return Err(DialogError::ResourceExhaustion { limit: "max_concurrent_dialogs".to_string() });
            }
        }

        let call_id = self.ids.get_call_id(self.deps.metrics.as_ref());
        let local_tag = self.ids.get_tag(self.deps.metrics.as_ref());
        let key = DialogKey::new(call_id, local_tag, "");

        let dialog = Arc::new(Dialog::new(key, Role::Uac, local_uri, remote_uri, self.deps.clone()));
        self.registry.insert(dialog.clone())?;
        self.deps.metrics.dialog_created();
        self.register_terminate_cleanup(&dialog);

        match dialog.start_invite(opts).await {
            Ok((_tx_key, events)) => {
                self.spawn_invite_event_drain(dialog.clone(), events);
                Ok(dialog)
            }
            Err(err) => {
                self.registry.remove(&dialog.key_snapshot());
                Err(err)
            }
        }
    }

    /// Sends BYE for `dialog` and spawns the drain for its transaction's
    /// event stream, so the caller doesn't have to — see
    /// [`Dialog::bye`]'s own doc comment for why `Dialog` can't spawn that
    /// drain itself.
    pub async fn bye(&self, dialog: &Arc<Dialog>) -> DialogResult<()> {
        let (tx_key, events) = dialog.bye().await?;
        self.spawn_bye_event_drain(dialog.clone(), tx_key, events);
        Ok(())
    }

    /// Sends a re-INVITE for `dialog` and spawns the drain for its
    /// transaction's event stream — same split as [`Stack::bye`].
    pub async fn reinvite(&self, dialog: &Arc<Dialog>, opts: InviteOpts) -> DialogResult<()> {
        let (_tx_key, events) = dialog.reinvite(opts).await?;
        self.spawn_reinvite_event_drain(dialog.clone(), events);
        Ok(())
    }

    /// Sends a REFER for `dialog` and spawns the drain for its
    /// transaction's event stream — same split as [`Stack::bye`].
    pub async fn refer(&self, dialog: &Arc<Dialog>, target: Uri) -> DialogResult<SubscriptionId> {
        let (id, tx_key, events) = dialog.refer(target).await?;
        self.spawn_refer_event_drain(dialog.clone(), id.clone(), tx_key, events);
        Ok(id)
    }

    /// Sends a REFER for an attended transfer, same split as [`Stack::refer`].
    pub async fn refer_replace(&self, dialog: &Arc<Dialog>, opts: ReferReplaceTarget) -> DialogResult<SubscriptionId> {
        let (id, tx_key, events) = dialog.refer_replace(opts).await?;
        self.spawn_refer_event_drain(dialog.clone(), id.clone(), tx_key, events);
        Ok(id)
    }

    /// Looks up a live dialog by its current key.
    pub fn dialog(&self, key: &DialogKey) -> Option<Arc<Dialog>> {
        self.registry.get(key)
    }

    pub fn dialog_count(&self) -> usize {
        self.registry.count()
    }

    /// Removes a dialog from the registry once it terminates, so a
    /// finished call doesn't linger as live state forever.
    fn register_terminate_cleanup(&self, dialog: &Arc<Dialog>) {
        let registry = self.registry.clone();
        dialog.on_terminate(move |event| {
            registry.remove(&event.key);
        });
    }

    /// Drains `transport.recv()` until it returns `None` or `shutdown` is
    /// called, routing each message and acting on the result.
    pub async fn run(self: &Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = self.transport.recv() => {
                    match incoming {
                        Some((source, message)) => self.handle_incoming(source, message).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// Cancels `run`'s loop and waits for every live transaction to drain,
    /// up to `config.shutdown_grace_period`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.transactions.shutdown(Some(self.config.shutdown_grace_period)).await;
    }

    async fn handle_incoming(self: &Arc<Self>, source: SocketAddr, message: SipMessage) {
        match self.router.handle_incoming(message, source).await {
            Ok(Some(outcome)) => self.act_on_outcome(outcome).await,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to route incoming message"),
        }
    }

    async fn act_on_outcome(self: &Arc<Self>, outcome: RoutingOutcome) {
        match outcome {
            RoutingOutcome::NewInvite { request, source: _, transaction, events } => {
                self.handle_new_invite(request, transaction, events).await;
            }
            RoutingOutcome::InDialogRequest { dialog, request, transaction } => {
                self.handle_in_dialog_request(dialog, request, transaction).await;
            }
            RoutingOutcome::CancelRequest { dialog, cancel_request, cancel_transaction, invite_transaction } => {
                self.handle_cancel(dialog, cancel_request, cancel_transaction, invite_transaction).await;
            }
            RoutingOutcome::Stray { request, transaction, .. } => {
                self.handle_stray(request, transaction).await;
            }
        }
    }

    /// Answers the CANCEL itself with a 200 regardless of outcome (RFC 3261
    /// §9.2 — even a CANCEL that arrives too late, after the INVITE has
    /// already been answered, still gets one), then tells the dialog to
    /// terminate if it was still ringing.
    async fn handle_cancel(&self, dialog: Arc<Dialog>, cancel_request: rsip::Request, cancel_transaction: TransactionKey, _invite_transaction: TransactionKey) {
        let response = simple_response(&cancel_request, StatusCode::OK);
        let _ = self.transactions.respond(&cancel_transaction, response).await;

        if let Err(err) = dialog.handle_incoming_cancel().await {
            warn!(error = %err, "CANCEL arrived for a dialog no longer eligible to be cancelled");
        }
    }

    async fn handle_new_invite(self: &Arc<Self>, request: rsip::Request, transaction: TransactionKey, events: mpsc::Receiver<TransactionEvent>) {
        let parties = match incoming_invite_parties(&request) {
            Ok(parties) => parties,
            Err(err) => {
                warn!(error = %err, "malformed incoming INVITE, dropping");
                return;
            }
        };
        if self.config.max_concurrent_dialogs.is_some_and(|max| self.registry.count() >= max) {
            let response = simple_response(&request, StatusCode::ServiceUnavailable);
            let _ = self.transactions.respond(&transaction, response).await;
            return;
        }

        if let Some(status) = self.check_replaces(&request).await {
            if status != StatusCode::OK {
                let response = simple_response(&request, status);
                let _ = self.transactions.respond(&transaction, response).await;
                return;
            }
        }

        let local_tag = self.ids.get_tag(self.deps.metrics.as_ref());
        let key = DialogKey::new(parties.call_id, local_tag, parties.from_tag);
        let dialog = Arc::new(Dialog::new(key.clone(), Role::Uas, parties.local_uri, parties.remote_uri, self.deps.clone()));

        if let Err(err) = dialog.receive_invite(request.clone(), transaction.clone()).await {
            warn!(error = %err, "failed to seed incoming dialog");
            return;
        }
        if let Err(err) = self.registry.insert(dialog.clone()) {
            warn!(error = %err, "duplicate incoming dialog key");
            return;
        }
        self.transactions.set_owning_dialog(&transaction, key);
        self.deps.metrics.dialog_created();
        self.register_terminate_cleanup(&dialog);
        self.spawn_invite_event_drain(dialog.clone(), events);

        let handler = self.incoming_invite_handler.read().clone();
        match handler {
            Some(handler) => handler(dialog, request),
            None => {
                // No application handler registered: there is nobody to
                // accept this call, so decline it outright.
                let response = simple_response(&request, StatusCode::Decline);
                let _ = self.transactions.respond(&transaction, response).await;
            }
        }
    }

    /// Checks an incoming INVITE's `Replaces` header (RFC 3891 §4) against
    /// the registry. Returns `None` when there's no `Replaces` header at
    /// all (normal new-dialog path); `Some(StatusCode::OK)` when the target
    /// dialog was found and is eligible to be replaced; `Some(other)` with
    /// the status the INVITE should be rejected with otherwise — 400 for a
    /// malformed header, 481 when the target dialog doesn't exist, 486 when
    /// `early-only` was requested but the target has already answered.
    async fn check_replaces(&self, request: &rsip::Request) -> Option<StatusCode> {
        let raw = other_header_value(request, "Replaces")?;
        let replaces = match ReplacesInfo::parse(&raw) {
            Ok(replaces) => replaces,
            Err(err) => {
                warn!(error = %err, "malformed Replaces header on incoming INVITE");
                return Some(StatusCode::BadRequest);
            }
        };

        let target_key = DialogKey::new(replaces.call_id.clone(), replaces.to_tag.clone(), replaces.from_tag.clone());
        let Some(target) = self.registry.get(&target_key) else {
            return Some(StatusCode::CallTransactionDoesNotExist);
        };
        if replaces.early_only && target.state().await == DialogState::Established {
            return Some(StatusCode::BusyHere);
        }
        Some(StatusCode::OK)
    }

    async fn handle_in_dialog_request(&self, dialog: Arc<Dialog>, request: rsip::Request, transaction: TransactionKey) {
        // RFC 3261 §12.2.2: ACK carries its INVITE's CSeq, not a new one, so
        // it's exempt from the strictly-increasing check every other
        // in-dialog request is held to.
        if request.method != Method::Ack && !dialog.admit_remote_cseq(&request).await {
            warn!(method = %request.method, "in-dialog request CSeq not greater than remote_seq, rejecting");
            let response = simple_response(&request, StatusCode::ServerInternalError);
            let _ = self.transactions.respond(&transaction, response).await;
            return;
        }

        dialog.notify_request(&request);
        if !request.body.is_empty() {
            dialog.notify_body(&Body::new(content_type_of(&request), request.body.clone()));
        }

        if request.method == Method::Bye {
            if let Err(err) = dialog.handle_incoming_bye().await {
                warn!(error = %err, "incoming BYE rejected by dialog state machine");
                return;
            }
        }

        // A re-INVITE is a target-refresh request (RFC 3261 §12.2.1.1): its
        // Contact updates our view of `remote_target`, and our own 200 needs
        // our current Contact so the remote party can do the same.
        if request.method == Method::Invite {
            dialog.apply_target_refresh(&request).await;
            let response = dialog.build_in_dialog_response(&request, StatusCode::OK, &ResponseOpts::default()).await;
            let _ = self.transactions.respond(&transaction, response).await;
            return;
        }

        if request.method == Method::Refer {
            self.handle_incoming_refer(dialog, request, transaction).await;
            return;
        }

        if request.method == Method::Notify {
            dialog.handle_incoming_notify(&request).await;
        }

        // ACK never gets a response; everything else this stack doesn't
        // have a dedicated handler for (INFO, UPDATE, ...) gets a plain 200
        // so its transaction completes. The application inspects the
        // request via `Dialog::on_request`.
        if request.method != Method::Ack {
            let response = simple_response(&request, StatusCode::OK);
            let _ = self.transactions.respond(&transaction, response).await;
        }
    }

    async fn handle_stray(&self, request: rsip::Request, transaction: TransactionKey) {
        if request.method == Method::Ack {
            return;
        }
        let response = simple_response(&request, StatusCode::CallTransactionDoesNotExist);
        let _ = self.transactions.respond(&transaction, response).await;
    }

    fn spawn_invite_event_drain(&self, dialog: Arc<Dialog>, mut events: mpsc::Receiver<TransactionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = matches!(event, TransactionEvent::Terminated);
                if let Err(err) = dialog.handle_invite_transaction_event(event).await {
                    warn!(error = %err, "invite transaction event rejected by dialog state machine");
                }
                if terminal {
                    break;
                }
            }
        });
    }

    fn spawn_bye_event_drain(&self, dialog: Arc<Dialog>, tx_key: TransactionKey, mut events: mpsc::Receiver<TransactionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = matches!(event, TransactionEvent::Terminated);
                if let Err(err) = dialog.handle_bye_transaction_event(&tx_key, event).await {
                    warn!(error = %err, "BYE transaction event rejected by dialog state machine");
                }
                if terminal {
                    break;
                }
            }
        });
    }

    fn spawn_reinvite_event_drain(&self, dialog: Arc<Dialog>, mut events: mpsc::Receiver<TransactionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = matches!(event, TransactionEvent::Terminated);
                if let Err(err) = dialog.handle_reinvite_transaction_event(event).await {
                    warn!(error = %err, "re-INVITE transaction event rejected by dialog state machine");
                }
                if terminal {
                    break;
                }
            }
        });
    }

    fn spawn_refer_event_drain(&self, dialog: Arc<Dialog>, id: SubscriptionId, _tx_key: TransactionKey, mut events: mpsc::Receiver<TransactionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = matches!(event, TransactionEvent::Terminated);
                dialog.handle_refer_transaction_event(&id, event).await;
                if terminal {
                    break;
                }
            }
        });
    }

    /// Validates an incoming REFER and either answers 202 (and notifies the
    /// application once the implicit subscription exists) or 400 if its
    /// `Refer-To` didn't parse (§4.6 "Incoming REFER").
    async fn handle_incoming_refer(&self, dialog: Arc<Dialog>, request: rsip::Request, transaction: TransactionKey) {
        match dialog.receive_refer(&request).await {
            Ok((id, target, replaces)) => {
                let response = dialog.build_in_dialog_response(&request, StatusCode::Accepted, &ResponseOpts::default()).await;
                let _ = self.transactions.respond(&transaction, response).await;

                let body = refer::sipfrag::build(StatusCode::Trying, None);
                if let Err(err) = dialog.send_refer_notify(&id, body, false).await {
                    warn!(error = %err, "failed to send initial REFER NOTIFY");
                }

                let handler = self.incoming_refer_handler.read().clone();
                if let Some(handler) = handler {
                    handler(dialog, id, target, replaces);
                }
            }
            Err(err) => {
                warn!(error = %err, "malformed incoming REFER");
                let response = dialog.build_in_dialog_response(&request, StatusCode::BadRequest, &ResponseOpts::default()).await;
                let _ = self.transactions.respond(&transaction, response).await;
            }
        }
    }
}

struct IncomingInviteParties {
    local_uri: Uri,
    remote_uri: Uri,
    from_tag: String,
    call_id: String,
}

fn incoming_invite_parties(request: &rsip::Request) -> DialogResult<IncomingInviteParties> {
    let from = request.from_header().ok().and_then(|h| h.typed().ok()).ok_or_else(|| DialogError::protocol_error("INVITE missing From header"))?;
    let to = request.to_header().ok().and_then(|h| h.typed().ok()).ok_or_else(|| DialogError::protocol_error("INVITE missing To header"))?;
    let call_id = request.call_id_header().map(|h| h.value().to_string()).map_err(|_| DialogError::protocol_error("INVITE missing Call-ID"))?;
    let from_tag = from.params.iter().find_map(|p| match p {
        Param::Tag(tag) => Some(tag.to_string()),
        _ => None,
    }).unwrap_or_default();

    Ok(IncomingInviteParties { local_uri: to.uri, remote_uri: from.uri, from_tag, call_id })
}

/// A standalone request/response header copy for messages answered before
/// (or without) an owning `Dialog` to build a response from — `Dialog`'s own
/// `build_response` additionally injects a To-tag and local Contact, which
/// only makes sense once a dialog exists.
fn simple_response(request: &rsip::Request, status: StatusCode) -> rsip::Response {
    let mut headers = rsip::Headers::default();
    for header in request.headers.iter() {
        match header {
            Header::Via(via) => headers.push(Header::Via(via.clone())),
            Header::From(from) => headers.push(Header::From(from.clone())),
            Header::To(to) => headers.push(Header::To(to.clone())),
            Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
            Header::CSeq(cseq) => headers.push(Header::CSeq(cseq.clone())),
            _ => {}
        }
    }
    rsip::Response { status_code: status, headers, body: Vec::new(), version: request.version().clone() }
}

/// Looks up an extension header `rsip` has no typed variant for (`Replaces`),
/// case-insensitively by name.
fn other_header_value(request: &rsip::Request, name: &str) -> Option<String> {
    request.headers.iter().find_map(|h| match h {
        Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.clone()),
        _ => None,
    })
}

fn content_type_of(request: &rsip::Request) -> String {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            Header::ContentType(ct) => Some(ct.value().to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_invite_parties_extracts_tags_and_uris() {
        let request = rsip::Request {
            method: Method::Invite,
            uri: Uri::try_from("sip:bob@example.com").unwrap(),
            headers: {
                let mut h = rsip::Headers::default();
                h.push(Header::From("<sip:alice@example.com>;tag=abc".into()));
                h.push(Header::To("<sip:bob@example.com>".into()));
                h.push(Header::CallId("call-xyz".into()));
                h
            },
            body: Vec::new(),
            version: rsip::Version::V2,
        };
        let parties = incoming_invite_parties(&request).unwrap();
        assert_eq!(parties.from_tag, "abc");
        assert_eq!(parties.call_id, "call-xyz");
    }
}

//! The `Dialog` handle applications hold (§3, §6.2) and the operations
//! defined on it. Route-set construction, CSeq bookkeeping and request/
//! response templating follow the teacher's `DialogInner::make_request`/
//! `make_response` pattern, adapted to this crate's pure-FSM-plus-effects
//! driver instead of mutating state inline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::typed::CSeq;
use rsip::{Header, Headers, Method, Param, Request, Response, StatusCode, Uri};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::api::{InviteOpts, ReferReplaceTarget, ResponseOpts};
use crate::body::Body;
use crate::callbacks::{CallbackList, CloseOnce};
use crate::config::StackConfig;
use crate::dialog::fsm::{self, DialogEffect, DialogEvent};
use crate::dialog::key::DialogKey;
use crate::dialog::state::{DialogState, Role};
use crate::error::{DialogError, DialogResult};
use crate::ids::IdGeneratorPool;
use crate::observability::MetricsSink;
use crate::refer::{self, ReferStatus, ReferSubscription, ReplacesInfo, SubscriptionId};
use crate::transaction::key::TransactionKey;
use crate::transaction::manager::{TransactionEvent, TransactionManager};

/// Why a dialog reached `Terminated`, reported to `terminate` callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    LocalBye,
    RemoteBye,
    Rejected { status: u16 },
    Cancelled,
    Timeout,
    TransportFailure,
    Closed,
}

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub key: DialogKey,
    pub from: DialogState,
    pub to: DialogState,
}

#[derive(Debug, Clone)]
pub struct TerminateEvent {
    pub key: DialogKey,
    pub reason: TerminateReason,
}

#[derive(Default)]
struct DialogCallbacks {
    state_change: CallbackList<dyn Fn(&StateChangeEvent) + Send + Sync>,
    body: CallbackList<dyn Fn(&Body) + Send + Sync>,
    request: CallbackList<dyn Fn(&rsip::Request) + Send + Sync>,
    terminate: CallbackList<dyn Fn(&TerminateEvent) + Send + Sync>,
}

/// The mutable attributes of a dialog other than its lifecycle state,
/// behind their own lock so state reads (e.g. `Dialog::state`) never wait on
/// route-set or CSeq updates (§5: state lock acquired before fields lock,
/// never the reverse).
struct DialogFields {
    local_uri: Uri,
    remote_uri: Uri,
    local_target: Uri,
    remote_target: Uri,
    route_set: Vec<Uri>,
    local_seq: u32,
    remote_seq: u32,
    invite_tx: Option<TransactionKey>,
    saved_invite_request: Option<Request>,
    refer_subscriptions: HashMap<SubscriptionId, ReferSubscription>,
    created_at: Instant,
    last_activity_at: Instant,
}

/// Shared services a live dialog needs to actually send something.
/// `Dialog::new_for_test` omits this, which is why every operation that
/// touches the network goes through [`Dialog::deps_or_err`].
pub struct DialogDeps {
    pub transactions: Arc<TransactionManager>,
    pub ids: Arc<IdGeneratorPool>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: Arc<StackConfig>,
}

pub struct Dialog {
    // Indexed by the registry outside of the state/fields lock pair, since
    // rekeying must be coordinated with which shard holds the Arc, not with
    // in-dialog request processing.
    key: parking_lot::RwLock<DialogKey>,
    role: Role,
    state: RwLock<DialogState>,
    fields: RwLock<DialogFields>,
    callbacks: DialogCallbacks,
    close_once: CloseOnce,
    deps: Option<Arc<DialogDeps>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dialog {
    pub fn new(key: DialogKey, role: Role, local_uri: Uri, remote_uri: Uri, deps: Arc<DialogDeps>) -> Self {
        let metrics = deps.metrics.clone();
        Self::build(key, role, local_uri, remote_uri, Some(deps), metrics)
    }

    /// Builds a dialog with no backing services — only state-machine and
    /// registry-indexing behavior is exercised. Used by the registry's own
    /// concurrency tests, which never call an operation that sends
    /// anything.
    #[cfg(test)]
    pub fn new_for_test(key: DialogKey, role: Role, local_uri: Uri, remote_uri: Uri, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::build(key, role, local_uri, remote_uri, None, metrics)
    }

    fn build(
        key: DialogKey,
        role: Role,
        local_uri: Uri,
        remote_uri: Uri,
        deps: Option<Arc<DialogDeps>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let now = Instant::now();
        Self {
            key: parking_lot::RwLock::new(key),
            role,
            state: RwLock::new(DialogState::Init),
            fields: RwLock::new(DialogFields {
                local_target: local_uri.clone(),
                remote_target: remote_uri.clone(),
                local_uri,
                remote_uri,
                route_set: Vec::new(),
                local_seq: 0,
                remote_seq: 0,
                invite_tx: None,
                saved_invite_request: None,
                refer_subscriptions: HashMap::new(),
                created_at: now,
                last_activity_at: now,
            }),
            callbacks: DialogCallbacks::default(),
            close_once: CloseOnce::new(),
            deps,
            metrics,
        }
    }

    pub fn key_snapshot(&self) -> DialogKey {
        self.key.read().clone()
    }

    pub fn set_key(&self, new_key: DialogKey) {
        *self.key.write() = new_key;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn state(&self) -> DialogState {
        *self.state.read().await
    }

    pub fn is_terminated(&self) -> bool {
        self.close_once.is_closed()
    }

    pub fn on_state_change(&self, callback: impl Fn(&StateChangeEvent) + Send + Sync + 'static) {
        self.callbacks.state_change.register(Arc::new(callback));
    }

    pub fn on_body(&self, callback: impl Fn(&Body) + Send + Sync + 'static) {
        self.callbacks.body.register(Arc::new(callback));
    }

    pub fn on_request(&self, callback: impl Fn(&rsip::Request) + Send + Sync + 'static) {
        self.callbacks.request.register(Arc::new(callback));
    }

    pub fn on_terminate(&self, callback: impl Fn(&TerminateEvent) + Send + Sync + 'static) {
        self.callbacks.terminate.register(Arc::new(callback));
    }

    fn deps_or_err(&self) -> DialogResult<&Arc<DialogDeps>> {
        self.deps.as_ref().ok_or_else(|| DialogError::protocol_error("dialog has no attached transport/transaction services"))
    }

    /// Applies a successful transition: updates `state`, fires the
    /// `NotifyStateChanged` effect's callback, and runs any other effects.
    /// `state` is written and released before callbacks run (§4.7).
    async fn apply(&self, event: DialogEvent) -> DialogResult<Vec<DialogEffect>> {
        self.apply_with_reason(event, None).await
    }

    /// Same as [`Dialog::apply`], but lets the caller supply the exact
    /// [`TerminateReason`] to fire instead of the one [`terminate_reason_for`]
    /// would infer from `event` alone — needed where one `DialogEvent`
    /// covers several distinct real-world causes (a timed-out INVITE and a
    /// rejected one both drive `RecvFailureInvite`).
    async fn apply_with_reason(&self, event: DialogEvent, reason_override: Option<TerminateReason>) -> DialogResult<Vec<DialogEffect>> {
        let mut state_guard = self.state.write().await;
        let (new_state, effects) = fsm::transition(self.role, *state_guard, event)?;
        let from = *state_guard;
        *state_guard = new_state;
        drop(state_guard);

        for effect in &effects {
            if let DialogEffect::NotifyStateChanged { from, to } = effect {
                let key = self.key_snapshot();
                self.callbacks.state_change.invoke_all(&StateChangeEvent { key, from: *from, to: *to }, self.metrics());
            }
        }

        if new_state == DialogState::Terminated {
            let reason = reason_override.unwrap_or_else(|| terminate_reason_for(from, new_state, event));
            self.fire_terminate(reason).await;
        }

        Ok(effects)
    }

    fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    /// Runs exactly once per dialog regardless of how many paths reach
    /// `Terminated` concurrently (the 2xx-to-BYE race against a transport
    /// timeout, say).
    async fn fire_terminate(&self, reason: TerminateReason) {
        let fired = self.close_once.fire(|| {});
        if !fired {
            return;
        }
        let key = self.key_snapshot();
        self.callbacks.terminate.invoke_all(&TerminateEvent { key, reason }, self.metrics());
        if let Some(deps) = &self.deps {
            deps.metrics.dialog_terminated();
        }
    }

    /// Forces the dialog straight to `Terminated` outside the normal FSM
    /// transition table, for paths with no further event to wait on (the
    /// BYE recipient's side, once it has answered; a failed/timed-out
    /// locally-sent BYE).
    async fn force_terminate(&self, reason: TerminateReason) {
        *self.state.write().await = DialogState::Terminated;
        self.fire_terminate(reason).await;
    }

    /// UAS: accepts a ringing INVITE with a 200 OK.
    pub async fn accept(&self, opts: ResponseOpts) -> DialogResult<()> {
        if self.role != Role::Uas {
            return Err(DialogError::invalid_state("accept", "Uas role", "Uac"));
        }
        let deps = self.deps_or_err()?.clone();
        let effects = self.apply(DialogEvent::Send2xxAccept).await?;

        let fields = self.fields.read().await;
        let request = fields.saved_invite_request.clone().ok_or_else(|| DialogError::protocol_error("no saved INVITE to accept"))?;
        let response = self.build_response(&fields, &request, StatusCode::OK, &opts);
        let invite_tx = fields.invite_tx.clone();
        drop(fields);

        if let Some(tx_key) = invite_tx {
            deps.transactions.respond(&tx_key, response).await?;
        }

        debug!(effects = ?effects, "dialog accepted");
        Ok(())
    }

    /// UAS: rejects a ringing INVITE with a failure response.
    pub async fn reject(&self, status: StatusCode, opts: ResponseOpts) -> DialogResult<()> {
        if self.role != Role::Uas {
            return Err(DialogError::invalid_state("reject", "Uas role", "Uac"));
        }
        let deps = self.deps_or_err()?.clone();
        self.apply(DialogEvent::SendFailureReject).await?;

        let fields = self.fields.read().await;
        let request = fields.saved_invite_request.clone().ok_or_else(|| DialogError::protocol_error("no saved INVITE to reject"))?;
        let response = self.build_response(&fields, &request, status, &opts);
        let invite_tx = fields.invite_tx.clone();
        drop(fields);

        if let Some(tx_key) = invite_tx {
            deps.transactions.respond(&tx_key, response).await?;
        }
        Ok(())
    }

    /// Sends BYE, valid only once `Established`. Reaches `Terminating`
    /// immediately but not `Terminated` — that waits for the BYE transaction
    /// to actually complete. Returns the transaction's key and event stream;
    /// the caller owns draining it into
    /// [`Dialog::handle_bye_transaction_event`], same reasoning as
    /// [`Dialog::start_invite`].
    pub async fn bye(&self) -> DialogResult<(TransactionKey, mpsc::Receiver<TransactionEvent>)> {
        let deps = self.deps_or_err()?.clone();
        self.apply(DialogEvent::SendBye).await?;

        let request = self.make_request(Method::Bye, None).await?;
        let destination = resolve_destination(&self.fields.read().await.remote_target)?;
        let (tx_key, events) = deps.transactions.submit(request, destination)?;
        Ok((tx_key, events))
    }

    /// Drives the dialog off the locally-sent BYE transaction's outcome: a
    /// 2xx reaches `Terminated` through the normal FSM table
    /// (`Terminating` --2xx--> `Terminated`); anything else ends the dialog
    /// locally since there's no further event to wait for on a failed BYE.
    pub async fn handle_bye_transaction_event(&self, key: &TransactionKey, event: TransactionEvent) -> DialogResult<()> {
        trace_bye_event(key, &event);
        match event {
            TransactionEvent::Success(_) => {
                self.apply(DialogEvent::Recv2xxBye).await?;
            }
            TransactionEvent::Failure(_) | TransactionEvent::Timeout | TransactionEvent::TransportFailure(_) => {
                self.force_terminate(TerminateReason::LocalBye).await;
            }
            TransactionEvent::Provisional(_) | TransactionEvent::AckReceived | TransactionEvent::Terminated => {}
        }
        Ok(())
    }

    /// UAC: sends CANCEL for an outgoing INVITE still in `Trying` or
    /// `Ringing` (RFC 3261 §9). The dialog terminates once the INVITE
    /// transaction's 487 arrives, not immediately — `handle_invite_transaction_event`
    /// drives that half of the transition.
    pub async fn cancel(&self) -> DialogResult<()> {
        if self.role != Role::Uac {
            return Err(DialogError::invalid_state("cancel", "Uac role", "Uas"));
        }
        let deps = self.deps_or_err()?.clone();
        self.apply(DialogEvent::SendCancel).await?;

        let invite_tx = self.fields.read().await.invite_tx.clone();
        let tx_key = invite_tx.ok_or_else(|| DialogError::protocol_error("no outgoing INVITE transaction to cancel"))?;

        let request = self.make_cancel_request(&tx_key).await?;
        let destination = resolve_destination(&self.fields.read().await.remote_target)?;
        deps.transactions.submit(request, destination)?;
        Ok(())
    }

    /// A CANCEL shares the Call-ID/From/To/branch of the INVITE it cancels
    /// but carries its own CSeq with the INVITE's sequence number and the
    /// CANCEL method, and no Contact/Route headers of its own (RFC 3261
    /// §9.1).
    async fn make_cancel_request(&self, invite_tx: &TransactionKey) -> DialogResult<Request> {
        let fields = self.fields.read().await;
        let invite = fields.saved_invite_request.clone();
        let local_uri = fields.local_uri.clone();
        let remote_uri = fields.remote_uri.clone();
        drop(fields);

        let key = self.key_snapshot();
        let config = self.deps_or_err()?.config.clone();
        let mut headers = rsip::Headers::default();
        headers.push(Header::CallId(key.call_id.clone().into()));
        headers.push(Header::From(format!("<{local_uri}>;tag={}", key.local_tag).into()));
        headers.push(Header::To(format!("<{remote_uri}>").into()));
        headers.push(Header::Via(format!("SIP/2.0/UDP {};branch={}", config.local_host_port.0, invite_tx.branch).into()));
        let seq = invite.as_ref().and_then(|r| r.cseq_header().ok()).and_then(|c| c.seq().ok()).unwrap_or(0);
        headers.push(Header::CSeq(CSeq { seq, method: Method::Cancel }.into()));
        headers.push(Header::MaxForwards((config.max_forwards as u32).into()));

        let uri = invite.map(|r| r.uri).ok_or_else(|| DialogError::protocol_error("no saved INVITE to cancel"))?;
        Ok(Request { method: Method::Cancel, uri, headers, body: Vec::new(), version: rsip::Version::V2 })
    }

    /// Tears the dialog down locally without sending BYE (e.g. the
    /// application is discarding state after a fatal transport error).
    /// Idempotent via `close_once`.
    pub async fn close(&self) {
        let fired = self.close_once.fire(|| {});
        if fired {
            let mut state_guard = self.state.write().await;
            *state_guard = DialogState::Terminated;
            drop(state_guard);
            let key = self.key_snapshot();
            self.callbacks.terminate.invoke_all(&TerminateEvent { key, reason: TerminateReason::Closed }, self.metrics());
        }
    }

    /// Sends a re-INVITE, valid only in `Established`. Unlike the initial
    /// INVITE, a re-INVITE never moves the dialog off `Established` — its
    /// transaction's outcome only matters for updating `remote_target` from
    /// the eventual 2xx's Contact, via
    /// [`Dialog::handle_reinvite_transaction_event`]. Returns the
    /// transaction's key and event stream for the caller to drain, same
    /// reasoning as [`Dialog::start_invite`].
    pub async fn reinvite(&self, opts: InviteOpts) -> DialogResult<(TransactionKey, mpsc::Receiver<TransactionEvent>)> {
        let deps = self.deps_or_err()?.clone();
        let state = *self.state.read().await;
        if state != DialogState::Established {
            return Err(DialogError::invalid_state("reinvite", "Established", state.name()));
        }
        let body = opts.body.clone();
        let request = self.make_request_with_opts(Method::Invite, body, Some(&opts)).await?;
        let destination = resolve_destination(&self.fields.read().await.remote_target)?;
        let (tx_key, events) = deps.transactions.submit(request, destination)?;
        self.fields.write().await.invite_tx = Some(tx_key.clone());
        Ok((tx_key, events))
    }

    /// Drives a re-INVITE's transaction outcome. A 2xx's Contact is a
    /// target refresh (RFC 3261 §12.2.1.1) just like an incoming re-INVITE's;
    /// there's no FSM transition here since the dialog was already
    /// `Established` and stays there regardless of how the re-INVITE lands.
    pub async fn handle_reinvite_transaction_event(&self, event: TransactionEvent) -> DialogResult<()> {
        if let TransactionEvent::Success(response) = event {
            let contact = response.contact_header().ok().and_then(|h| h.typed().ok()).map(|c| c.uri);
            if let Some(uri) = contact {
                self.fields.write().await.remote_target = uri;
            }
        }
        Ok(())
    }

    /// Sends a REFER asking the remote party to contact `target`. Returns
    /// the subscription id plus the REFER transaction's key and event
    /// stream for the caller to drain into
    /// [`Dialog::handle_refer_transaction_event`] — same split as
    /// [`Dialog::bye`].
    pub async fn refer(&self, target: Uri) -> DialogResult<(SubscriptionId, TransactionKey, mpsc::Receiver<TransactionEvent>)> {
        self.refer_internal(target, None).await
    }

    /// Sends a REFER for an attended transfer: `target` with a `Replaces`
    /// header pointing at the dialog being replaced.
    pub async fn refer_replace(&self, opts: ReferReplaceTarget) -> DialogResult<(SubscriptionId, TransactionKey, mpsc::Receiver<TransactionEvent>)> {
        self.refer_internal(opts.target, Some(opts.replaces)).await
    }

    async fn refer_internal(&self, target: Uri, replaces: Option<ReplacesInfo>) -> DialogResult<(SubscriptionId, TransactionKey, mpsc::Receiver<TransactionEvent>)> {
        let deps = self.deps_or_err()?.clone();
        let state = *self.state.read().await;
        if state != DialogState::Established {
            return Err(DialogError::invalid_state("refer", "Established", state.name()));
        }

        let refer_to_value = match &replaces {
            Some(replaces) => refer::build_refer_to_with_replaces(&target, replaces),
            None => target.to_string(),
        };
        let header = Header::Other("Refer-To".into(), format!("<{refer_to_value}>"));
        let mut request = self.make_request(Method::Refer, None).await?;
        request.headers.push(header);

        let local_tag = self.key_snapshot().local_tag;
        let remote_tag = self.key_snapshot().remote_tag;
        let cseq_of_refer = request.cseq_header().ok().and_then(|h| h.seq().ok()).unwrap_or(0);
        let id = SubscriptionId::new(local_tag, remote_tag, cseq_of_refer);
        let subscription = ReferSubscription::new(id.clone(), target, replaces, deps.config.refer_subscription_expiry);

        self.fields.write().await.refer_subscriptions.insert(id.clone(), subscription);

        let destination = resolve_destination(&self.fields.read().await.remote_target)?;
        let (tx_key, events) = deps.transactions.submit(request, destination)?;
        Ok((id, tx_key, events))
    }

    /// Drives the outgoing REFER's own transaction outcome: a 2xx moves the
    /// subscription to `Accepted` (§4.6 "on 2xx to REFER"), anything else
    /// fails it outright since there will be no NOTIFYs to watch for.
    pub async fn handle_refer_transaction_event(&self, id: &SubscriptionId, event: TransactionEvent) {
        match event {
            TransactionEvent::Success(_) => self.update_refer_subscription(id, ReferStatus::Accepted).await,
            TransactionEvent::Failure(_) | TransactionEvent::Timeout | TransactionEvent::TransportFailure(_) => {
                self.update_refer_subscription(id, ReferStatus::Failed).await;
            }
            TransactionEvent::Provisional(_) | TransactionEvent::AckReceived | TransactionEvent::Terminated => {}
        }
    }

    pub async fn refer_subscription_status(&self, id: &SubscriptionId) -> Option<ReferStatus> {
        self.fields.read().await.refer_subscriptions.get(id).map(|s| s.status())
    }

    pub(crate) async fn update_refer_subscription(&self, id: &SubscriptionId, status: ReferStatus) {
        if let Some(subscription) = self.fields.write().await.refer_subscriptions.get_mut(id) {
            subscription.update_status(status);
        }
    }

    /// Validates and accepts an incoming REFER (§4.6 "Incoming REFER"): a
    /// missing or malformed `Refer-To` (or a malformed `Replaces` nested in
    /// it) is the caller's cue to answer 400 instead of 202. On success,
    /// seeds the local subscription the caller then reports progress
    /// through via `update_refer_subscription`/`send_refer_notify`.
    pub async fn receive_refer(&self, request: &Request) -> DialogResult<(SubscriptionId, Uri, Option<ReplacesInfo>)> {
        let deps = self.deps_or_err()?.clone();
        let state = *self.state.read().await;
        if state != DialogState::Established {
            return Err(DialogError::invalid_state("receive_refer", "Established", state.name()));
        }

        let raw = other_header_value(request, "Refer-To").ok_or_else(|| DialogError::protocol_error("REFER missing Refer-To"))?;
        let (target, replaces) = refer::parse_refer_to(&raw)?;

        let cseq_of_refer = request.cseq_header().ok().and_then(|h| h.seq().ok()).unwrap_or(0);
        let key = self.key_snapshot();
        let id = SubscriptionId::new(key.local_tag, key.remote_tag, cseq_of_refer);
        let mut subscription = ReferSubscription::new(id.clone(), target.clone(), replaces.clone(), deps.config.refer_subscription_expiry);
        subscription.update_status(ReferStatus::Trying);
        self.fields.write().await.refer_subscriptions.insert(id.clone(), subscription);
        Ok((id, target, replaces))
    }

    /// Sends a NOTIFY reporting `body`'s sipfrag status for `id`'s
    /// subscription (§4.6, RFC 3515 §2.4.4). `terminated` picks between
    /// `Subscription-State: active;expires=N` and
    /// `...terminated;reason=noresource`; the caller is responsible for
    /// also moving the subscription to its terminal status when it sends a
    /// terminating NOTIFY.
    pub async fn send_refer_notify(&self, id: &SubscriptionId, body: Body, terminated: bool) -> DialogResult<()> {
        let deps = self.deps_or_err()?.clone();
        let subscription_state = if terminated {
            "terminated;reason=noresource".to_string()
        } else {
            format!("active;expires={}", deps.config.refer_subscription_expiry.as_secs())
        };
        let mut request = self.make_request(Method::Notify, Some(body)).await?;
        request.headers.push(Header::Other("Event".into(), format!("refer;id={}", id.cseq_of_refer)));
        request.headers.push(Header::Other("Subscription-State".into(), subscription_state));
        let destination = resolve_destination(&self.fields.read().await.remote_target)?;
        deps.transactions.submit(request, destination)?;
        Ok(())
    }

    /// Processes an incoming NOTIFY for one of our own outgoing REFERs
    /// (§4.6 "Each received NOTIFY..."): parses the sipfrag status line and
    /// advances the matching subscription, mapping `100 Trying -> Trying`,
    /// other `1xx -> Proceeding`, `2xx -> Success`, anything else ->
    /// `Failed`. A `Subscription-State: terminated` also ends it outright.
    /// Silently ignored if it doesn't match a subscription we're tracking —
    /// this can't reject with an error response since NOTIFY always gets a
    /// plain 200 per RFC 6665.
    pub async fn handle_incoming_notify(&self, request: &Request) {
        let cseq_of_refer = other_header_value(request, "Event").and_then(|event| {
            event.split(';').find_map(|param| param.trim().strip_prefix("id=")).and_then(|id| id.parse::<u32>().ok())
        });
        let Some(cseq_of_refer) = cseq_of_refer else { return };
        let key = self.key_snapshot();
        let id = SubscriptionId::new(key.local_tag, key.remote_tag, cseq_of_refer);

        let terminated_by_header = other_header_value(request, "Subscription-State").is_some_and(|s| s.split(';').next().is_some_and(|state| state.trim().eq_ignore_ascii_case("terminated")));

        let status = if request.body.is_empty() {
            None
        } else {
            refer::sipfrag::parse_status(&Body::new(content_type_header(request), request.body.clone())).ok()
        };

        let new_status = match status {
            Some(100) => Some(ReferStatus::Trying),
            Some(code) if (100..200).contains(&code) => Some(ReferStatus::Proceeding),
            Some(code) if (200..300).contains(&code) => Some(ReferStatus::Success),
            Some(_) => Some(ReferStatus::Failed),
            None if terminated_by_header => Some(ReferStatus::Failed),
            None => None,
        };

        if let Some(new_status) = new_status {
            self.update_refer_subscription(&id, new_status).await;
        }
    }

    /// Builds an in-dialog request: Call-ID/From/To/Route/Contact/Max-Forwards
    /// per the stored dialog fields, incrementing `local_seq` (ACK/CANCEL
    /// reuse the originating request's CSeq and go through their own paths,
    /// not this helper).
    async fn make_request(&self, method: Method, body: Option<Body>) -> DialogResult<Request> {
        self.make_request_with_opts(method, body, None).await
    }

    /// Builds an in-dialog request. `invite_opts` carries the
    /// application-facing overrides spec.md §6 calls out for
    /// INVITE/re-INVITE (`From` display name, `Contact` parameters,
    /// `Subject`, `User-Agent`, `P-Asserted-Identity`, extra headers); every
    /// other method goes through the plain [`Dialog::make_request`] with
    /// `None`, since only [`InviteOpts`] exists for this.
    async fn make_request_with_opts(&self, method: Method, body: Option<Body>, invite_opts: Option<&InviteOpts>) -> DialogResult<Request> {
        let deps = self.deps_or_err()?;
        let mut fields = self.fields.write().await;
        fields.local_seq += 1;
        fields.last_activity_at = Instant::now();
        let cseq = fields.local_seq;

        let key = self.key_snapshot();
        let branch = deps.ids.get_branch(deps.metrics.as_ref());

        let mut headers = rsip::Headers::default();
        headers.push(Header::CallId(key.call_id.clone().into()));
        let from_display = invite_opts.and_then(|o| o.from_display_name.as_deref());
        headers.push(Header::From(format_tagged_party(from_display, &fields.local_uri, &key.local_tag).into()));
        headers.push(Header::To(format!("<{}>;tag={}", fields.remote_uri, key.remote_tag).into()));
        headers.push(Header::CSeq(CSeq { seq: cseq, method }.into()));
        headers.push(Header::Via(format!("SIP/2.0/UDP {};branch={}", deps.config.local_host_port.0, branch).into()));
        let contact_params = invite_opts.map(|o| &o.contact_params);
        headers.push(Header::Contact(format_contact(&fields.local_target, contact_params).into()));
        headers.push(Header::MaxForwards((deps.config.max_forwards as u32).into()));
        let user_agent = invite_opts.and_then(|o| o.user_agent.as_deref()).or(deps.config.user_agent.as_deref());
        if let Some(ua) = user_agent {
            headers.push(Header::UserAgent(ua.to_string().into()));
        }
        if let Some(opts) = invite_opts {
            if let Some(subject) = &opts.subject {
                headers.push(Header::Other("Subject".into(), subject.clone()));
            }
            if let Some(pai) = &opts.p_asserted_identity {
                headers.push(Header::Other("P-Asserted-Identity".into(), format!("<{pai}>")));
            }
            for header in &opts.extra_headers {
                headers.push(header.clone());
            }
        }
        for route in &fields.route_set {
            headers.push(Header::Route(format!("<{route}>").into()));
        }

        let body_bytes = match &body {
            Some(b) => {
                headers.push(Header::ContentType(b.content_type.clone().into()));
                headers.push(Header::ContentLength((b.bytes.len() as u32).into()));
                b.bytes.to_vec()
            }
            None => Vec::new(),
        };

        let target_uri = fields.route_set.first().cloned().unwrap_or_else(|| fields.remote_target.clone());

        Ok(Request { method, uri: target_uri, headers, body: body_bytes, version: rsip::Version::V2 })
    }

    fn build_response(&self, fields: &DialogFields, request: &Request, status: StatusCode, opts: &ResponseOpts) -> Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(via) => headers.push(Header::Via(via.clone())),
                Header::From(from) => headers.push(Header::From(from.clone())),
                Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
                Header::CSeq(cseq) => headers.push(Header::CSeq(cseq.clone())),
                Header::To(to) => {
                    let tagged = match to.clone().typed() {
                        Ok(mut typed) => {
                            if !typed.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                                typed.params.push(Param::Tag(self.key_snapshot().local_tag.into()));
                            }
                            typed.into()
                        }
                        Err(_) => to.clone(),
                    };
                    headers.push(Header::To(tagged));
                }
                _ => {}
            }
        }
        headers.push(Header::Contact(format_contact(&fields.local_target, Some(&opts.contact_params)).into()));
        if let Some(ua) = &opts.user_agent {
            headers.push(Header::UserAgent(ua.clone().into()));
        }
        if let Some(pai) = &opts.p_asserted_identity {
            headers.push(Header::Other("P-Asserted-Identity".into(), format!("<{pai}>")));
        }
        for header in &opts.extra_headers {
            headers.push(header.clone());
        }
        let body_bytes = opts.body.as_ref().map(|b| b.bytes.to_vec()).unwrap_or_default();
        if !body_bytes.is_empty() {
            headers.push(Header::ContentLength((body_bytes.len() as u32).into()));
        }
        Response { status_code: status, headers, body: body_bytes, version: request.version().clone() }
    }

    /// Starts a brand-new outgoing INVITE, valid only from `Init`. Returns
    /// the client transaction's key and its event stream; the caller (the
    /// stack) owns draining that stream into
    /// [`Dialog::handle_invite_transaction_event`], since doing so from
    /// inside `Dialog` would need a `'static` `Arc<Self>` this method
    /// doesn't have.
    pub async fn start_invite(&self, opts: InviteOpts) -> DialogResult<(TransactionKey, mpsc::Receiver<TransactionEvent>)> {
        if self.role != Role::Uac {
            return Err(DialogError::invalid_state("start_invite", "Uac role", "Uas"));
        }
        let deps = self.deps_or_err()?.clone();
        self.apply(DialogEvent::SendInvite).await?;

        let body = opts.body.clone();
        let request = self.make_request_with_opts(Method::Invite, body, Some(&opts)).await?;
        let destination = resolve_destination(&self.fields.read().await.remote_target)?;
        let (tx_key, events) = deps.transactions.submit(request, destination)?;
        deps.transactions.set_owning_dialog(&tx_key, self.key_snapshot());
        self.fields.write().await.invite_tx = Some(tx_key.clone());
        Ok((tx_key, events))
    }

    /// Records a brand-new incoming INVITE's server transaction and applies
    /// `RecvInvite`, valid only from `Init`. Called by the stack right after
    /// constructing a fresh UAS dialog for this request.
    pub async fn receive_invite(&self, request: Request, transaction: TransactionKey) -> DialogResult<()> {
        if self.role != Role::Uas {
            return Err(DialogError::invalid_state("receive_invite", "Uas role", "Uac"));
        }
        self.apply(DialogEvent::RecvInvite).await?;
        let route_set = record_route_set_from_request(&request);
        let remote_seq = request.cseq_header().ok().and_then(|h| h.seq().ok()).unwrap_or(0);
        let mut fields = self.fields.write().await;
        fields.route_set = route_set;
        fields.remote_seq = remote_seq;
        fields.saved_invite_request = Some(request);
        fields.invite_tx = Some(transaction);
        Ok(())
    }

    /// A failed/timed-out/transport-failed INVITE transaction means
    /// different things depending on whether we're mid-CANCEL: ordinarily
    /// it's `RecvFailureInvite`, but once `cancel()` has moved the dialog to
    /// `Cancelling`, the FSM only has a row for the cancel-specific event.
    /// The caller's `natural_reason` (what actually happened on the wire) is
    /// only used outside that race — once we've asked to cancel, the dialog
    /// ends because of the cancellation, not because of whatever the INVITE
    /// transaction happened to report on its way out.
    async fn invite_failure_outcome(&self, natural_reason: TerminateReason) -> (DialogEvent, TerminateReason) {
        if *self.state.read().await == DialogState::Cancelling {
            (DialogEvent::Recv487ToCancelledInvite, TerminateReason::Cancelled)
        } else {
            (DialogEvent::RecvFailureInvite, natural_reason)
        }
    }

    /// Called by the stack's routing layer when the saved INVITE's
    /// transaction reports progress; drives UAC-side dialog state off
    /// transaction events instead of raw messages.
    pub async fn handle_invite_transaction_event(&self, event: TransactionEvent) -> DialogResult<()> {
        match event {
            TransactionEvent::Provisional(_) => {
                self.apply(DialogEvent::RecvProvisional).await?;
            }
            TransactionEvent::Success(response) => {
                let tags = extract_to_tag(&response);
                if let Some(tag) = tags {
                    let old_key = self.key_snapshot();
                    if old_key.remote_tag.is_empty() {
                        self.set_key(DialogKey::new(old_key.call_id, old_key.local_tag, tag));
                    }
                }
                let contact = response.contact_header().ok().and_then(|h| h.typed().ok()).map(|c| c.uri);
                {
                    let mut fields = self.fields.write().await;
                    fields.route_set = record_route_set_from_response(&response);
                    if let Some(uri) = contact {
                        fields.remote_target = uri;
                    }
                }
                self.apply(DialogEvent::Recv2xxInvite).await?;
            }
            TransactionEvent::Failure(response) => {
                warn!(status = %response.status_code, "INVITE failed");
                let status = response.status_code.code();
                let (event, reason) = self.invite_failure_outcome(TerminateReason::Rejected { status }).await;
                self.apply_with_reason(event, Some(reason)).await?;
            }
            TransactionEvent::Timeout => {
                let (event, reason) = self.invite_failure_outcome(TerminateReason::Timeout).await;
                self.apply_with_reason(event, Some(reason)).await?;
            }
            TransactionEvent::TransportFailure(detail) => {
                warn!(detail, "transport failure on INVITE transaction");
                let (event, reason) = self.invite_failure_outcome(TerminateReason::TransportFailure).await;
                self.apply_with_reason(event, Some(reason)).await?;
            }
            TransactionEvent::AckReceived | TransactionEvent::Terminated => {}
        }
        Ok(())
    }

    /// Called when the remote party sends BYE for this dialog. There's no
    /// further event to wait for once we've decided to answer it, so this
    /// goes straight to `Terminated` rather than waiting in `Terminating`
    /// the way the BYE-sending side does.
    pub async fn handle_incoming_bye(&self) -> DialogResult<()> {
        self.apply(DialogEvent::RecvBye).await?;
        self.force_terminate(TerminateReason::RemoteBye).await;
        Ok(())
    }

    /// UAS: the remote party CANCELled our still-ringing INVITE (RFC 3261
    /// §9.2). The FSM transition itself reaches `Terminated`, since there's
    /// nothing left to wait for once the caller has given up; this also
    /// answers the saved INVITE transaction with a 487 so it stops
    /// retransmitting its provisional response.
    pub async fn handle_incoming_cancel(&self) -> DialogResult<()> {
        self.apply(DialogEvent::RecvCancel).await?;

        let deps = self.deps_or_err()?.clone();
        let (invite_tx, invite_request) = {
            let fields = self.fields.read().await;
            (fields.invite_tx.clone(), fields.saved_invite_request.clone())
        };
        if let (Some(tx_key), Some(invite_request)) = (invite_tx, invite_request) {
            let fields = self.fields.read().await;
            let response = self.build_response(&fields, &invite_request, StatusCode::RequestTerminated, &ResponseOpts::default());
            drop(fields);
            deps.transactions.respond(&tx_key, response).await?;
        }
        Ok(())
    }

    /// Builds an in-dialog response carrying our own Contact, for the stack
    /// to send back through the request's transaction. Target-refresh
    /// requests (re-INVITE) need this rather than a bare header copy, since
    /// the remote party updates its own `remote_target` from this Contact.
    pub async fn build_in_dialog_response(&self, request: &Request, status: StatusCode, opts: &ResponseOpts) -> Response {
        let fields = self.fields.read().await;
        self.build_response(&fields, request, status, opts)
    }

    /// RFC 3261 §12.2.2: an in-dialog request (other than ACK, which reuses
    /// its INVITE's CSeq) whose CSeq is not strictly greater than
    /// `remote_seq` is a retransmission or an out-of-order/reordered
    /// request and must be rejected with 500 rather than processed.
    /// Admits the request and advances `remote_seq` otherwise.
    pub async fn admit_remote_cseq(&self, request: &Request) -> bool {
        let Some(cseq) = request.cseq_header().ok().and_then(|h| h.seq().ok()) else {
            return false;
        };
        let mut fields = self.fields.write().await;
        if cseq <= fields.remote_seq {
            return false;
        }
        fields.remote_seq = cseq;
        true
    }

    /// Updates `remote_target` from an incoming re-INVITE's Contact header
    /// (RFC 3261 §12.2.1.1 target refresh). A no-op if the request carries
    /// no Contact.
    pub async fn apply_target_refresh(&self, request: &Request) {
        if let Some(contact) = request.contact_header().ok().and_then(|h| h.typed().ok()) {
            self.fields.write().await.remote_target = contact.uri;
        }
    }

    /// Delivers an in-dialog request's body to application callbacks
    /// without interpreting it (SDP negotiation is out of scope).
    pub fn notify_body(&self, body: &Body) {
        self.callbacks.body.invoke_all(body, self.metrics());
    }

    pub fn notify_request(&self, request: &rsip::Request) {
        self.callbacks.request.invoke_all(request, self.metrics());
    }
}

fn terminate_reason_for(_from: DialogState, _to: DialogState, event: DialogEvent) -> TerminateReason {
    match event {
        DialogEvent::RecvFailureInvite => TerminateReason::Rejected { status: 0 },
        DialogEvent::Recv487ToCancelledInvite | DialogEvent::RecvCancel => TerminateReason::Cancelled,
        DialogEvent::SendBye | DialogEvent::RecvBye | DialogEvent::Recv2xxBye => TerminateReason::RemoteBye,
        _ => TerminateReason::Closed,
    }
}

/// RFC 3261 §12.1.1: the UAS's route set is the Record-Route headers in the
/// order they appear on the request.
fn record_route_set_from_request(request: &Request) -> Vec<Uri> {
    request.headers.iter().filter_map(record_route_uri).collect()
}

/// RFC 3261 §12.1.2: the UAC's route set is the Record-Route headers in
/// *reverse* order, since the UAS sees them top-to-bottom as added but the
/// UAC must route back through them bottom-to-top.
fn record_route_set_from_response(response: &Response) -> Vec<Uri> {
    let mut routes: Vec<Uri> = response.headers.iter().filter_map(record_route_uri).collect();
    routes.reverse();
    routes
}

fn record_route_uri(header: &Header) -> Option<Uri> {
    match header {
        Header::RecordRoute(rr) => {
            let raw = rr.value();
            let trimmed = raw.trim().trim_start_matches('<');
            let bare = trimmed.split('>').next().unwrap_or(trimmed);
            Uri::try_from(bare).ok()
        }
        _ => None,
    }
}

fn extract_to_tag(response: &Response) -> Option<String> {
    let to = response.to_header().ok()?.typed().ok()?;
    to.params.iter().find_map(|p| match p {
        Param::Tag(tag) => Some(tag.to_string()),
        _ => None,
    })
}

/// Looks up an extension header `rsip` has no typed variant for (`Refer-To`,
/// `Event`, `Subscription-State`), case-insensitively by name.
fn other_header_value(request: &Request, name: &str) -> Option<String> {
    request.headers.iter().find_map(|h| match h {
        Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.clone()),
        _ => None,
    })
}

/// Renders a `From`/`To`-shaped header value, optionally with a quoted
/// display name ahead of the `<uri>` — RFC 3261 §20.10's `name-addr` form.
fn format_tagged_party(display_name: Option<&str>, uri: &Uri, tag: &str) -> String {
    match display_name {
        Some(name) => format!("\"{name}\" <{uri}>;tag={tag}"),
        None => format!("<{uri}>;tag={tag}"),
    }
}

/// Renders a `Contact` header value, appending each of `params` as a
/// `;name` or `;name=value` parameter (a `None` value means a bare flag).
fn format_contact(uri: &Uri, params: Option<&std::collections::HashMap<String, Option<String>>>) -> String {
    let mut value = format!("<{uri}>");
    if let Some(params) = params {
        for (name, val) in params {
            match val {
                Some(val) => value.push_str(&format!(";{name}={val}")),
                None => value.push_str(&format!(";{name}")),
            }
        }
    }
    value
}

fn content_type_header(request: &Request) -> String {
    request
        .headers
        .iter()
        .find_map(|h| match h {
            Header::ContentType(ct) => Some(ct.value().to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn resolve_destination(uri: &Uri) -> DialogResult<SocketAddr> {
    let host = uri.host_with_port.host.to_string();
    let port = uri.host_with_port.port.as_ref().map(|p| u16::from(p.clone())).unwrap_or(5060);
    SocketAddr::from_str(&format!("{host}:{port}"))
        .map_err(|_| DialogError::protocol_error(format!("cannot resolve {uri} to a socket address without DNS (out of scope)")))
}

fn trace_bye_event(key: &TransactionKey, event: &TransactionEvent) {
    match event {
        TransactionEvent::Success(_) => info!(transaction = %key, "BYE acknowledged"),
        TransactionEvent::Failure(response) => warn!(transaction = %key, status = %response.status_code, "BYE failed"),
        TransactionEvent::Timeout => warn!(transaction = %key, "BYE timed out"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopMetricsSink;

    fn dialog(role: Role) -> Dialog {
        let key = DialogKey::new("call-1", "local-tag", "");
        let local = Uri::try_from("sip:alice@127.0.0.1:5060").unwrap();
        let remote = Uri::try_from("sip:bob@127.0.0.1:5061").unwrap();
        Dialog::new_for_test(key, role, local, remote, Arc::new(NoopMetricsSink::default()))
    }

    #[tokio::test]
    async fn new_dialog_starts_in_init() {
        let d = dialog(Role::Uac);
        assert_eq!(d.state().await, DialogState::Init);
    }

    #[tokio::test]
    async fn bye_without_deps_fails_not_panics() {
        let d = dialog(Role::Uac);
        // Established is required anyway, but this also exercises the
        // deps_or_err path before any FSM transition runs.
        let err = d.bye().await.unwrap_err();
        assert!(matches!(err, DialogError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_terminate_once() {
        let d = dialog(Role::Uac);
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        d.on_terminate(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        d.close().await;
        d.close().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(d.state().await, DialogState::Terminated);
    }

    #[tokio::test]
    async fn key_rekey_updates_snapshot() {
        let d = dialog(Role::Uas);
        let old = d.key_snapshot();
        assert!(old.remote_tag.is_empty());
        d.set_key(DialogKey::new(old.call_id.clone(), old.local_tag.clone(), "remote-tag"));
        assert_eq!(d.key_snapshot().remote_tag, "remote-tag");
    }

    fn request_with_contact(contact_uri: &str) -> Request {
        let mut headers = Headers::default();
        headers.push(Header::Via("SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bK-reinvite".into()));
        headers.push(Header::From("<sip:alice@127.0.0.1:5060>;tag=local-tag".into()));
        headers.push(Header::To("<sip:bob@127.0.0.1:5061>;tag=remote-tag".into()));
        headers.push(Header::CallId("call-1".into()));
        headers.push(Header::CSeq(rsip::typed::CSeq { seq: 2, method: Method::Invite }.into()));
        headers.push(Header::Contact(format!("<{contact_uri}>").into()));
        Request { method: Method::Invite, uri: Uri::try_from("sip:bob@127.0.0.1:5061").unwrap(), headers, body: Vec::new(), version: rsip::Version::V2 }
    }

    #[tokio::test]
    async fn incoming_reinvite_refreshes_remote_target() {
        let d = dialog(Role::Uas);
        let request = request_with_contact("sip:bob@127.0.0.1:6000");
        d.apply_target_refresh(&request).await;
        assert_eq!(d.fields.read().await.remote_target.to_string(), "sip:bob@127.0.0.1:6000");
    }

    #[tokio::test]
    async fn reinvite_success_event_refreshes_remote_target() {
        let d = dialog(Role::Uac);
        let request = request_with_contact("sip:alice@127.0.0.1:7000");
        let response = Response {
            status_code: StatusCode::OK,
            headers: request.headers.clone(),
            body: Vec::new(),
            version: rsip::Version::V2,
        };
        d.handle_reinvite_transaction_event(TransactionEvent::Success(response)).await.unwrap();
        assert_eq!(d.fields.read().await.remote_target.to_string(), "sip:alice@127.0.0.1:7000");
    }

    async fn established_uas() -> Dialog {
        let d = dialog(Role::Uas);
        d.apply(DialogEvent::RecvInvite).await.unwrap();
        d.apply(DialogEvent::Send2xxAccept).await.unwrap();
        d
    }

    fn request_with_refer_to(refer_to: &str) -> Request {
        let mut headers = Headers::default();
        headers.push(Header::Via("SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bK-refer".into()));
        headers.push(Header::From("<sip:bob@127.0.0.1:5061>;tag=remote-tag".into()));
        headers.push(Header::To("<sip:alice@127.0.0.1:5060>;tag=local-tag".into()));
        headers.push(Header::CallId("call-1".into()));
        headers.push(Header::CSeq(rsip::typed::CSeq { seq: 3, method: Method::Refer }.into()));
        headers.push(Header::Other("Refer-To".into(), refer_to.to_string()));
        Request { method: Method::Refer, uri: Uri::try_from("sip:alice@127.0.0.1:5060").unwrap(), headers, body: Vec::new(), version: rsip::Version::V2 }
    }

    #[tokio::test]
    async fn receive_refer_accepts_a_well_formed_refer_to() {
        let d = established_uas().await;
        let request = request_with_refer_to("<sip:carol@127.0.0.1:5062>");
        let (_id, target, replaces) = d.receive_refer(&request).await.unwrap();
        assert_eq!(target.to_string(), "sip:carol@127.0.0.1:5062");
        assert!(replaces.is_none());
    }

    #[tokio::test]
    async fn receive_refer_rejects_a_malformed_refer_to() {
        let d = established_uas().await;
        // Not a valid SIP URI at all — this is the "attacker sends garbage"
        // and "buggy peer" case the 400 response path exists for.
        let request = request_with_refer_to("not a uri");
        let err = d.receive_refer(&request).await.unwrap_err();
        assert!(matches!(err, DialogError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn receive_refer_rejects_a_request_with_no_refer_to_header() {
        let d = established_uas().await;
        let mut request = request_with_refer_to("<sip:carol@127.0.0.1:5062>");
        request.headers.retain(|h| !matches!(h, Header::Other(name, _) if name.eq_ignore_ascii_case("Refer-To")));
        let err = d.receive_refer(&request).await.unwrap_err();
        assert!(matches!(err, DialogError::ProtocolViolation { .. }));
    }

    fn request_with_cseq(seq: u32) -> Request {
        let mut headers = Headers::default();
        headers.push(Header::Via("SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bK-bye".into()));
        headers.push(Header::From("<sip:bob@127.0.0.1:5061>;tag=remote-tag".into()));
        headers.push(Header::To("<sip:alice@127.0.0.1:5060>;tag=local-tag".into()));
        headers.push(Header::CallId("call-1".into()));
        headers.push(Header::CSeq(rsip::typed::CSeq { seq, method: Method::Bye }.into()));
        Request { method: Method::Bye, uri: Uri::try_from("sip:alice@127.0.0.1:5060").unwrap(), headers, body: Vec::new(), version: rsip::Version::V2 }
    }

    #[tokio::test]
    async fn admit_remote_cseq_accepts_strictly_increasing_sequence() {
        let d = established_uas().await;
        assert!(d.admit_remote_cseq(&request_with_cseq(2)).await);
        assert!(d.admit_remote_cseq(&request_with_cseq(3)).await);
        assert_eq!(d.fields.read().await.remote_seq, 3);
    }

    #[tokio::test]
    async fn admit_remote_cseq_rejects_a_retransmitted_or_reordered_request() {
        let d = established_uas().await;
        assert!(d.admit_remote_cseq(&request_with_cseq(2)).await);
        assert!(!d.admit_remote_cseq(&request_with_cseq(2)).await, "a repeated CSeq must not be admitted twice");
        assert!(!d.admit_remote_cseq(&request_with_cseq(1)).await, "a CSeq older than remote_seq must not be admitted");
        assert_eq!(d.fields.read().await.remote_seq, 2, "remote_seq must not move backwards on a rejected request");
    }
}

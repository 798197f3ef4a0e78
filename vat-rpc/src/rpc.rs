//! The `Peer` state machine: message handlers wired around the tables in
//! [`crate::tables`] and [`crate::cap_table`].
//!
//! Every handler here runs to completion synchronously: no suspension
//! points within the core. A locally hosted
//! [`crate::local::CapabilityHandler`] is still `async fn`-shaped for
//! ergonomics and for symmetry with a real I/O-backed handler, but this core
//! requires its future to resolve on the first poll — see
//! [`poll_once_ready`]. A handler that genuinely needs to await I/O should
//! resolve that I/O before it is invoked (e.g. by pre-fetching a result into
//! a closure), not inside the call itself.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::task::noop_waker_ref;

use crate::cap_table::{
    decode_inbound_cap_table, resolve_inbound_descriptor, resolve_own_descriptor, CapTable,
    InboundCapTable, ResolvedCap,
};
use crate::error::Error;
use crate::forward::{translate_forwarded_return, ForwardMode};
use crate::local::CapabilityHandler;
use crate::message::{
    is_third_party_answer_id, AcceptMessage, AnyValue, CallMessage, CapDescriptor,
    DisembargoContext, DisembargoMessage, FinishMessage, JoinKeyPart, JoinMessage, Message,
    MessageTarget, Payload, ProvideMessage, ReleaseMessage, ResolveMessage, ResolveTarget,
    ReturnMessage, ReturnTag, SendResultsTo, ThirdPartyAnswerMessage, Transport,
};
use crate::remap::{apply_transform, remap_payload};
use crate::tables::{
    JoinState, PendingCall, PendingEmbargoedAccept, PendingThirdPartyAwait, ProvideEntry,
    Question, QuestionOrigin, ResolvedAnswer, ResolvedImport,
};
use crate::sender_queue::SenderQueue;

/// Polls `fut` exactly once. Panics if it is not immediately ready: this
/// core has no suspension points.
fn poll_once_ready<F: std::future::Future>(fut: F) -> F::Output {
    let waker = noop_waker_ref();
    let mut cx = Context::from_waker(waker);
    let mut fut = Box::pin(fut);
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(v) => v,
        Poll::Pending => {
            panic!("CapabilityHandler::call did not resolve on first poll; this core has no suspension points")
        }
    }
}

/// Construction-time configuration for a [`Peer`]: bootstrap capability,
/// transport, and error/close hooks as one bundle rather than built up
/// through setters.
#[derive(Default)]
pub struct PeerConfig {
    pub bootstrap: Option<Rc<dyn CapabilityHandler>>,
    pub transport: Option<Box<dyn Transport>>,
    pub on_error: Option<Box<dyn Fn(&Error)>>,
    pub on_close: Option<Box<dyn Fn()>>,
}

/// One side of a capability-passing RPC connection: the Questions / Answers
/// / Imports / Exports tables plus the auxiliary embargo, provide/join, and
/// third-party-handoff state.
pub struct Peer {
    cap_table: CapTable,
    transport: Option<Box<dyn Transport>>,
    on_error: Option<Box<dyn Fn(&Error)>>,
    on_close: Option<Box<dyn Fn()>>,

    last_inbound_tag: Option<&'static str>,
    remote_abort_reason: Option<String>,

    questions: HashMap<u32, Question>,
    next_question_id: u32,

    resolved_answers: HashMap<u32, ResolvedAnswer>,
    pending_calls_by_answer: HashMap<u32, SenderQueue<PendingCall, ()>>,
    pending_calls_by_export: HashMap<u32, SenderQueue<PendingCall, ()>>,

    resolved_imports: HashMap<u32, ResolvedImport>,
    pending_embargoes: HashMap<u32, u32>,
    next_embargo_id: u32,

    provides_by_question: HashMap<u32, ProvideEntry>,
    provides_by_recipient: HashMap<AnyValue, ResolvedCap>,
    joins: HashMap<u32, JoinState>,
    pending_embargoed_accepts: HashMap<AnyValue, Vec<PendingEmbargoedAccept>>,

    pending_third_party_awaits: HashMap<AnyValue, PendingThirdPartyAwait>,
    pending_third_party_answers: HashMap<AnyValue, u32>,
    pending_third_party_returns: HashMap<u32, ReturnMessage>,
    adopted_third_party_answers: HashMap<u32, u32>,

    forwarded_questions: HashMap<u32, u32>,
    forwarded_tail_questions: HashMap<u32, u32>,
    forward_modes: HashMap<u32, ForwardMode>,

    send_results_to_yourself: HashSet<u32>,
    send_results_to_third_party: HashMap<u32, AnyValue>,

    loopback_questions: HashSet<u32>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let mut cap_table = CapTable::new();
        if let Some(handler) = config.bootstrap {
            cap_table.set_bootstrap(handler);
        }
        Self {
            cap_table,
            transport: config.transport,
            on_error: config.on_error,
            on_close: config.on_close,
            last_inbound_tag: None,
            remote_abort_reason: None,
            questions: HashMap::new(),
            next_question_id: 0,
            resolved_answers: HashMap::new(),
            pending_calls_by_answer: HashMap::new(),
            pending_calls_by_export: HashMap::new(),
            resolved_imports: HashMap::new(),
            pending_embargoes: HashMap::new(),
            next_embargo_id: 0,
            provides_by_question: HashMap::new(),
            provides_by_recipient: HashMap::new(),
            joins: HashMap::new(),
            pending_embargoed_accepts: HashMap::new(),
            pending_third_party_awaits: HashMap::new(),
            pending_third_party_answers: HashMap::new(),
            pending_third_party_returns: HashMap::new(),
            adopted_third_party_answers: HashMap::new(),
            forwarded_questions: HashMap::new(),
            forwarded_tail_questions: HashMap::new(),
            forward_modes: HashMap::new(),
            send_results_to_yourself: HashSet::new(),
            send_results_to_third_party: HashMap::new(),
            loopback_questions: HashSet::new(),
        }
    }

    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn last_inbound_tag(&self) -> Option<&'static str> {
        self.last_inbound_tag
    }

    pub fn remote_abort_reason(&self) -> Option<&str> {
        self.remote_abort_reason.as_deref()
    }

    pub fn add_export(&mut self, handler: Rc<dyn CapabilityHandler>) -> u32 {
        self.cap_table.add_export(handler)
    }

    pub fn add_promise_export(&mut self) -> u32 {
        self.cap_table.add_promise_export()
    }

    /// Releases every owned allocation. Always safe to call; a `Peer` that
    /// is simply dropped releases the same state through ordinary `Drop`,
    /// but a host that wants to tear down a large capability graph before
    /// the value itself goes out of scope can call this explicitly
    ///.
    pub fn deinit(&mut self) {
        self.questions.clear();
        self.resolved_answers.clear();
        self.pending_calls_by_answer.clear();
        self.pending_calls_by_export.clear();
        self.resolved_imports.clear();
        self.pending_embargoes.clear();
        self.provides_by_question.clear();
        self.provides_by_recipient.clear();
        self.joins.clear();
        self.pending_embargoed_accepts.clear();
        self.pending_third_party_awaits.clear();
        self.pending_third_party_answers.clear();
        self.pending_third_party_returns.clear();
        self.adopted_third_party_answers.clear();
        self.forwarded_questions.clear();
        self.forwarded_tail_questions.clear();
        self.forward_modes.clear();
        self.send_results_to_yourself.clear();
        self.send_results_to_third_party.clear();
        self.loopback_questions.clear();
        self.cap_table = CapTable::new();
    }

    fn report_error(&self, err: &Error) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    fn send_frame(&self, message: Message) -> Result<(), Error> {
        match &self.transport {
            Some(t) => {
                t.send_frame(message);
                Ok(())
            }
            None => Err(Error::TransportMissing),
        }
    }

    fn alloc_question_id(&mut self) -> u32 {
        loop {
            let id = self.next_question_id;
            self.next_question_id = self.next_question_id.wrapping_add(1);
            if !is_third_party_answer_id(id) {
                return id;
            }
        }
    }

    /// Delivers a return either to the transport or, for a loopback
    /// question, straight back through `handle_frame`.
    fn emit_return(&mut self, answer_id: u32, ret: ReturnMessage) {
        if self.loopback_questions.contains(&answer_id) {
            let _ = self.handle_frame(Message::Return(ret));
        } else {
            let _ = self.send_frame(Message::Return(ret));
        }
    }

    fn send_finish(&self, question_id: u32) {
        let _ = self.send_frame(Message::Finish(FinishMessage {
            question_id,
            release_result_caps: true,
            require_early_cancellation: false,
        }));
    }

    fn clear_send_results_routing(&mut self, answer_id: u32) {
        self.send_results_to_yourself.remove(&answer_id);
        self.send_results_to_third_party.remove(&answer_id);
    }

    fn finalize_return_tag(&mut self, answer_id: u32, tag: ReturnTag) -> ReturnTag {
        if self.send_results_to_yourself.remove(&answer_id) {
            return ReturnTag::ResultsSentElsewhere;
        }
        if let Some(payload) = self.send_results_to_third_party.remove(&answer_id) {
            return ReturnTag::AcceptFromThirdParty(payload);
        }
        tag
    }

    /// Finishes dispatching a call this peer answers itself: records the
    /// result as a `ResolvedAnswer`, applies any non-default
    /// `send_results_to` routing, wakes anything pipelined on this answer,
    /// and emits the return.
    fn send_return_results(&mut self, answer_id: u32, payload: Payload) {
        for desc in &payload.cap_table {
            if let CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) = desc {
                self.cap_table.note_export_sent(*id);
            }
        }
        self.resolved_answers.insert(
            answer_id,
            ResolvedAnswer {
                payload: payload.clone(),
            },
        );
        let tag = self.finalize_return_tag(answer_id, ReturnTag::Results(payload));
        self.emit_return(
            answer_id,
            ReturnMessage {
                answer_id,
                no_finish_needed: false,
                tag,
            },
        );
        self.replay_pending_answer_calls(answer_id);
    }

    /// After dispatching an inbound payload, releases every capability the
    /// callback did not retain, aggregated per import id into one outbound
    /// `release` per id.
    fn release_inbound_cap_table(&mut self, cap_table: &InboundCapTable) {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        for entry in &cap_table.entries {
            if entry.retained.get() {
                continue;
            }
            if let ResolvedCap::Imported(id) = entry.resolved {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
        for (import_id, count) in counts {
            for _ in 0..count {
                self.cap_table.drop_import_ref(import_id);
            }
            let _ = self.send_frame(Message::Release(ReleaseMessage {
                id: import_id,
                reference_count: count,
            }));
        }
    }

    // ---- dispatcher -----------------------------------------------------

    /// The single inbound entry point. Protocol violations (`Error::Protocol`)
    /// cause an outbound `abort` before the error is returned to the caller
    ///.
    pub fn handle_frame(&mut self, frame: Message) -> Result<(), Error> {
        self.last_inbound_tag = Some(frame.kind_name());
        let result = self.dispatch(frame);
        if let Err(ref e) = result {
            if let Error::Protocol(reason) = e {
                let _ = self.send_frame(Message::Abort(reason.clone()));
            }
            self.report_error(e);
        }
        result
    }

    fn dispatch(&mut self, frame: Message) -> Result<(), Error> {
        match frame {
            Message::Unrecognized(raw) => {
                let _ = self.send_frame(Message::Unimplemented(Box::new(Message::Unrecognized(raw))));
                Ok(())
            }
            Message::Unimplemented(_) => {
                log::debug!("remote does not implement a message we sent");
                Ok(())
            }
            Message::Abort(reason) => {
                self.remote_abort_reason = Some(reason.clone());
                if let Some(cb) = &self.on_close {
                    cb();
                }
                Err(Error::RemoteAbort(reason))
            }
            Message::Bootstrap { question_id } => self.handle_bootstrap(question_id),
            Message::Call(call) => self.handle_call(call),
            Message::Return(ret) => self.handle_return(ret),
            Message::Finish(fin) => self.handle_finish(fin),
            Message::Release(rel) => self.handle_release(rel),
            Message::Resolve(res) => self.handle_resolve(res),
            Message::Disembargo(dis) => self.handle_disembargo(dis),
            Message::Provide(p) => self.handle_provide(p),
            Message::Accept(a) => self.handle_accept(a),
            Message::Join(j) => self.handle_join(j),
            Message::ThirdPartyAnswer(t) => self.handle_third_party_answer(t),
        }
    }

    // ---- bootstrap --------------------------------------------------------

    fn handle_bootstrap(&mut self, question_id: u32) -> Result<(), Error> {
        match self.cap_table.bootstrap_export_id() {
            Some(export_id) => {
                self.cap_table.note_export_sent(export_id);
                let payload = Payload::single_cap(CapDescriptor::SenderHosted(export_id));
                self.resolved_answers.insert(
                    question_id,
                    ResolvedAnswer {
                        payload: payload.clone(),
                    },
                );
                self.emit_return(question_id, ReturnMessage::results(question_id, payload));
                self.replay_pending_answer_calls(question_id);
                Ok(())
            }
            None => {
                self.emit_return(
                    question_id,
                    ReturnMessage::exception(question_id, "bootstrap not configured"),
                );
                Ok(())
            }
        }
    }

    /// Sends an outbound `bootstrap`, registering a normal external
    /// `Question` for its return.
    pub fn send_bootstrap(&mut self, on_return: Box<dyn FnOnce(ReturnMessage, &InboundCapTable)>) -> Result<u32, Error> {
        let question_id = self.alloc_question_id();
        self.questions.insert(question_id, Question::external(on_return));
        self.send_frame(Message::Bootstrap { question_id })?;
        Ok(question_id)
    }

    // ---- outbound calls -----------------------------------------------

    /// Issues a call against an already-resolved target. A target that
    /// resolves to one of our own exports is, by definition, a loopback:
    /// the call is dispatched locally and `on_return` is told immediately
    /// that results will not travel the normal path.
    pub fn send_call(
        &mut self,
        resolved: ResolvedCap,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        send_results_to: SendResultsTo,
        on_return: Box<dyn FnOnce(ReturnMessage, &InboundCapTable)>,
    ) -> u32 {
        let question_id = self.alloc_question_id();
        match resolved {
            ResolvedCap::Exported(export_id) => {
                self.loopback_questions.insert(question_id);
                let empty = InboundCapTable::default();
                on_return(ReturnMessage::exception(question_id, "loopback"), &empty);
                self.questions.insert(
                    question_id,
                    Question {
                        origin: QuestionOrigin::External(Box::new(|_, _| {})),
                        is_loopback: true,
                        suppress_auto_finish: false,
                    },
                );
                let call = CallMessage {
                    question_id,
                    target: MessageTarget::ImportedCap(export_id),
                    interface_id,
                    method_id,
                    params,
                    send_results_to,
                };
                let _ = self.handle_frame(Message::Call(call));
                question_id
            }
            ResolvedCap::None => {
                let empty = InboundCapTable::default();
                on_return(
                    ReturnMessage::exception(question_id, "promised answer missing"),
                    &empty,
                );
                question_id
            }
            ResolvedCap::Imported(id) => {
                self.questions.insert(question_id, Question::external(on_return));
                let call = CallMessage {
                    question_id,
                    target: MessageTarget::ImportedCap(id),
                    interface_id,
                    method_id,
                    params,
                    send_results_to,
                };
                let _ = self.send_frame(Message::Call(call));
                question_id
            }
            ResolvedCap::Promised(pa) => {
                self.questions.insert(question_id, Question::external(on_return));
                let call = CallMessage {
                    question_id,
                    target: MessageTarget::PromisedAnswer(pa),
                    interface_id,
                    method_id,
                    params,
                    send_results_to,
                };
                let _ = self.send_frame(Message::Call(call));
                question_id
            }
        }
    }

    // ---- call handling ----------------------------------

    fn handle_call(&mut self, call: CallMessage) -> Result<(), Error> {
        match call.target.clone() {
            MessageTarget::ImportedCap(export_id) => {
                if !self.cap_table.contains_export(export_id) {
                    let cap_table = decode_inbound_cap_table(&call.params.cap_table, &mut self.cap_table);
                    self.emit_return(call.question_id, ReturnMessage::exception(call.question_id, "unknown capability"));
                    self.release_inbound_cap_table(&cap_table);
                    return Ok(());
                }
                let pending = self
                    .cap_table
                    .export(export_id)
                    .map(|e| e.is_promise && !e.resolved)
                    .unwrap_or(false);
                let cap_table = decode_inbound_cap_table(&call.params.cap_table, &mut self.cap_table);
                if pending {
                    self.pending_calls_by_export
                        .entry(export_id)
                        .or_default()
                        .push_detach(PendingCall { call, cap_table });
                    return Ok(());
                }
                self.dispatch_resolved_call(call, cap_table, ResolvedCap::Exported(export_id));
                Ok(())
            }
            MessageTarget::PromisedAnswer(pa) => {
                let cap_table = decode_inbound_cap_table(&call.params.cap_table, &mut self.cap_table);
                match self.resolved_answers.get(&pa.question_id) {
                    None => {
                        self.pending_calls_by_answer
                            .entry(pa.question_id)
                            .or_default()
                            .push_detach(PendingCall { call, cap_table });
                        Ok(())
                    }
                    Some(answer) => {
                        let desc = apply_transform(&answer.payload, &pa.transform)
                            .cloned()
                            .unwrap_or(CapDescriptor::None);
                        let resolved = resolve_own_descriptor(&desc);
                        self.route_resolved_promise_call(call, cap_table, resolved);
                        Ok(())
                    }
                }
            }
        }
    }

    fn route_resolved_promise_call(&mut self, call: CallMessage, cap_table: InboundCapTable, resolved: ResolvedCap) {
        if let ResolvedCap::Exported(export_id) = resolved {
            let pending = self
                .cap_table
                .export(export_id)
                .map(|e| e.is_promise && !e.resolved)
                .unwrap_or(false);
            if pending {
                self.pending_calls_by_export
                    .entry(export_id)
                    .or_default()
                    .push_detach(PendingCall { call, cap_table });
                return;
            }
        }
        self.dispatch_resolved_call(call, cap_table, resolved);
    }

    fn dispatch_resolved_call(&mut self, call: CallMessage, cap_table: InboundCapTable, resolved: ResolvedCap) {
        // An export whose promise resolved to a capability we don't host
        // ourselves is a vine: redirect to its forward target instead of
        // looking up a local handler.
        let resolved = match &resolved {
            ResolvedCap::Exported(id) => self
                .cap_table
                .export(*id)
                .and_then(|e| e.forward.clone())
                .unwrap_or(resolved),
            _ => resolved,
        };

        let answer_id = call.question_id;
        match &call.send_results_to {
            SendResultsTo::Caller => {}
            SendResultsTo::Yourself => {
                self.send_results_to_yourself.insert(answer_id);
            }
            SendResultsTo::ThirdParty(payload) => {
                self.send_results_to_third_party.insert(answer_id, payload.clone());
            }
        }

        match resolved {
            ResolvedCap::Exported(export_id) => {
                let handler = self.cap_table.export(export_id).and_then(|e| e.handler.clone());
                match handler {
                    Some(h) => self.dispatch_local_call(answer_id, h, call.interface_id, call.method_id, call.params, cap_table),
                    None => {
                        self.clear_send_results_routing(answer_id);
                        self.emit_return(answer_id, ReturnMessage::exception(answer_id, "unknown capability"));
                        self.release_inbound_cap_table(&cap_table);
                    }
                }
            }
            ResolvedCap::Imported(_) | ResolvedCap::Promised(_) => {
                self.forward_resolved_call(call, cap_table, resolved);
            }
            ResolvedCap::None => {
                self.clear_send_results_routing(answer_id);
                self.emit_return(answer_id, ReturnMessage::exception(answer_id, "promised answer missing"));
                self.release_inbound_cap_table(&cap_table);
            }
        }
    }

    fn dispatch_local_call(
        &mut self,
        answer_id: u32,
        handler: Rc<dyn CapabilityHandler>,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        cap_table: InboundCapTable,
    ) {
        let result = poll_once_ready(crate::local::dispatch_deferred(handler, interface_id, method_id, params));
        match result {
            Ok(payload) => self.send_return_results(answer_id, payload),
            Err(e) => {
                self.clear_send_results_routing(answer_id);
                self.emit_return(answer_id, ReturnMessage::exception(answer_id, e.reason()));
            }
        }
        self.release_inbound_cap_table(&cap_table);
    }

    fn replay_pending_answer_calls(&mut self, answer_id: u32) {
        let Some(mut queue) = self.pending_calls_by_answer.remove(&answer_id) else {
            return;
        };
        for (pending, _tx) in queue.drain() {
            let transform = match &pending.call.target {
                MessageTarget::PromisedAnswer(pa) => pa.transform.clone(),
                MessageTarget::ImportedCap(_) => crate::message::Transform::root(),
            };
            let desc = self
                .resolved_answers
                .get(&answer_id)
                .and_then(|a| apply_transform(&a.payload, &transform).cloned())
                .unwrap_or(CapDescriptor::None);
            let resolved = resolve_own_descriptor(&desc);
            self.route_resolved_promise_call(pending.call, pending.cap_table, resolved);
        }
    }

    fn replay_export_promise_queue(&mut self, export_id: u32, resolved: ResolvedCap) {
        let Some(mut queue) = self.pending_calls_by_export.remove(&export_id) else {
            return;
        };
        for (pending, _tx) in queue.drain() {
            match &resolved {
                ResolvedCap::None => {
                    self.clear_send_results_routing(pending.call.question_id);
                    self.emit_return(pending.call.question_id, ReturnMessage::exception(pending.call.question_id, "promise broken"));
                    self.release_inbound_cap_table(&pending.cap_table);
                }
                other => self.dispatch_resolved_call(pending.call, pending.cap_table, other.clone()),
            }
        }
    }

    // ---- call forwarding --------------------------------

    fn descriptor_for_outbound(&mut self, resolved: &ResolvedCap) -> CapDescriptor {
        match resolved {
            ResolvedCap::None => CapDescriptor::None,
            ResolvedCap::Exported(id) => {
                self.cap_table.note_export_sent(*id);
                CapDescriptor::SenderHosted(*id)
            }
            // Re-exposing an import we hold, or a promised answer of ours,
            // to a third hop without a real vine introduction is a
            // narrowed (documented) simplification — see DESIGN.md.
            ResolvedCap::Imported(id) => CapDescriptor::ReceiverHosted(*id),
            ResolvedCap::Promised(pa) => CapDescriptor::ReceiverAnswer(pa.clone()),
        }
    }

    fn forward_resolved_call(&mut self, call: CallMessage, cap_table: InboundCapTable, resolved: ResolvedCap) {
        let upstream_answer_id = call.question_id;
        let target = match resolved {
            ResolvedCap::Imported(id) => MessageTarget::ImportedCap(id),
            ResolvedCap::Promised(pa) => MessageTarget::PromisedAnswer(pa),
            _ => unreachable!("forward_resolved_call only handles remote targets"),
        };

        let mode = match &call.send_results_to {
            SendResultsTo::Caller => ForwardMode::SentElsewhere,
            SendResultsTo::Yourself => ForwardMode::PropagateYourself,
            SendResultsTo::ThirdParty(payload) => ForwardMode::PropagateThirdParty(payload.clone()),
        };
        let forwarded_send_results_to = match &mode {
            ForwardMode::SentElsewhere | ForwardMode::PropagateYourself => SendResultsTo::Yourself,
            ForwardMode::PropagateThirdParty(payload) => SendResultsTo::ThirdParty(payload.clone()),
        };

        let outbound_descs: Vec<CapDescriptor> = cap_table
            .entries
            .iter()
            .map(|e| self.descriptor_for_outbound(&e.resolved))
            .collect();
        let remapped_params = remap_payload(&call.params, |i| outbound_descs.get(i).cloned());

        let forwarded_question_id = self.alloc_question_id();
        self.forwarded_questions.insert(forwarded_question_id, upstream_answer_id);
        self.forward_modes.insert(forwarded_question_id, mode.clone());

        let mut question = Question::forwarded();
        if matches!(mode, ForwardMode::SentElsewhere) {
            question.suppress_auto_finish = true;
            self.forwarded_tail_questions.insert(upstream_answer_id, forwarded_question_id);
        }
        self.questions.insert(forwarded_question_id, question);

        let outbound_call = CallMessage {
            question_id: forwarded_question_id,
            target,
            interface_id: call.interface_id,
            method_id: call.method_id,
            params: remapped_params,
            send_results_to: forwarded_send_results_to,
        };
        let _ = self.send_frame(Message::Call(outbound_call));

        if matches!(mode, ForwardMode::SentElsewhere) {
            self.emit_return(
                upstream_answer_id,
                ReturnMessage {
                    answer_id: upstream_answer_id,
                    no_finish_needed: false,
                    tag: ReturnTag::TakeFromOtherQuestion(forwarded_question_id),
                },
            );
        }

        self.release_inbound_cap_table(&cap_table);
    }

    fn complete_forwarded_return(&mut self, forwarded_question_id: u32, ret: ReturnMessage) {
        let Some(upstream_answer_id) = self.forwarded_questions.get(&forwarded_question_id).copied() else {
            return;
        };
        let mode = self
            .forward_modes
            .get(&forwarded_question_id)
            .cloned()
            .unwrap_or(ForwardMode::SentElsewhere);
        let outcome = translate_forwarded_return(&mode, ret.tag, &self.forwarded_questions);
        self.forwarded_questions.remove(&forwarded_question_id);
        self.forward_modes.remove(&forwarded_question_id);
        match outcome {
            Ok(tag) => {
                if !matches!(mode, ForwardMode::SentElsewhere) {
                    self.emit_return(
                        upstream_answer_id,
                        ReturnMessage {
                            answer_id: upstream_answer_id,
                            no_finish_needed: false,
                            tag,
                        },
                    );
                }
            }
            Err(e) => {
                self.emit_return(upstream_answer_id, ReturnMessage::exception(upstream_answer_id, e.reason()));
            }
        }
    }

    // ---- return handling --------------------------------

    fn handle_return(&mut self, ret: ReturnMessage) -> Result<(), Error> {
        let answer_id = ret.answer_id;

        if !self.questions.contains_key(&answer_id) {
            if is_third_party_answer_id(answer_id) && !self.pending_third_party_returns.contains_key(&answer_id) {
                self.pending_third_party_returns.insert(answer_id, ret);
                return Ok(());
            }
            return Err(Error::UnknownQuestion);
        }

        let cap_descs: &[CapDescriptor] = match &ret.tag {
            ReturnTag::Results(p) => &p.cap_table,
            _ => &[],
        };
        let inbound_caps = decode_inbound_cap_table(cap_descs, &mut self.cap_table);

        if let ReturnTag::AcceptFromThirdParty(completion) = ret.tag.clone() {
            return self.handle_accept_from_third_party_return(answer_id, completion, inbound_caps);
        }

        let deliver_id = self.adopted_third_party_answers.get(&answer_id).copied();
        let mut ret_for_callback = ret;
        if let Some(original_id) = deliver_id {
            ret_for_callback.answer_id = original_id;
        }

        let mut question = self.questions.remove(&answer_id).unwrap();
        let is_loopback = question.is_loopback;
        let suppress = question.suppress_auto_finish;
        let no_finish_needed = ret_for_callback.no_finish_needed;

        match std::mem::replace(&mut question.origin, QuestionOrigin::Forwarded) {
            QuestionOrigin::External(cb) => cb(ret_for_callback, &inbound_caps),
            QuestionOrigin::Forwarded => self.complete_forwarded_return(answer_id, ret_for_callback),
        }

        self.release_inbound_cap_table(&inbound_caps);

        if !(is_loopback || suppress || no_finish_needed) {
            self.send_finish(answer_id);
        }

        Ok(())
    }

    fn handle_accept_from_third_party_return(
        &mut self,
        original_question_id: u32,
        completion: AnyValue,
        inbound_caps: InboundCapTable,
    ) -> Result<(), Error> {
        if completion.is_empty() {
            return Err(Error::protocol("thirdPartyAnswer completion must not be empty"));
        }
        self.release_inbound_cap_table(&inbound_caps);

        match self.pending_third_party_answers.remove(&completion) {
            Some(adopted_answer_id) => {
                if self.adopted_third_party_answers.contains_key(&adopted_answer_id) {
                    return Err(Error::protocol("conflicting third-party answer id"));
                }
                let question = self.questions.remove(&original_question_id).ok_or(Error::UnknownQuestion)?;
                self.adopted_third_party_answers.insert(adopted_answer_id, original_question_id);
                self.questions.insert(adopted_answer_id, question);
                if let Some(buffered) = self.pending_third_party_returns.remove(&adopted_answer_id) {
                    self.handle_return(buffered)?;
                }
                self.send_finish(original_question_id);
                Ok(())
            }
            None => {
                let question = self.questions.remove(&original_question_id).ok_or(Error::UnknownQuestion)?;
                if self.pending_third_party_awaits.contains_key(&completion) {
                    return Err(Error::protocol("duplicate third-party await for completion key"));
                }
                self.pending_third_party_awaits.insert(
                    completion,
                    PendingThirdPartyAwait {
                        question_id: original_question_id,
                        question,
                    },
                );
                Ok(())
            }
        }
    }

    fn handle_third_party_answer(&mut self, t: ThirdPartyAnswerMessage) -> Result<(), Error> {
        if t.completion.is_empty() {
            return Err(Error::protocol("thirdPartyAnswer completion must not be empty"));
        }
        if !is_third_party_answer_id(t.answer_id) {
            return Err(Error::protocol("thirdPartyAnswer answer id outside the reserved range"));
        }
        if let Some(pending) = self.pending_third_party_awaits.remove(&t.completion) {
            if self.adopted_third_party_answers.contains_key(&t.answer_id) {
                return Err(Error::protocol("conflicting third-party answer id"));
            }
            let original_question_id = pending.question_id;
            let is_loopback = pending.question.is_loopback;
            let suppress = pending.question.suppress_auto_finish;
            self.adopted_third_party_answers.insert(t.answer_id, original_question_id);
            self.questions.insert(t.answer_id, pending.question);
            if let Some(buffered) = self.pending_third_party_returns.remove(&t.answer_id) {
                self.handle_return(buffered)?;
            }
            if !(is_loopback || suppress) {
                self.send_finish(original_question_id);
            }
            Ok(())
        } else {
            if self.pending_third_party_answers.contains_key(&t.completion) {
                return Err(Error::protocol("duplicate thirdPartyAnswer for completion key"));
            }
            self.pending_third_party_answers.insert(t.completion, t.answer_id);
            Ok(())
        }
    }

    // ---- finish / release -------------------------

    fn handle_finish(&mut self, fin: FinishMessage) -> Result<(), Error> {
        let qid = fin.question_id;
        self.clear_send_results_routing(qid);

        if let Some(entry) = self.provides_by_question.remove(&qid) {
            self.provides_by_recipient.remove(&entry.recipient);
        }

        let mut emptied_joins = Vec::new();
        for (join_id, state) in self.joins.iter_mut() {
            state.parts.retain(|_, (question_id, _)| *question_id != qid);
            if state.parts.is_empty() {
                emptied_joins.push(*join_id);
            }
        }
        for id in emptied_joins {
            self.joins.remove(&id);
        }

        let mut emptied_keys = Vec::new();
        for (key, list) in self.pending_embargoed_accepts.iter_mut() {
            list.retain(|p| p.provided_question_id != qid);
            if list.is_empty() {
                emptied_keys.push(key.clone());
            }
        }
        for key in emptied_keys {
            self.pending_embargoed_accepts.remove(&key);
        }

        if let Some(forwarded_question_id) = self.forwarded_tail_questions.remove(&qid) {
            let _ = self.send_frame(Message::Finish(FinishMessage {
                question_id: forwarded_question_id,
                release_result_caps: false,
                require_early_cancellation: fin.require_early_cancellation,
            }));
        }

        if let Some(answer) = self.resolved_answers.remove(&qid) {
            if fin.release_result_caps {
                for desc in &answer.payload.cap_table {
                    if let CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) = desc {
                        self.cap_table.release_export(*id, 1);
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_release(&mut self, rel: ReleaseMessage) -> Result<(), Error> {
        let destroyed = self.cap_table.release_export(rel.id, rel.reference_count);
        if destroyed {
            if let Some(mut queue) = self.pending_calls_by_export.remove(&rel.id) {
                for (pending, _tx) in queue.drain() {
                    self.release_inbound_cap_table(&pending.cap_table);
                }
            }
        }
        Ok(())
    }

    // ---- promise resolution & embargoes -----------

    fn handle_resolve(&mut self, res: ResolveMessage) -> Result<(), Error> {
        if self.resolved_imports.contains_key(&res.promise_id) {
            return Err(Error::protocol("duplicate resolve for import"));
        }
        match res.target {
            ResolveTarget::Cap(desc) => {
                let resolved = resolve_inbound_descriptor(&desc, &mut self.cap_table);
                let known = self.cap_table.import_ref_count(res.promise_id) > 0;
                if !known {
                    match &resolved {
                        ResolvedCap::Imported(id) => {
                            self.cap_table.drop_import_ref(*id);
                        }
                        ResolvedCap::Exported(id) => {
                            self.cap_table.release_export(*id, 1);
                        }
                        _ => {}
                    }
                    return Ok(());
                }

                let mut ri = ResolvedImport::default();
                if matches!(resolved, ResolvedCap::Exported(_) | ResolvedCap::Promised(_)) {
                    let embargo_id = self.next_embargo_id;
                    self.next_embargo_id += 1;
                    ri.embargoed = true;
                    ri.embargo_id = Some(embargo_id);
                    self.pending_embargoes.insert(embargo_id, res.promise_id);
                    let target = match &resolved {
                        ResolvedCap::Exported(id) => MessageTarget::ImportedCap(*id),
                        ResolvedCap::Promised(pa) => MessageTarget::PromisedAnswer(pa.clone()),
                        _ => unreachable!(),
                    };
                    let _ = self.send_frame(Message::Disembargo(DisembargoMessage {
                        target,
                        context: DisembargoContext::SenderLoopback,
                        embargo_id: Some(embargo_id),
                        accept_key: None,
                    }));
                }
                ri.cap = Some(resolved);
                self.resolved_imports.insert(res.promise_id, ri);
            }
            ResolveTarget::Exception(_) => {
                self.resolved_imports.insert(
                    res.promise_id,
                    ResolvedImport {
                        cap: None,
                        embargo_id: None,
                        embargoed: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Resolves a promise export this peer hosts to a concrete,
    /// already-exported capability.
    pub fn resolve_promise_export_to_export(&mut self, promise_export_id: u32, target_export_id: u32) {
        let handler = self.cap_table.export(target_export_id).and_then(|e| e.handler.clone());
        self.cap_table.resolve_promise_export(promise_export_id, handler);
        self.cap_table.note_export_sent(target_export_id);
        let _ = self.send_frame(Message::Resolve(ResolveMessage {
            promise_id: promise_export_id,
            target: ResolveTarget::Cap(CapDescriptor::SenderHosted(target_export_id)),
        }));
        self.replay_export_promise_queue(promise_export_id, ResolvedCap::Exported(target_export_id));
    }

    /// Resolves a promise export this peer hosts to a permanently broken
    /// capability; every queued call against it is answered with the same
    /// exception.
    pub fn resolve_promise_export_to_exception(&mut self, promise_export_id: u32, reason: impl Into<String>) {
        let reason = reason.into();
        self.cap_table.resolve_promise_export(
            promise_export_id,
            Some(Rc::new(crate::broken::BrokenHandler::new(Error::failed(reason.clone())))),
        );
        let _ = self.send_frame(Message::Resolve(ResolveMessage {
            promise_id: promise_export_id,
            target: ResolveTarget::Exception(reason),
        }));
        self.replay_export_promise_queue(promise_export_id, ResolvedCap::None);
    }

    /// Resolves a promise export this peer hosts to a capability it does
    /// not host itself — an import or a not-yet-returned answer of its
    /// own. Every already-queued and every future call against
    /// `promise_export_id` forwards to `target` instead of dispatching
    /// locally.
    pub fn resolve_promise_export_to_remote(&mut self, promise_export_id: u32, target: ResolvedCap) {
        self.cap_table.resolve_promise_export_to_remote(promise_export_id, target.clone());
        let desc = self.descriptor_for_outbound(&target);
        let _ = self.send_frame(Message::Resolve(ResolveMessage {
            promise_id: promise_export_id,
            target: ResolveTarget::Cap(desc),
        }));
        self.replay_export_promise_queue(promise_export_id, target);
    }

    fn handle_disembargo(&mut self, dis: DisembargoMessage) -> Result<(), Error> {
        match dis.context {
            DisembargoContext::SenderLoopback => {
                let _ = self.send_frame(Message::Disembargo(DisembargoMessage {
                    target: dis.target,
                    context: DisembargoContext::ReceiverLoopback,
                    embargo_id: dis.embargo_id,
                    accept_key: None,
                }));
                Ok(())
            }
            DisembargoContext::ReceiverLoopback => {
                let embargo_id = dis
                    .embargo_id
                    .ok_or_else(|| Error::protocol("receiverLoopback disembargo missing embargo id"))?;
                if let Some(promise_id) = self.pending_embargoes.remove(&embargo_id) {
                    if let Some(ri) = self.resolved_imports.get_mut(&promise_id) {
                        ri.embargoed = false;
                        ri.embargo_id = None;
                    }
                }
                Ok(())
            }
            DisembargoContext::Accept => {
                let key = dis
                    .accept_key
                    .ok_or_else(|| Error::protocol("accept disembargo missing key"))?;
                self.drain_pending_embargoed_accepts(key);
                Ok(())
            }
        }
    }

    fn drain_pending_embargoed_accepts(&mut self, key: AnyValue) {
        let Some(list) = self.pending_embargoed_accepts.remove(&key) else {
            return;
        };
        for pending in list {
            self.complete_accept(pending.answer_id, pending.provided_question_id);
        }
    }

    // ---- provide / accept / join -

    fn resolve_message_target(&mut self, target: &MessageTarget) -> Result<ResolvedCap, Error> {
        match target {
            MessageTarget::ImportedCap(id) => {
                if !self.cap_table.contains_export(*id) {
                    return Err(Error::UnknownCapability);
                }
                Ok(ResolvedCap::Exported(*id))
            }
            MessageTarget::PromisedAnswer(pa) => match self.resolved_answers.get(&pa.question_id) {
                Some(answer) => Ok(apply_transform(&answer.payload, &pa.transform)
                    .map(resolve_own_descriptor)
                    .unwrap_or(ResolvedCap::None)),
                None => Ok(ResolvedCap::Promised(pa.clone())),
            },
        }
    }

    fn handle_provide(&mut self, p: ProvideMessage) -> Result<(), Error> {
        if self.provides_by_recipient.contains_key(&p.recipient) {
            return Err(Error::protocol("duplicate provide recipient"));
        }
        let resolved = self.resolve_message_target(&p.target)?;
        self.provides_by_recipient.insert(p.recipient.clone(), resolved.clone());
        self.provides_by_question.insert(
            p.question_id,
            ProvideEntry {
                recipient: p.recipient,
                target: resolved,
            },
        );
        Ok(())
    }

    fn handle_accept(&mut self, a: AcceptMessage) -> Result<(), Error> {
        if !self.provides_by_recipient.contains_key(&a.provision) {
            self.emit_return(a.question_id, ReturnMessage::exception(a.question_id, "no such provision"));
            return Ok(());
        }
        let provided_question_id = self
            .provides_by_question
            .iter()
            .find(|(_, entry)| entry.recipient == a.provision)
            .map(|(qid, _)| *qid)
            .unwrap_or(a.question_id);

        match a.embargo {
            Some(key) => {
                self.pending_embargoed_accepts.entry(key).or_default().push(PendingEmbargoedAccept {
                    answer_id: a.question_id,
                    provided_question_id,
                });
                Ok(())
            }
            None => {
                self.complete_accept(a.question_id, provided_question_id);
                Ok(())
            }
        }
    }

    fn complete_accept(&mut self, answer_id: u32, provided_question_id: u32) {
        let Some(entry) = self.provides_by_question.get(&provided_question_id) else {
            self.emit_return(answer_id, ReturnMessage::exception(answer_id, "no such provision"));
            return;
        };
        let desc = match entry.target.clone() {
            ResolvedCap::Exported(id) => CapDescriptor::SenderHosted(id),
            ResolvedCap::Imported(id) => CapDescriptor::ReceiverHosted(id),
            ResolvedCap::Promised(pa) => CapDescriptor::ReceiverAnswer(pa),
            ResolvedCap::None => CapDescriptor::None,
        };
        self.send_return_results(answer_id, Payload::single_cap(desc));
    }

    fn handle_join(&mut self, j: JoinMessage) -> Result<(), Error> {
        let JoinKeyPart { join_id, part_count, part_num } = j.key_part;
        if part_count == 0 {
            return Err(Error::protocol("join part_count must be nonzero"));
        }

        let state = self
            .joins
            .entry(join_id)
            .or_insert_with(|| JoinState { expected_parts: part_count, parts: HashMap::new() });
        if state.expected_parts != part_count {
            return Err(Error::protocol("join part_count mismatch across parts"));
        }
        if state.parts.contains_key(&part_num) {
            return Err(Error::protocol("duplicate join part number"));
        }
        state.parts.insert(part_num, (j.question_id, j.target));

        let complete = self.joins.get(&join_id).map(|s| s.is_complete()).unwrap_or(false);
        if !complete {
            return Ok(());
        }

        let parts = self.joins.remove(&join_id).unwrap().parts;
        let mut resolved_targets = Vec::new();
        let mut question_ids = Vec::new();
        for (_, (qid, target)) in parts {
            resolved_targets.push(self.resolve_message_target(&target)?);
            question_ids.push(qid);
        }

        let mismatch = resolved_targets.windows(2).any(|w| w[0] != w[1]);
        if mismatch {
            for qid in question_ids {
                self.emit_return(qid, ReturnMessage::exception(qid, "join target mismatch"));
            }
        } else {
            let desc = match resolved_targets.into_iter().next() {
                Some(ResolvedCap::Exported(id)) => CapDescriptor::SenderHosted(id),
                Some(ResolvedCap::Imported(id)) => CapDescriptor::ReceiverHosted(id),
                Some(ResolvedCap::Promised(pa)) => CapDescriptor::ReceiverAnswer(pa),
                _ => CapDescriptor::None,
            };
            for qid in question_ids {
                self.send_return_results(qid, Payload::single_cap(desc.clone()));
            }
        }
        Ok(())
    }
}

//! End-to-end scenarios against a bare `Peer` + `RecordingTransport`, one
//! test per numbered scenario plus a handful of the quantified/boundary
//! properties. `Peer` has no async surface (see `rpc::poll_once_ready`), so
//! these are plain `#[test]`s.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use vat_rpc::cap_table::ResolvedCap;
use vat_rpc::error::Error;
use vat_rpc::local::{CallFuture, CapabilityHandler};
use vat_rpc::message::{
    AcceptMessage, AnyValue, CapDescriptor, DisembargoContext, DisembargoMessage, FinishMessage,
    JoinKeyPart, JoinMessage, Message, MessageTarget, Payload, ProvideMessage, PromisedAnswer,
    RecordingTransport, ReturnTag, SendResultsTo, ThirdPartyAnswerMessage, Transform, Transport,
};
use vat_rpc::{Peer, PeerConfig};

/// Wraps a shared `RecordingTransport` so the test can both hand a `Peer`
/// ownership of a `Box<dyn Transport>` and keep a handle to inspect it.
struct SharedTransport(Rc<RecordingTransport>);

impl Transport for SharedTransport {
    fn send_frame(&self, message: Message) {
        self.0.send_frame(message);
    }
}

fn new_peer() -> (Peer, Rc<RecordingTransport>) {
    let recorder = Rc::new(RecordingTransport::default());
    let peer = Peer::new(PeerConfig {
        transport: Some(Box::new(SharedTransport(recorder.clone()))),
        ..Default::default()
    });
    (peer, recorder)
}

/// A handler that counts its invocations and always answers with the same
/// fixed result (or error).
struct FixedResultHandler {
    calls: Cell<usize>,
    result: Result<Payload, Error>,
}

impl FixedResultHandler {
    fn new(result: Result<Payload, Error>) -> Rc<Self> {
        Rc::new(Self { calls: Cell::new(0), result })
    }

    fn call_count(&self) -> usize {
        self.calls.get()
    }
}

impl CapabilityHandler for FixedResultHandler {
    fn call(&self, _interface_id: u64, _method_id: u16, _params: Payload) -> CallFuture {
        self.calls.set(self.calls.get() + 1);
        let result = self.result.clone();
        Box::pin(async move { result }) as Pin<Box<dyn Future<Output = Result<Payload, Error>>>>
    }
}

fn exception_reason(tag: &ReturnTag) -> Option<&str> {
    match tag {
        ReturnTag::Exception(reason) => Some(reason.as_str()),
        _ => None,
    }
}

// ---- 1. Loopback call --------------------------------------------------

#[test]
fn scenario_1_loopback_call() {
    let (mut peer, recorder) = new_peer();
    let handler = FixedResultHandler::new(Ok(Payload::empty()));
    let export_id = peer.add_export(handler.clone());

    let received: Rc<RefCell<Vec<ReturnTag>>> = Rc::new(RefCell::new(Vec::new()));
    let received_clone = received.clone();
    peer.send_call(
        ResolvedCap::Exported(export_id),
        0x99,
        0,
        Payload::empty(),
        SendResultsTo::Caller,
        Box::new(move |ret, _caps| received_clone.borrow_mut().push(ret.tag)),
    );

    assert_eq!(handler.call_count(), 1, "H must be invoked");
    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(exception_reason(&received[0]), Some("loopback"));
    assert!(recorder.sent.borrow().is_empty(), "no frames cross the transport");
}

// ---- 2. Sender tail forwarding ------------------------------------------

#[test]
fn scenario_2_sender_tail_forwarding() {
    let (mut peer, recorder) = new_peer();

    // export_id plays the role of "imported(999)" in the scenario text: a
    // promise export this peer hosts, resolved to point at a capability it
    // only holds as import "imported(77)".
    let export_id = peer.add_promise_export();
    peer.resolve_promise_export_to_remote(export_id, ResolvedCap::Imported(77));
    recorder.sent.borrow_mut().clear(); // drop the setup `resolve` frame

    let upstream_answer_id = 900;
    peer.handle_frame(Message::Call(vat_rpc::message::CallMessage {
        question_id: upstream_answer_id,
        target: MessageTarget::ImportedCap(export_id),
        interface_id: 0,
        method_id: 0,
        params: Payload::empty(),
        send_results_to: SendResultsTo::Caller,
    }))
    .unwrap();

    let sent = recorder.sent.borrow();
    assert_eq!(sent.len(), 2);
    let forwarded_question_id = match &sent[0] {
        Message::Call(c) => {
            assert_eq!(c.target, MessageTarget::ImportedCap(77));
            assert_eq!(c.send_results_to, SendResultsTo::Yourself);
            c.question_id
        }
        other => panic!("expected call, got {other:?}"),
    };
    match &sent[1] {
        Message::Return(r) => {
            assert_eq!(r.answer_id, upstream_answer_id);
            match &r.tag {
                ReturnTag::TakeFromOtherQuestion(id) => assert_eq!(*id, forwarded_question_id),
                other => panic!("expected takeFromOtherQuestion, got {other:?}"),
            }
        }
        other => panic!("expected return, got {other:?}"),
    }
    drop(sent);

    peer.handle_frame(Message::Return(vat_rpc::message::ReturnMessage {
        answer_id: forwarded_question_id,
        no_finish_needed: false,
        tag: ReturnTag::ResultsSentElsewhere,
    }))
    .unwrap();
    assert!(recorder.sent.borrow().is_empty(), "no further frame on the downstream return");

    peer.handle_frame(Message::Finish(FinishMessage {
        question_id: upstream_answer_id,
        release_result_caps: true,
        require_early_cancellation: false,
    }))
    .unwrap();
    let sent = recorder.sent.borrow();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::Finish(f) => assert_eq!(f.question_id, forwarded_question_id),
        other => panic!("expected finish, got {other:?}"),
    }
}

// ---- 3. Embargoed accept then disembargo --------------------------------

#[test]
fn scenario_3_embargoed_accept_then_disembargo() {
    let (mut peer, recorder) = new_peer();
    let handler = FixedResultHandler::new(Err(Error::failed("stress-ordered")));
    let export_id = peer.add_export(handler);

    let recipient = AnyValue::from_bytes(b"R".to_vec());
    peer.handle_frame(Message::Provide(ProvideMessage {
        question_id: 1200,
        target: MessageTarget::ImportedCap(export_id),
        recipient: recipient.clone(),
    }))
    .unwrap();
    recorder.sent.borrow_mut().clear();

    let embargo_key = AnyValue::from_bytes(b"E".to_vec());
    for k in 0..64u32 {
        let accept_qid = 1300 + 2 * k;
        let call_qid = 1301 + 2 * k;

        peer.handle_frame(Message::Accept(AcceptMessage {
            question_id: accept_qid,
            provision: recipient.clone(),
            embargo: Some(embargo_key.clone()),
        }))
        .unwrap();
        peer.handle_frame(Message::Call(vat_rpc::message::CallMessage {
            question_id: call_qid,
            target: MessageTarget::PromisedAnswer(PromisedAnswer {
                question_id: accept_qid,
                transform: Transform::root(),
            }),
            interface_id: 0,
            method_id: 0,
            params: Payload::empty(),
            send_results_to: SendResultsTo::Caller,
        }))
        .unwrap();
        assert!(
            recorder.sent.borrow().is_empty(),
            "no frames until the matching disembargo (round {k})"
        );

        peer.handle_frame(Message::Disembargo(DisembargoMessage {
            target: MessageTarget::ImportedCap(export_id),
            context: DisembargoContext::Accept,
            embargo_id: None,
            accept_key: Some(embargo_key.clone()),
        }))
        .unwrap();

        let sent = recorder.sent.borrow();
        assert_eq!(sent.len(), 2, "round {k} must emit exactly two frames");
        match &sent[0] {
            Message::Return(r) => {
                assert_eq!(r.answer_id, accept_qid);
                match &r.tag {
                    ReturnTag::Results(p) => {
                        assert!(matches!(p.cap_table.as_slice(), [CapDescriptor::SenderHosted(_)]))
                    }
                    other => panic!("expected results, got {other:?}"),
                }
            }
            other => panic!("expected return, got {other:?}"),
        }
        match &sent[1] {
            Message::Return(r) => {
                assert_eq!(r.answer_id, call_qid);
                assert_eq!(exception_reason(&r.tag), Some("stress-ordered"));
            }
            other => panic!("expected return, got {other:?}"),
        }
        drop(sent);
        recorder.sent.borrow_mut().clear();
    }
}

// ---- 4. Three-party adoption, answer-first ------------------------------

#[test]
fn scenario_4_three_party_adoption_answer_first() {
    let (mut peer, recorder) = new_peer();

    let completion = AnyValue::from_bytes(b"C".to_vec());
    let received: Rc<RefCell<Option<(u32, ReturnTag)>>> = Rc::new(RefCell::new(None));
    let received_clone = received.clone();
    let original_question_id = peer.send_call(
        ResolvedCap::Imported(5),
        0,
        0,
        Payload::empty(),
        SendResultsTo::Caller,
        Box::new(move |ret, _caps| *received_clone.borrow_mut() = Some((ret.answer_id, ret.tag))),
    );
    recorder.sent.borrow_mut().clear(); // drop the setup outbound call frame

    let adopted_answer_id = 0x4000_0012;
    peer.handle_frame(Message::ThirdPartyAnswer(ThirdPartyAnswerMessage {
        answer_id: adopted_answer_id,
        completion: completion.clone(),
    }))
    .unwrap();
    peer.handle_frame(Message::Return(vat_rpc::message::ReturnMessage {
        answer_id: adopted_answer_id,
        no_finish_needed: false,
        tag: ReturnTag::Exception("replayed-from-buffer".to_string()),
    }))
    .unwrap();
    assert!(received.borrow().is_none(), "must stay buffered until unified");
    assert!(recorder.sent.borrow().is_empty());

    peer.handle_frame(Message::Return(vat_rpc::message::ReturnMessage {
        answer_id: original_question_id,
        no_finish_needed: false,
        tag: ReturnTag::AcceptFromThirdParty(completion),
    }))
    .unwrap();

    let received = received.borrow();
    let (answer_id, tag) = received.as_ref().expect("callback must fire");
    assert_eq!(*answer_id, original_question_id);
    assert_eq!(exception_reason(tag), Some("replayed-from-buffer"));

    let sent = recorder.sent.borrow();
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        Message::Finish(f) => assert_eq!(f.question_id, adopted_answer_id),
        other => panic!("expected finish(adopted), got {other:?}"),
    }
    match &sent[1] {
        Message::Finish(f) => assert_eq!(f.question_id, original_question_id),
        other => panic!("expected finish(original), got {other:?}"),
    }
}

// ---- 5. Unknown message kind --------------------------------------------

#[test]
fn scenario_5_unknown_message_kind() {
    let (mut peer, recorder) = new_peer();
    let raw = AnyValue::from_bytes(vec![0xff, 0xff]);
    peer.handle_frame(Message::Unrecognized(raw.clone())).unwrap();

    let sent = recorder.sent.borrow();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::Unimplemented(nested) => match nested.as_ref() {
            Message::Unrecognized(v) => assert_eq!(v, &raw),
            other => panic!("expected nested unrecognized, got {other:?}"),
        },
        other => panic!("expected unimplemented, got {other:?}"),
    }
}

// ---- 6. Join mismatch ----------------------------------------------------

#[test]
fn scenario_6_join_mismatch() {
    let (mut peer, recorder) = new_peer();
    let handler_a = FixedResultHandler::new(Ok(Payload::empty()));
    let handler_b = FixedResultHandler::new(Ok(Payload::empty()));
    let export_a = peer.add_export(handler_a);
    let export_b = peer.add_export(handler_b);

    peer.handle_frame(Message::Join(JoinMessage {
        question_id: 10,
        target: MessageTarget::ImportedCap(export_a),
        key_part: JoinKeyPart { join_id: 77, part_count: 2, part_num: 0 },
    }))
    .unwrap();
    assert!(recorder.sent.borrow().is_empty());

    peer.handle_frame(Message::Join(JoinMessage {
        question_id: 11,
        target: MessageTarget::ImportedCap(export_b),
        key_part: JoinKeyPart { join_id: 77, part_count: 2, part_num: 1 },
    }))
    .unwrap();

    let sent = recorder.sent.borrow();
    assert_eq!(sent.len(), 2);
    let mut answer_ids: Vec<u32> = Vec::new();
    for msg in sent.iter() {
        match msg {
            Message::Return(r) => {
                assert_eq!(exception_reason(&r.tag), Some("join target mismatch"));
                answer_ids.push(r.answer_id);
            }
            other => panic!("expected return, got {other:?}"),
        }
    }
    answer_ids.sort();
    assert_eq!(answer_ids, vec![10, 11]);
}

// ---- quantified / boundary properties ------------------------------------

#[test]
fn finish_twice_after_state_clears_is_a_no_op() {
    let (mut peer, recorder) = new_peer();
    let handler = FixedResultHandler::new(Ok(Payload::empty()));
    let export_id = peer.add_export(handler);

    peer.handle_frame(Message::Call(vat_rpc::message::CallMessage {
        question_id: 42,
        target: MessageTarget::ImportedCap(export_id),
        interface_id: 0,
        method_id: 0,
        params: Payload::empty(),
        send_results_to: SendResultsTo::Caller,
    }))
    .unwrap();
    recorder.sent.borrow_mut().clear();

    peer.handle_frame(Message::Finish(FinishMessage {
        question_id: 42,
        release_result_caps: true,
        require_early_cancellation: false,
    }))
    .unwrap();
    peer.handle_frame(Message::Finish(FinishMessage {
        question_id: 42,
        release_result_caps: true,
        require_early_cancellation: false,
    }))
    .unwrap();
    assert!(recorder.sent.borrow().is_empty());
}

#[test]
fn zero_length_cap_table_call_produces_no_releases() {
    let (mut peer, recorder) = new_peer();
    let handler = FixedResultHandler::new(Ok(Payload::empty()));
    let export_id = peer.add_export(handler);

    peer.handle_frame(Message::Call(vat_rpc::message::CallMessage {
        question_id: 1,
        target: MessageTarget::ImportedCap(export_id),
        interface_id: 0,
        method_id: 0,
        params: Payload::empty(),
        send_results_to: SendResultsTo::Caller,
    }))
    .unwrap();

    let sent = recorder.sent.borrow();
    assert!(sent.iter().all(|m| !matches!(m, Message::Release(_))));
}

#[test]
fn unknown_capability_call_answers_with_exception() {
    let (mut peer, recorder) = new_peer();
    peer.handle_frame(Message::Call(vat_rpc::message::CallMessage {
        question_id: 7,
        target: MessageTarget::ImportedCap(999),
        interface_id: 0,
        method_id: 0,
        params: Payload::empty(),
        send_results_to: SendResultsTo::Caller,
    }))
    .unwrap();

    let sent = recorder.sent.borrow();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::Return(r) => {
            assert_eq!(r.answer_id, 7);
            assert_eq!(exception_reason(&r.tag), Some("unknown capability"));
        }
        other => panic!("expected return, got {other:?}"),
    }
}

#[test]
fn pending_calls_replay_in_insertion_order() {
    let (mut peer, recorder) = new_peer();
    let order: Rc<RefCell<Vec<u16>>> = Rc::new(RefCell::new(Vec::new()));
    let handler = Rc::new(OrderRecordingHandler { order: order.clone() });
    let target_export_id = peer.add_export(handler);
    let promise_export_id = peer.add_promise_export();

    for method_id in 0..5u16 {
        peer.handle_frame(Message::Call(vat_rpc::message::CallMessage {
            question_id: 100 + method_id as u32,
            target: MessageTarget::ImportedCap(promise_export_id),
            interface_id: 0,
            method_id,
            params: Payload::empty(),
            send_results_to: SendResultsTo::Caller,
        }))
        .unwrap();
    }
    assert!(recorder.sent.borrow().is_empty());

    peer.resolve_promise_export_to_export(promise_export_id, target_export_id);

    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

struct OrderRecordingHandler {
    order: Rc<RefCell<Vec<u16>>>,
}

impl CapabilityHandler for OrderRecordingHandler {
    fn call(&self, _interface_id: u64, method_id: u16, _params: Payload) -> CallFuture {
        self.order.borrow_mut().push(method_id);
        Box::pin(async move { Ok(Payload::empty()) })
    }
}

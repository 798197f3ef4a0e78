//! Decoded message views and the outbound frames the `Peer` builds.
//!
//! The core consumes decoded message views and produces encoded frames; it
//! never parses bytes itself. The actual segmented, pointer-structured wire
//! encoding and its reader/builder API are not part of this crate.
//! `AnyValue` stands in for that encoding's opaque payload content and for
//! any-pointers (completion tokens, recipients, provisions); a real decoder
//! would hand `Peer::handle_frame` one of these `Message` values instead of
//! a byte slice.

/// High bit pattern for the third-party-adopted answer id range (reserved
/// identifier range: bit 30 set, bit 31 clear).
const THIRD_PARTY_BIT: u32 = 0x4000_0000;
const HIGH_BIT: u32 = 0x8000_0000;

pub fn is_third_party_answer_id(id: u32) -> bool {
    id & THIRD_PARTY_BIT != 0 && id & HIGH_BIT == 0
}

/// Opaque payload bytes: the canonical serialization of whatever any-pointer
/// or struct the wire format would otherwise carry. Two `AnyValue`s compare
/// equal iff their canonical bytes match, which is exactly the completion-key
/// identity rule for three-party handoff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AnyValue {
    pub bytes: Vec<u8>,
}

impl AnyValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: bytes.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineOp {
    pub pointer_index: u16,
}

impl PipelineOp {
    pub fn get_pointer_field(index: u16) -> Self {
        Self { pointer_index: index }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transform(pub Vec<PipelineOp>);

impl Transform {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromisedAnswer {
    pub question_id: u32,
    pub transform: Transform,
}

/// One entry of a payload's capability table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapDescriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer(PromisedAnswer),
    ThirdPartyHosted { id: u32, vine_id: u32 },
}

/// Application data plus the ordered list of capabilities its pointer tree
/// refers to.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub content: AnyValue,
    pub cap_table: Vec<CapDescriptor>,
}

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single_cap(desc: CapDescriptor) -> Self {
        Self {
            content: AnyValue::empty(),
            cap_table: vec![desc],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    ImportedCap(u32),
    PromisedAnswer(PromisedAnswer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResultsTo {
    Caller,
    Yourself,
    ThirdParty(AnyValue),
}

#[derive(Debug, Clone)]
pub struct CallMessage {
    pub question_id: u32,
    pub target: MessageTarget,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Payload,
    pub send_results_to: SendResultsTo,
}

#[derive(Debug, Clone)]
pub enum ReturnTag {
    Results(Payload),
    Exception(String),
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(u32),
    AcceptFromThirdParty(AnyValue),
}

#[derive(Debug, Clone)]
pub struct ReturnMessage {
    pub answer_id: u32,
    /// Whether the sender is releasing the capabilities in its own params
    /// as part of this return (teacher-style naming; not to be confused
    /// with `FinishMessage::release_result_caps`).
    pub no_finish_needed: bool,
    pub tag: ReturnTag,
}

impl ReturnMessage {
    pub fn results(answer_id: u32, payload: Payload) -> Self {
        Self {
            answer_id,
            no_finish_needed: false,
            tag: ReturnTag::Results(payload),
        }
    }

    pub fn exception(answer_id: u32, reason: impl Into<String>) -> Self {
        Self {
            answer_id,
            no_finish_needed: false,
            tag: ReturnTag::Exception(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FinishMessage {
    pub question_id: u32,
    pub release_result_caps: bool,
    pub require_early_cancellation: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReleaseMessage {
    pub id: u32,
    pub reference_count: u32,
}

#[derive(Debug, Clone)]
pub enum ResolveTarget {
    Cap(CapDescriptor),
    Exception(String),
}

#[derive(Debug, Clone)]
pub struct ResolveMessage {
    pub promise_id: u32,
    pub target: ResolveTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisembargoContext {
    SenderLoopback,
    ReceiverLoopback,
    Accept,
}

#[derive(Debug, Clone)]
pub struct DisembargoMessage {
    pub target: MessageTarget,
    pub context: DisembargoContext,
    pub embargo_id: Option<u32>,
    pub accept_key: Option<AnyValue>,
}

#[derive(Debug, Clone)]
pub struct ProvideMessage {
    pub question_id: u32,
    pub target: MessageTarget,
    pub recipient: AnyValue,
}

#[derive(Debug, Clone)]
pub struct AcceptMessage {
    pub question_id: u32,
    pub provision: AnyValue,
    pub embargo: Option<AnyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinKeyPart {
    pub join_id: u32,
    pub part_count: u16,
    pub part_num: u16,
}

#[derive(Debug, Clone)]
pub struct JoinMessage {
    pub question_id: u32,
    pub target: MessageTarget,
    pub key_part: JoinKeyPart,
}

#[derive(Debug, Clone)]
pub struct ThirdPartyAnswerMessage {
    pub answer_id: u32,
    pub completion: AnyValue,
}

/// A decoded message view, produced by the external codec and consumed by
/// [`crate::rpc::Peer::handle_frame`]. The same type is used for outbound
/// frames the `Peer` hands to the transport.
#[derive(Debug, Clone)]
pub enum Message {
    /// A frame whose kind tag the codec could not decode into any of the
    /// variants below. Carries the
    /// codec's best-effort opaque view of the frame so it can be echoed
    /// back inside an `unimplemented` reply.
    Unrecognized(AnyValue),
    Unimplemented(Box<Message>),
    Abort(String),
    Bootstrap { question_id: u32 },
    Call(CallMessage),
    Return(ReturnMessage),
    Finish(FinishMessage),
    Release(ReleaseMessage),
    Resolve(ResolveMessage),
    Disembargo(DisembargoMessage),
    Provide(ProvideMessage),
    Accept(AcceptMessage),
    Join(JoinMessage),
    ThirdPartyAnswer(ThirdPartyAnswerMessage),
}

impl Message {
    /// A short discriminant name, used for `last_inbound_tag` bookkeeping
    /// and for log lines.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Unrecognized(_) => "unrecognized",
            Message::Unimplemented(_) => "unimplemented",
            Message::Abort(_) => "abort",
            Message::Bootstrap { .. } => "bootstrap",
            Message::Call(_) => "call",
            Message::Return(_) => "return",
            Message::Finish(_) => "finish",
            Message::Release(_) => "release",
            Message::Resolve(_) => "resolve",
            Message::Disembargo(_) => "disembargo",
            Message::Provide(_) => "provide",
            Message::Accept(_) => "accept",
            Message::Join(_) => "join",
            Message::ThirdPartyAnswer(_) => "thirdPartyAnswer",
        }
    }
}

/// The byte-frame transport: a bidirectional channel the core
/// never reads from directly. `send_frame` is the only outbound hook;
/// inbound frames arrive through `Peer::handle_frame`.
pub trait Transport {
    fn send_frame(&self, message: Message);
}

/// A transport collecting every outbound frame in order, used by tests that
/// want to assert on exact emission sequences.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: std::cell::RefCell<Vec<Message>>,
}

impl Transport for RecordingTransport {
    fn send_frame(&self, message: Message) {
        self.sent.borrow_mut().push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_third_party_range_boundary() {
        assert!(!is_third_party_answer_id(0));
        assert!(is_third_party_answer_id(0x4000_0000));
        assert!(is_third_party_answer_id(0x4000_0012));
        assert!(!is_third_party_answer_id(0x8000_0000));
        assert!(!is_third_party_answer_id(0xC000_0000));
    }

    #[test]
    fn empty_transform_selects_root_index() {
        let t = Transform::root();
        assert!(t.is_root());
        assert_eq!(t.0.last().map(|op| op.pointer_index), None);
    }
}

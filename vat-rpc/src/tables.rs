//! Plain data held in the four core tables (Questions, Answers, Imports,
//! Exports) plus the auxiliary tables the other subsystems need. Behavior
//! over these lives in [`crate::rpc`]; this module is data only.

use std::collections::HashMap;

use crate::cap_table::{InboundCapTable, ResolvedCap};
use crate::message::{AnyValue, CallMessage, MessageTarget, Payload, ReturnMessage};

/// What should happen when a [`Question`]'s return arrives: either an
/// external caller registered a plain callback (`send_call`'s API), or this
/// question is the downstream half of a forwarded call, whose return needs
/// the translation table in [`crate::forward`] rather than a free-standing
/// closure. Keeping these as a closed enum, instead of one generic
/// `FnOnce`, is what lets the forwarding handler in [`crate::rpc::Peer`]
/// reach back into `&mut self` without a self-referential
/// `Rc<RefCell<Peer>>`.
pub enum QuestionOrigin {
    External(Box<dyn FnOnce(ReturnMessage, &InboundCapTable)>),
    Forwarded,
}

/// An outstanding call this peer made.
pub struct Question {
    pub origin: QuestionOrigin,
    pub is_loopback: bool,
    pub suppress_auto_finish: bool,
}

impl Question {
    pub fn external(on_return: Box<dyn FnOnce(ReturnMessage, &InboundCapTable)>) -> Self {
        Self {
            origin: QuestionOrigin::External(on_return),
            is_loopback: false,
            suppress_auto_finish: false,
        }
    }

    pub fn forwarded() -> Self {
        Self {
            origin: QuestionOrigin::Forwarded,
            is_loopback: false,
            suppress_auto_finish: false,
        }
    }
}

/// A stored completed return, kept so later pipelined calls on the same
/// answer can resolve without waiting.
pub struct ResolvedAnswer {
    pub payload: Payload,
}

/// A call whose target had not yet resolved when it arrived.
pub struct PendingCall {
    pub call: CallMessage,
    pub cap_table: InboundCapTable,
}

/// A remote promise this peer has resolved locally.
#[derive(Default)]
pub struct ResolvedImport {
    pub cap: Option<ResolvedCap>,
    pub embargo_id: Option<u32>,
    pub embargoed: bool,
}

/// A capability offered for third-party handoff.
pub struct ProvideEntry {
    pub recipient: AnyValue,
    pub target: ResolvedCap,
}

/// Bookkeeping for an in-progress multi-part join.
#[derive(Default)]
pub struct JoinState {
    pub expected_parts: u16,
    pub parts: HashMap<u16, (u32, MessageTarget)>,
}

impl JoinState {
    pub fn is_complete(&self) -> bool {
        self.expected_parts != 0 && self.parts.len() as u16 == self.expected_parts
    }
}

/// An `accept` queued behind an embargo key.
pub struct PendingEmbargoedAccept {
    pub answer_id: u32,
    pub provided_question_id: u32,
}

/// A peer's `accept_from_third_party` return awaiting its counterpart.
pub struct PendingThirdPartyAwait {
    pub question_id: u32,
    pub question: Question,
}

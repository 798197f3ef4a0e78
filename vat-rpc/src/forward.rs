//! Call forwarding and tail-call return-mode translation.
//!
//! `ForwardMode` is a sum type over the three ways a forwarded call's return
//! needs to be translated before it goes back upstream, named for the
//! routing decision that produced it rather than for any particular closure
//! shape a forwarder might otherwise capture.

use std::collections::HashMap;

use crate::error::Error;
use crate::message::{AnyValue, ReturnTag};

/// Which translation the forwarder installs, chosen from the forwarded
/// call's `send_results_to`.
#[derive(Debug, Clone)]
pub enum ForwardMode {
    /// `send_results_to = caller`: a true tail call. The upstream answer
    /// already took `take_from_other_question`; nothing further is
    /// translated except confirming the forwarded return was one of the
    /// two tail-safe tags.
    SentElsewhere,
    /// `send_results_to = yourself`: forwarded results become
    /// `results_sent_elsewhere` upstream.
    PropagateYourself,
    /// `send_results_to = third_party(payload)`: forwarded results become
    /// `accept_from_third_party(payload)` upstream.
    PropagateThirdParty(AnyValue),
}

/// Translates a forwarded-call's return into the return this peer should
/// send (or deliver) upstream.
pub fn translate_forwarded_return(
    mode: &ForwardMode,
    tag: ReturnTag,
    forwarded_questions: &HashMap<u32, u32>,
) -> Result<ReturnTag, Error> {
    match mode {
        ForwardMode::SentElsewhere => match tag {
            ReturnTag::ResultsSentElsewhere | ReturnTag::Canceled => Ok(tag),
            other => Err(Error::protocol(format!(
                "forwarded tail call returned unsupported tag {other:?}"
            ))),
        },
        ForwardMode::PropagateYourself => match tag {
            ReturnTag::Results(_) | ReturnTag::ResultsSentElsewhere | ReturnTag::AcceptFromThirdParty(_) => {
                Ok(ReturnTag::ResultsSentElsewhere)
            }
            ReturnTag::Canceled => Ok(ReturnTag::Canceled),
            ReturnTag::Exception(reason) => Ok(ReturnTag::Exception(reason)),
            ReturnTag::TakeFromOtherQuestion(_) => Err(Error::protocol(
                "forwarded takeFromOtherQuestion unsupported",
            )),
        },
        ForwardMode::PropagateThirdParty(captured) => match tag {
            ReturnTag::ResultsSentElsewhere => Ok(ReturnTag::AcceptFromThirdParty(captured.clone())),
            ReturnTag::AcceptFromThirdParty(await_ptr) => Ok(ReturnTag::AcceptFromThirdParty(await_ptr)),
            ReturnTag::Results(_) => Ok(ReturnTag::AcceptFromThirdParty(captured.clone())),
            ReturnTag::Canceled => Ok(ReturnTag::Canceled),
            ReturnTag::Exception(reason) => Ok(ReturnTag::Exception(reason)),
            ReturnTag::TakeFromOtherQuestion(other_local_id) => {
                match forwarded_questions.get(&other_local_id) {
                    Some(&upstream_id) => Ok(ReturnTag::TakeFromOtherQuestion(upstream_id)),
                    None => Err(Error::protocol("forwarded takeFromOtherQuestion missing mapping")),
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_elsewhere_passes_through_results_sent_elsewhere() {
        let map = HashMap::new();
        let t = translate_forwarded_return(&ForwardMode::SentElsewhere, ReturnTag::ResultsSentElsewhere, &map).unwrap();
        assert!(matches!(t, ReturnTag::ResultsSentElsewhere));
    }

    #[test]
    fn sent_elsewhere_rejects_results() {
        let map = HashMap::new();
        let err = translate_forwarded_return(
            &ForwardMode::SentElsewhere,
            ReturnTag::Results(Default::default()),
            &map,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn propagate_yourself_maps_results_to_sent_elsewhere() {
        let map = HashMap::new();
        let t = translate_forwarded_return(
            &ForwardMode::PropagateYourself,
            ReturnTag::Results(Default::default()),
            &map,
        )
        .unwrap();
        assert!(matches!(t, ReturnTag::ResultsSentElsewhere));
    }

    #[test]
    fn propagate_yourself_rejects_take_from_other_question() {
        let mut map = HashMap::new();
        map.insert(5, 900);
        let err = translate_forwarded_return(
            &ForwardMode::PropagateYourself,
            ReturnTag::TakeFromOtherQuestion(5),
            &map,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn propagate_third_party_maps_results_sent_elsewhere_to_accept() {
        let map = HashMap::new();
        let captured = AnyValue::from_bytes(vec![1, 2, 3]);
        let t = translate_forwarded_return(
            &ForwardMode::PropagateThirdParty(captured.clone()),
            ReturnTag::ResultsSentElsewhere,
            &map,
        )
        .unwrap();
        match t {
            ReturnTag::AcceptFromThirdParty(v) => assert_eq!(v, captured),
            _ => panic!("wrong tag"),
        }
    }
}

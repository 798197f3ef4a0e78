//! The payload remapper: clones an inbound payload into an outbound one
//! while rewriting its capability pointers through a caller-supplied
//! index→descriptor function.
//!
//! A pure function over segment views; allocation and traversal stay
//! separate. Since the segmented pointer tree itself is modeled here only
//! as opaque bytes (the real traversal is the wire codec's job, out of
//! scope for this crate), the only tree this function actually walks is the
//! capability table; the opaque content bytes are cloned verbatim.

use crate::message::{CapDescriptor, Payload};

/// Rebuilds `payload`'s capability table by applying `resolve` to each
/// original index. An index `resolve` has no answer for becomes a null
/// pointer (`CapDescriptor::None`), matching "unresolved index entries
/// become null pointers."
pub fn remap_payload(payload: &Payload, resolve: impl Fn(usize) -> Option<CapDescriptor>) -> Payload {
    let cap_table = (0..payload.cap_table.len())
        .map(|i| resolve(i).unwrap_or(CapDescriptor::None))
        .collect();
    Payload {
        content: payload.content.clone(),
        cap_table,
    }
}

/// Applies a finite ordered sequence of `get_pointer_field` ops to locate a
/// capability pointer inside a payload's capability table: selects a
/// capability pointer in the stored results. Because our content is opaque
/// bytes rather than a real pointer tree, a transform resolves directly to a
/// capability-table index equal to its last op's field index, and the empty
/// transform selects index 0 — the conventional position of a struct's sole
/// returned capability field, and the payload root for an empty transform on
/// a promised answer.
pub fn apply_transform<'a>(payload: &'a Payload, transform: &crate::message::Transform) -> Option<&'a CapDescriptor> {
    let index = transform
        .0
        .last()
        .map(|op| op.pointer_index as usize)
        .unwrap_or(0);
    payload.cap_table.get(index)
}

//! The `CapTable`: export id allocation and import reference counting.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::local::CapabilityHandler;
use crate::message::{CapDescriptor, PromisedAnswer};

/// A locally hosted capability.
pub struct Export {
    pub handler: Option<Rc<dyn CapabilityHandler>>,
    /// Set when this export promise resolved not to a locally hosted
    /// handler but to a capability this peer itself only holds as an
    /// import or a not-yet-returned answer — i.e. this export is a vine
    /// that must forward calls rather than dispatch them.
    pub forward: Option<ResolvedCap>,
    pub ref_count: u32,
    pub is_promise: bool,
    pub resolved: bool,
    pub is_bootstrap: bool,
}

impl Export {
    fn new(handler: Option<Rc<dyn CapabilityHandler>>, is_promise: bool) -> Self {
        Self {
            handler,
            forward: None,
            ref_count: 0,
            is_promise,
            resolved: !is_promise,
            is_bootstrap: false,
        }
    }
}

/// Allocates export ids and tracks the ref-count of each import id we hold
/// a local reference to.
#[derive(Default)]
pub struct CapTable {
    exports: HashMap<u32, Export>,
    next_export_id: u32,
    import_ref_counts: HashMap<u32, u32>,
    bootstrap_export_id: Option<u32>,
}

impl CapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_export(&mut self, handler: Rc<dyn CapabilityHandler>) -> u32 {
        let id = self.next_export_id;
        self.next_export_id += 1;
        self.exports.insert(id, Export::new(Some(handler), false));
        id
    }

    pub fn add_promise_export(&mut self) -> u32 {
        let id = self.next_export_id;
        self.next_export_id += 1;
        self.exports.insert(id, Export::new(None, true));
        id
    }

    pub fn set_bootstrap(&mut self, handler: Rc<dyn CapabilityHandler>) -> u32 {
        let id = self.add_export(handler);
        self.exports.get_mut(&id).unwrap().is_bootstrap = true;
        self.bootstrap_export_id = Some(id);
        id
    }

    pub fn bootstrap_export_id(&self) -> Option<u32> {
        self.bootstrap_export_id
    }

    pub fn export(&self, id: u32) -> Option<&Export> {
        self.exports.get(&id)
    }

    pub fn export_mut(&mut self, id: u32) -> Option<&mut Export> {
        self.exports.get_mut(&id)
    }

    pub fn contains_export(&self, id: u32) -> bool {
        self.exports.contains_key(&id)
    }

    /// Called whenever the peer emits a descriptor of kind `sender_hosted`
    /// or `sender_promise` referencing `id`.
    pub fn note_export_sent(&mut self, id: u32) {
        if let Some(export) = self.exports.get_mut(&id) {
            export.ref_count += 1;
        }
    }

    /// Applies an inbound `release(id, count)`. Returns `true` if the
    /// export was destroyed as a result (count reached zero and it is not
    /// the bootstrap export).
    pub fn release_export(&mut self, id: u32, count: u32) -> bool {
        let Some(export) = self.exports.get_mut(&id) else {
            return false;
        };
        export.ref_count = export.ref_count.saturating_sub(count);
        if export.ref_count == 0 && !export.is_bootstrap {
            self.exports.remove(&id);
            true
        } else {
            false
        }
    }

    /// Marks an export promise resolved: clears the export-promise flag
    /// and sets the export's `resolved` field.
    pub fn resolve_promise_export(&mut self, id: u32, handler: Option<Rc<dyn CapabilityHandler>>) {
        if let Some(export) = self.exports.get_mut(&id) {
            export.is_promise = false;
            export.resolved = true;
            export.handler = handler;
            export.forward = None;
        }
    }

    /// Marks an export promise resolved to a capability this peer does not
    /// host: calls against it must forward rather than dispatch locally.
    pub fn resolve_promise_export_to_remote(&mut self, id: u32, target: ResolvedCap) {
        if let Some(export) = self.exports.get_mut(&id) {
            export.is_promise = false;
            export.resolved = true;
            export.handler = None;
            export.forward = Some(target);
        }
    }

    /// Increments the local reference count on import `id` (an inbound
    /// `sender_hosted`/`sender_promise` descriptor names a capability we
    /// now hold by import id).
    pub fn add_import_ref(&mut self, id: u32) {
        *self.import_ref_counts.entry(id).or_insert(0) += 1;
    }

    /// Decrements the local reference count on import `id` by one. Returns
    /// `true` if the import's local ref count reached zero, meaning an
    /// outbound `release(id, released_count)` should eventually be sent
    /// (the caller is responsible for batching and emitting it).
    pub fn drop_import_ref(&mut self, id: u32) -> bool {
        match self.import_ref_counts.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.import_ref_counts.remove(&id);
                true
            }
            None => false,
        }
    }

    /// The local reference count held on import `id`, or zero if we hold
    /// none. Used by `resolve` handling to decide whether a
    /// resolved promise is for an import this peer still cares about.
    pub fn import_ref_count(&self, id: u32) -> u32 {
        self.import_ref_counts.get(&id).copied().unwrap_or(0)
    }
}

/// A resolved capability target, decoded from a wire `CapDescriptor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCap {
    None,
    Imported(u32),
    Exported(u32),
    Promised(PromisedAnswer),
}

/// One entry of a decoded [`InboundCapTable`]: a resolved capability plus
/// whether a callback chose to retain it.
pub struct InboundCapEntry {
    pub resolved: ResolvedCap,
    pub retained: Cell<bool>,
}

/// The indexed array of resolved capability entries produced by decoding an
/// inbound payload's capability descriptor list.
#[derive(Default)]
pub struct InboundCapTable {
    pub entries: Vec<InboundCapEntry>,
}

impl InboundCapTable {
    pub fn get(&self, index: u16) -> ResolvedCap {
        self.entries
            .get(index as usize)
            .map(|e| e.resolved.clone())
            .unwrap_or(ResolvedCap::None)
    }

    pub fn retain(&self, index: u16) {
        if let Some(e) = self.entries.get(index as usize) {
            e.retained.set(true);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decodes a payload's capability descriptor list into an `InboundCapTable`,
/// bumping import ref counts for every descriptor that names one.
/// `sender_hosted`/`sender_promise` name capabilities the remote
/// just told us it hosts, which from our side are imports;
/// `receiver_hosted` names one of our own exports; `receiver_answer` names a
/// not-yet-returned answer of ours; `third_party_hosted` vine
/// introductions are outside the numbered scenarios this crate implements
/// and resolve to `None`.
pub fn decode_inbound_cap_table(
    descriptors: &[CapDescriptor],
    cap_table: &mut CapTable,
) -> InboundCapTable {
    let entries = descriptors
        .iter()
        .map(|desc| InboundCapEntry {
            resolved: resolve_inbound_descriptor(desc, cap_table),
            retained: Cell::new(false),
        })
        .collect();
    InboundCapTable { entries }
}

/// Resolves one descriptor the remote just sent us, bumping the import ref
/// count when the descriptor names one. Shared by
/// [`decode_inbound_cap_table`] and the single-descriptor `resolve` handler.
pub fn resolve_inbound_descriptor(desc: &CapDescriptor, cap_table: &mut CapTable) -> ResolvedCap {
    match desc {
        CapDescriptor::None => ResolvedCap::None,
        CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => {
            cap_table.add_import_ref(*id);
            ResolvedCap::Imported(*id)
        }
        CapDescriptor::ReceiverHosted(id) => ResolvedCap::Exported(*id),
        CapDescriptor::ReceiverAnswer(pa) => ResolvedCap::Promised(pa.clone()),
        CapDescriptor::ThirdPartyHosted { .. } => {
            log::warn!("third-party vine capability descriptor is not locally resolvable");
            ResolvedCap::None
        }
    }
}

/// Resolves a descriptor found inside a payload *this peer already sent*
/// (a stored [`crate::tables::ResolvedAnswer`]), where the sender/receiver
/// roles are the opposite of an inbound descriptor: `sender_hosted` names
/// one of *our* exports, `receiver_hosted` names one of the remote's
/// exports that we hold as an import.
pub fn resolve_own_descriptor(desc: &CapDescriptor) -> ResolvedCap {
    match desc {
        CapDescriptor::None => ResolvedCap::None,
        CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => ResolvedCap::Exported(*id),
        CapDescriptor::ReceiverHosted(id) => ResolvedCap::Imported(*id),
        CapDescriptor::ReceiverAnswer(pa) => ResolvedCap::Promised(pa.clone()),
        CapDescriptor::ThirdPartyHosted { .. } => ResolvedCap::None,
    }
}

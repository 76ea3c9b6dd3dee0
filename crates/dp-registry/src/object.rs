//! The per-handle object record stored in the registry.

use crate::FutureState;
use dp_codec::{DataArraySpec, ObjectKind, ParamValue};
use std::collections::HashMap;

/// The bytes and layout backing a `Data` managed object (§3 "Data array").
/// Lives on the registry rather than in a separate crate: a data array has
/// no behavior beyond storage, so it doesn't earn its own component the way
/// the framebuffer's tile state does.
#[derive(Debug, Clone)]
pub struct DataArrayState {
    pub spec: DataArraySpec,
    pub shared: bool,
    pub bytes: Vec<u8>,
}

/// Kind-specific payload carried alongside the common name→value param bag.
///
/// Most kinds are plain named-parameter bags to the registry; the exceptions
/// are objects with behavior or storage the registry itself must expose
/// atomically without holding the map lock across a blocking wait (`Future`)
/// or that the codec needs a home for (`Data`). Framebuffer pixel/tile state
/// is deliberately NOT modeled here: it lives in `dp-framebuffer`, keyed by
/// the same handle, so C2 stays below C6 in the dependency order.
#[derive(Debug)]
pub enum ObjectPayload {
    Bag,
    Future(FutureState),
    Data(DataArrayState),
}

impl ObjectPayload {
    fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Future => ObjectPayload::Future(FutureState::new()),
            _ => ObjectPayload::Bag,
        }
    }
}

/// A single managed object: its kind, refcount, named parameters, the
/// dirty/committed pair, and any kind-specific payload.
#[derive(Debug)]
pub struct ManagedObject {
    pub kind: ObjectKind,
    pub refcount: u32,
    pub params: HashMap<String, ParamValue>,
    pub dirty: bool,
    pub committed: bool,
    pub payload: ObjectPayload,
}

impl ManagedObject {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            refcount: 1,
            params: HashMap::new(),
            // A freshly created object always needs at least one commit
            // before use, even with no parameters set.
            dirty: true,
            committed: false,
            payload: ObjectPayload::for_kind(kind),
        }
    }

    pub fn future(&self) -> Option<&FutureState> {
        match &self.payload {
            ObjectPayload::Future(f) => Some(f),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&DataArrayState> {
        match &self.payload {
            ObjectPayload::Data(d) => Some(d),
            _ => None,
        }
    }
}

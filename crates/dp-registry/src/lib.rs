//! C2: the per-rank handle registry. A process-wide table from [`Handle`] to
//! a [`ManagedObject`], protected by one shared/exclusive lock (reads share,
//! writes are exclusive — see §5's shared-resource policy).

mod future_state;
mod object;

pub use future_state::FutureState;
pub use object::{DataArrayState, ManagedObject, ObjectPayload};

use dp_codec::{DataArraySpec, ObjectKind, ParamValue};
use dp_handle::{Handle, HandleAllocator};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handle {0} already registered")]
    Duplicate(Handle),
    #[error("handle {0} not found")]
    NotFound(Handle),
    #[error("handle {0} has kind {actual:?}, expected {expected:?}", actual = .1, expected = .2)]
    TypeMismatch(Handle, ObjectKind, ObjectKind),
    #[error("handle {0} is not committed")]
    Uncommitted(Handle),
}

/// Process-wide handle → object table for one rank.
#[derive(Default)]
pub struct Registry {
    objects: RwLock<HashMap<Handle, ManagedObject>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a fresh handle. Host-only: workers never call this, they only
    /// materialize handles named by a command they receive.
    pub fn allocate(alloc: &mut HandleAllocator) -> Handle {
        alloc.allocate()
    }

    /// Register a freshly created object under `handle`. Fails if the handle
    /// is already live — the host never issues a command referring to a
    /// handle it has not yet allocated, so a collision here means a bug in
    /// the caller or a replayed command.
    pub fn assign(&self, handle: Handle, kind: ObjectKind) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        if objects.contains_key(&handle) {
            return Err(RegistryError::Duplicate(handle));
        }
        objects.insert(handle, ManagedObject::new(kind));
        tracing::trace!(target: "registry", ?handle, ?kind, "assign");
        Ok(())
    }

    /// Register a freshly created `Data` object, storing its spec and bytes
    /// directly on the registry record (see [`object::DataArrayState`]).
    pub fn assign_data(
        &self,
        handle: Handle,
        spec: DataArraySpec,
        shared: bool,
        bytes: Vec<u8>,
    ) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        if objects.contains_key(&handle) {
            return Err(RegistryError::Duplicate(handle));
        }
        let mut obj = ManagedObject::new(ObjectKind::Data);
        obj.payload = ObjectPayload::Data(DataArrayState {
            spec,
            shared,
            bytes,
        });
        objects.insert(handle, obj);
        tracing::trace!(target: "registry", ?handle, "assign_data");
        Ok(())
    }

    /// Copy `src`'s bytes into `dst` at a flattened element offset derived
    /// from `dst_offset` and `dst`'s own strides (§4.3 `CopyData`).
    pub fn copy_data(
        &self,
        dst: Handle,
        dst_offset: [u32; 3],
        src: Handle,
    ) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        let src_bytes = {
            let src_obj = objects.get(&src).ok_or(RegistryError::NotFound(src))?;
            match &src_obj.payload {
                ObjectPayload::Data(d) => d.bytes.clone(),
                _ => return Err(RegistryError::TypeMismatch(src, src_obj.kind, ObjectKind::Data)),
            }
        };
        let dst_obj = objects.get_mut(&dst).ok_or(RegistryError::NotFound(dst))?;
        let dst_data = match &mut dst_obj.payload {
            ObjectPayload::Data(d) => d,
            _ => return Err(RegistryError::TypeMismatch(dst, dst_obj.kind, ObjectKind::Data)),
        };
        let (sx, sy, sz) = dst_data.spec.resolved_strides();
        let elem = dst_data.spec.element_type.packed_size().unwrap_or(1) as u32;
        let base = dst_offset[0] * sx + dst_offset[1] * sy + dst_offset[2] * sz;
        let base = base as usize;
        let end = base + src_bytes.len();
        if end > dst_data.bytes.len() {
            dst_data.bytes.resize(end, 0);
        }
        dst_data.bytes[base..end].copy_from_slice(&src_bytes);
        let _ = elem;
        Ok(())
    }

    /// Borrow an object for reading, type-checked against `expected`.
    pub fn with_object<R>(
        &self,
        handle: Handle,
        expected: ObjectKind,
        f: impl FnOnce(&ManagedObject) -> R,
    ) -> Result<R, RegistryError> {
        let objects = self.objects.read().unwrap();
        let obj = objects.get(&handle).ok_or(RegistryError::NotFound(handle))?;
        if obj.kind != expected {
            return Err(RegistryError::TypeMismatch(handle, obj.kind, expected));
        }
        Ok(f(obj))
    }

    /// Borrow an object for reading without a kind check (used for routing
    /// decisions that need to see the kind of an arbitrary handle).
    pub fn kind_of(&self, handle: Handle) -> Result<ObjectKind, RegistryError> {
        let objects = self.objects.read().unwrap();
        objects
            .get(&handle)
            .map(|o| o.kind)
            .ok_or(RegistryError::NotFound(handle))
    }

    pub fn with_object_mut<R>(
        &self,
        handle: Handle,
        expected: ObjectKind,
        f: impl FnOnce(&mut ManagedObject) -> R,
    ) -> Result<R, RegistryError> {
        let mut objects = self.objects.write().unwrap();
        let obj = objects
            .get_mut(&handle)
            .ok_or(RegistryError::NotFound(handle))?;
        if obj.kind != expected {
            return Err(RegistryError::TypeMismatch(handle, obj.kind, expected));
        }
        Ok(f(obj))
    }

    /// Assign or replace a named parameter. Adjusts the refcount of any
    /// object handle newly referenced or displaced.
    pub fn set_param(
        &self,
        handle: Handle,
        name: String,
        value: ParamValue,
    ) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        {
            let obj = objects
                .get_mut(&handle)
                .ok_or(RegistryError::NotFound(handle))?;
            obj.dirty = true;
        }
        let new_ref = value.referenced_handle();
        let old = {
            let obj = objects.get_mut(&handle).unwrap();
            obj.params.insert(name, value)
        };
        if let Some(target) = new_ref {
            retain_locked(&mut objects, target);
        }
        if let Some(old_value) = old {
            if let Some(old_target) = old_value.referenced_handle() {
                release_locked(&mut objects, old_target);
            }
        }
        Ok(())
    }

    /// Remove a named parameter, decrementing the refcount of the handle it
    /// named, if any.
    pub fn remove_param(&self, handle: Handle, name: &str) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        let removed = {
            let obj = objects
                .get_mut(&handle)
                .ok_or(RegistryError::NotFound(handle))?;
            obj.dirty = true;
            obj.params.remove(name)
        };
        if let Some(value) = removed {
            if let Some(target) = value.referenced_handle() {
                release_locked(&mut objects, target);
            }
        }
        Ok(())
    }

    /// No-op unless the dirty bit is set; otherwise marks the object
    /// committed and clears dirty.
    pub fn commit(&self, handle: Handle) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        let obj = objects
            .get_mut(&handle)
            .ok_or(RegistryError::NotFound(handle))?;
        if obj.dirty {
            obj.committed = true;
            obj.dirty = false;
            tracing::trace!(target: "registry", ?handle, "commit");
        }
        Ok(())
    }

    /// Fails with `Uncommitted` if the object has never been committed —
    /// callers use this to enforce "an uncommitted object must not be used
    /// in rendering".
    pub fn require_committed(&self, handle: Handle) -> Result<(), RegistryError> {
        let objects = self.objects.read().unwrap();
        let obj = objects.get(&handle).ok_or(RegistryError::NotFound(handle))?;
        if obj.committed {
            Ok(())
        } else {
            Err(RegistryError::Uncommitted(handle))
        }
    }

    pub fn retain(&self, handle: Handle) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().unwrap();
        if !objects.contains_key(&handle) {
            return Err(RegistryError::NotFound(handle));
        }
        retain_locked(&mut objects, handle);
        Ok(())
    }

    /// Decrements the refcount, destroying the object (and cascading into
    /// any handle-valued parameters it held) when it reaches zero. Returns
    /// whether this call destroyed the object.
    pub fn release(&self, handle: Handle) -> Result<bool, RegistryError> {
        let mut objects = self.objects.write().unwrap();
        if !objects.contains_key(&handle) {
            return Err(RegistryError::NotFound(handle));
        }
        Ok(release_locked(&mut objects, handle))
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.objects.read().unwrap().contains_key(&handle)
    }

    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        self.objects.read().unwrap().get(&handle).map(|o| o.refcount)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn retain_locked(objects: &mut HashMap<Handle, ManagedObject>, handle: Handle) {
    if let Some(obj) = objects.get_mut(&handle) {
        obj.refcount += 1;
    }
}

/// Decrement and, on reaching zero, remove the object and release every
/// handle-valued parameter it held (cascading destruction, exercised by
/// scenario S5).
fn release_locked(objects: &mut HashMap<Handle, ManagedObject>, handle: Handle) -> bool {
    let destroy = match objects.get_mut(&handle) {
        Some(obj) => {
            obj.refcount = obj.refcount.saturating_sub(1);
            obj.refcount == 0
        }
        None => return false,
    };
    if !destroy {
        return false;
    }
    let obj = objects.remove(&handle).expect("just checked it exists");
    tracing::trace!(target: "registry", ?handle, kind = ?obj.kind, "destroy");
    for value in obj.params.into_values() {
        if let Some(target) = value.referenced_handle() {
            release_locked(objects, target);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_codec::ObjectKind;
    use dp_handle::NULL_HANDLE;

    fn h(rank: u16, counter: u32) -> Handle {
        Handle::new(rank, counter)
    }

    #[test]
    fn new_object_starts_with_refcount_one_and_uncommitted() {
        let reg = Registry::new();
        let handle = h(0, 1);
        reg.assign(handle, ObjectKind::Material).unwrap();
        assert_eq!(reg.refcount(handle), Some(1));
        assert_eq!(
            reg.require_committed(handle),
            Err(RegistryError::Uncommitted(handle))
        );
    }

    #[test]
    fn duplicate_assign_fails() {
        let reg = Registry::new();
        let handle = h(0, 1);
        reg.assign(handle, ObjectKind::Material).unwrap();
        assert_eq!(
            reg.assign(handle, ObjectKind::Material),
            Err(RegistryError::Duplicate(handle))
        );
    }

    #[test]
    fn commit_is_noop_unless_dirty() {
        let reg = Registry::new();
        let handle = h(0, 1);
        reg.assign(handle, ObjectKind::Material).unwrap();
        reg.commit(handle).unwrap();
        assert!(reg.require_committed(handle).is_ok());
        // A second commit with no intervening param change stays committed
        // (and is specified as a no-op, not an error).
        reg.commit(handle).unwrap();
        assert!(reg.require_committed(handle).is_ok());
    }

    #[test]
    fn lookup_unknown_handle_is_not_found() {
        let reg = Registry::new();
        assert_eq!(
            reg.kind_of(NULL_HANDLE),
            Err(RegistryError::NotFound(NULL_HANDLE))
        );
    }

    #[test]
    fn type_mismatch_on_wrong_expected_kind() {
        let reg = Registry::new();
        let handle = h(0, 1);
        reg.assign(handle, ObjectKind::Material).unwrap();
        assert_eq!(
            reg.with_object(handle, ObjectKind::Camera, |_| ()),
            Err(RegistryError::TypeMismatch(
                handle,
                ObjectKind::Material,
                ObjectKind::Camera
            ))
        );
    }

    /// Scenario S5: a material assigned as a model's "material" param stays
    /// alive after the host releases its own reference, and is destroyed
    /// only once the model is released too.
    #[test]
    fn s5_param_reference_keeps_object_alive() {
        let reg = Registry::new();
        let material = h(0, 1);
        let model = h(0, 2);
        reg.assign(material, ObjectKind::Material).unwrap();
        reg.assign(model, ObjectKind::Model).unwrap();

        reg.set_param(
            model,
            "material".to_string(),
            ParamValue::Object(ObjectKind::Material, material),
        )
        .unwrap();
        assert_eq!(reg.refcount(material), Some(2));

        // Host releases its own handle to the material; it survives via the
        // model's reference.
        assert!(!reg.release(material).unwrap());
        assert!(reg.is_live(material));

        // Releasing the model cascades into releasing the material.
        assert!(reg.release(model).unwrap());
        assert!(!reg.is_live(material));
    }

    #[test]
    fn replacing_param_releases_previous_target() {
        let reg = Registry::new();
        let a = h(0, 1);
        let b = h(0, 2);
        let owner = h(0, 3);
        reg.assign(a, ObjectKind::Material).unwrap();
        reg.assign(b, ObjectKind::Material).unwrap();
        reg.assign(owner, ObjectKind::Model).unwrap();

        reg.set_param(
            owner,
            "material".into(),
            ParamValue::Object(ObjectKind::Material, a),
        )
        .unwrap();
        assert_eq!(reg.refcount(a), Some(2));

        reg.set_param(
            owner,
            "material".into(),
            ParamValue::Object(ObjectKind::Material, b),
        )
        .unwrap();
        assert_eq!(reg.refcount(b), Some(2));
        assert_eq!(reg.refcount(a), Some(1));

        reg.release(a).unwrap();
        assert!(!reg.is_live(a));
    }

    #[test]
    fn remove_param_releases_target() {
        let reg = Registry::new();
        let a = h(0, 1);
        let owner = h(0, 2);
        reg.assign(a, ObjectKind::Material).unwrap();
        reg.assign(owner, ObjectKind::Model).unwrap();
        reg.set_param(
            owner,
            "material".into(),
            ParamValue::Object(ObjectKind::Material, a),
        )
        .unwrap();
        reg.remove_param(owner, "material").unwrap();
        assert_eq!(reg.refcount(a), Some(1));
    }

    /// Scenario S2 (shared-data broadcast): the worker's registry holds a
    /// `Data` object whose bytes match what the host sent.
    #[test]
    fn assign_data_stores_spec_and_bytes() {
        use dp_codec::DataType;
        let reg = Registry::new();
        let handle = h(1, 1);
        let spec = DataArraySpec {
            element_type: DataType::Float,
            extents: (4, 4, 1),
            byte_strides: (0, 0, 0),
        };
        let bytes = vec![0xABu8; 64];
        reg.assign_data(handle, spec, true, bytes.clone()).unwrap();
        reg.with_object(handle, ObjectKind::Data, |obj| {
            assert_eq!(obj.data().unwrap().bytes, bytes);
            assert!(obj.data().unwrap().shared);
        })
        .unwrap();
    }

    #[test]
    fn copy_data_writes_into_destination_offset() {
        use dp_codec::DataType;
        let reg = Registry::new();
        let src = h(0, 1);
        let dst = h(0, 2);
        let spec = DataArraySpec {
            element_type: DataType::UChar,
            extents: (8, 1, 1),
            byte_strides: (0, 0, 0),
        };
        reg.assign_data(src, spec, false, vec![7u8; 4]).unwrap();
        reg.assign_data(dst, spec, false, vec![0u8; 8]).unwrap();
        reg.copy_data(dst, [2, 0, 0], src).unwrap();
        reg.with_object(dst, ObjectKind::Data, |obj| {
            assert_eq!(obj.data().unwrap().bytes, vec![0, 0, 7, 7, 7, 7, 0, 0]);
        })
        .unwrap();
    }
}

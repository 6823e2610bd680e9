// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::{collections::BTreeMap, fmt, sync::Arc};

use tracing::debug;

use crate::core::{attribute::AttributeSet, object::{CryptoObject, ObjectHandle}};

/// Objects visible to every session of a slot (TOKEN=true objects).
///
/// The store is owned by the slot behind a `RwLock`; session objects live in
/// their session and never reach it.
#[derive(Default)]
pub(crate) struct ObjectsStore {
    objects: BTreeMap<ObjectHandle, Arc<CryptoObject>>,
}

impl ObjectsStore {
    pub(crate) fn insert(&mut self, object: Arc<CryptoObject>) {
        let handle = object.handle();
        debug!("STORE: inserting token object with handle: {handle}");
        self.objects.insert(handle, object);
    }

    /// Swap in an updated version of an object already in the store.
    pub(crate) fn replace(&mut self, object: Arc<CryptoObject>) -> bool {
        match self.objects.get_mut(&object.handle()) {
            Some(current) => {
                debug!("STORE: updating token object with handle: {}", object.handle());
                *current = object;
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, handle: ObjectHandle) -> Option<Arc<CryptoObject>> {
        self.objects.get(&handle).cloned()
    }

    pub(crate) fn remove(&mut self, handle: ObjectHandle) -> Option<Arc<CryptoObject>> {
        let removed = self.objects.remove(&handle);
        if removed.is_some() {
            debug!("STORE: removed token object with handle: {handle}");
        }
        removed
    }

    /// Handles of the objects matching `query`, in handle order; PRIVATE objects
    /// are skipped unless `authenticated`.
    pub(crate) fn find(&self, query: &AttributeSet, authenticated: bool) -> Vec<ObjectHandle> {
        self.objects
            .values()
            .filter(|object| authenticated || !object.is_private())
            .filter(|object| object.matches(query))
            .map(|object| object.handle())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}

impl fmt::Display for ObjectsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (handle, object) in &self.objects {
            writeln!(f, "{handle}: {} {:?}", object.class(), object.key_type())?;
        }
        Ok(())
    }
}

#[expect(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use cryptoki_sys::CK_OBJECT_HANDLE;

    use super::*;
    use crate::core::attribute::{Attribute, ObjectClass};

    fn object(raw: CK_OBJECT_HANDLE, label: &str, private: bool) -> Arc<CryptoObject> {
        let attributes = AttributeSet::from([
            Attribute::Class(ObjectClass::Data),
            Attribute::Label(label.to_owned()),
            Attribute::Token(true),
            Attribute::Private(private),
        ]);
        Arc::new(CryptoObject::new(ObjectHandle::new(raw), attributes).unwrap())
    }

    #[test]
    fn find_respects_privacy_and_order() {
        let mut store = ObjectsStore::default();
        store.insert(object(7, "b", false));
        store.insert(object(3, "a", true));
        store.insert(object(5, "a", false));
        let query = AttributeSet::from([Attribute::Label("a".to_owned())]);
        assert_eq!(store.find(&query, false), vec![ObjectHandle::new(5)]);
        assert_eq!(
            store.find(&query, true),
            vec![ObjectHandle::new(3), ObjectHandle::new(5)]
        );
        assert_eq!(store.find(&AttributeSet::new(), false).len(), 2);

        assert!(store.replace(object(7, "a", false)));
        assert!(!store.replace(object(9, "a", false)));
        assert_eq!(store.find(&query, false).len(), 2);
        assert!(store.remove(ObjectHandle::new(3)).is_some());
        assert!(store.remove(ObjectHandle::new(3)).is_none());
        assert_eq!(store.len(), 2);
        assert!(store.to_string().starts_with("5: Data"));
    }
}

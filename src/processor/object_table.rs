//! Server-side object table.
//!
//! Objects handed to a client are kept alive here, keyed by an int64 handle,
//! until the client has released every reference it was given.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{PackingError, Result};
use crate::packers::objref::NULL_HANDLE;

/// An object the server can expose to clients by handle.
pub trait ServedObject: Send + Sync + 'static {
    /// IDL class name, answered to QUERY_PROXY_TYPE.
    fn idl_type(&self) -> &'static str;

    /// IDL classes this object's class derives from, for CHECK_CAST.
    fn idl_super_classes(&self) -> &'static [&'static str] {
        &[]
    }
}

thread_local! {
    /// Handles stored by the encodes running on this thread, innermost last,
    /// tagged with the address of the table they went into.
    static STORES: RefCell<Vec<Vec<(usize, i64)>>> = const { RefCell::new(Vec::new()) };
}

struct Slot {
    refcount: u32,
    object: Arc<dyn ServedObject>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Handle-keyed table of exposed objects with per-handle reference counts.
#[derive(Default)]
pub struct ObjectTable {
    slots: Mutex<HashMap<i64, Slot>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<i64, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `obj` and return its handle.
    ///
    /// The handle is stable for as long as the object stays in the table.
    /// Each call counts as one more reference held by the client.
    pub fn store<T: ServedObject>(&self, obj: &Arc<T>) -> i64 {
        let handle = Arc::as_ptr(obj) as *const () as usize as i64;
        let mut slots = self.slots();
        let slot = slots.entry(handle).or_insert_with(|| Slot {
            refcount: 0,
            object: Arc::clone(obj) as Arc<dyn ServedObject>,
            any: Arc::clone(obj) as Arc<dyn Any + Send + Sync>,
        });
        slot.refcount += 1;
        drop(slots);

        STORES.with(|stores| {
            if let Some(frame) = stores.borrow_mut().last_mut() {
                frame.push((self.address(), handle));
            }
        });
        handle
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Run `encode`, and if it fails, take back every reference it stored
    /// in this table.
    ///
    /// Encoding a reply stores the objects it carries. When the reply is
    /// then replaced by an error, the client never learns those handles and
    /// could never release them.
    pub fn undo_stores_on_error<T>(&self, encode: impl FnOnce() -> Result<T>) -> Result<T> {
        STORES.with(|stores| stores.borrow_mut().push(Vec::new()));
        let result = encode();
        let stored = STORES
            .with(|stores| stores.borrow_mut().pop())
            .unwrap_or_default();

        if result.is_err() {
            let address = self.address();
            for (table, handle) in stored {
                if table == address {
                    self.decref(handle);
                }
            }
        } else {
            STORES.with(|stores| {
                if let Some(outer) = stores.borrow_mut().last_mut() {
                    outer.extend(stored);
                }
            });
        }
        result
    }

    /// Look up a handle. `-1` yields `None`, an unknown handle is an error.
    pub fn load(&self, handle: i64) -> Result<Option<Arc<dyn ServedObject>>> {
        if handle == NULL_HANDLE {
            return Ok(None);
        }
        match self.slots().get(&handle) {
            Some(slot) => Ok(Some(Arc::clone(&slot.object))),
            None => Err(PackingError::BadObject(handle).into()),
        }
    }

    /// Like [`load`](Self::load), also checking the object is a `T`.
    pub fn load_as<T: ServedObject>(&self, handle: i64) -> Result<Option<Arc<T>>> {
        if handle == NULL_HANDLE {
            return Ok(None);
        }
        let any = match self.slots().get(&handle) {
            Some(slot) => Arc::clone(&slot.any),
            None => return Err(PackingError::BadObject(handle).into()),
        };
        any.downcast::<T>()
            .map(Some)
            .map_err(|_| PackingError::BadObject(handle).into())
    }

    /// Drop one reference; the entry goes away with the last one.
    ///
    /// Unknown handles are ignored.
    pub fn decref(&self, handle: i64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&handle) {
            if slot.refcount <= 1 {
                slots.remove(&handle);
            } else {
                slot.refcount -= 1;
            }
        }
    }

    /// Add one reference to a live handle. Unknown handles are ignored.
    pub fn incref(&self, handle: i64) {
        if let Some(slot) = self.slots().get_mut(&handle) {
            slot.refcount += 1;
        }
    }

    /// Current reference count, 0 for unknown handles.
    pub fn refcount(&self, handle: i64) -> u32 {
        self.slots().get(&handle).map_or(0, |slot| slot.refcount)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

impl std::fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTable").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Account {
        balance: i32,
    }

    impl ServedObject for Account {
        fn idl_type(&self) -> &'static str {
            "Account"
        }

        fn idl_super_classes(&self) -> &'static [&'static str] {
            &["Entity"]
        }
    }

    struct Ledger;

    impl ServedObject for Ledger {
        fn idl_type(&self) -> &'static str {
            "Ledger"
        }
    }

    #[test]
    fn test_store_is_stable_and_counted() {
        let table = ObjectTable::new();
        let account = Arc::new(Account { balance: 10 });

        let first = table.store(&account);
        let second = table.store(&account);
        assert_eq!(first, second);
        assert_ne!(first, NULL_HANDLE);
        assert_eq!(table.refcount(first), 2);

        let loaded = table.load_as::<Account>(first).unwrap().unwrap();
        assert_eq!(loaded.balance, 10);
        assert_eq!(table.load(first).unwrap().unwrap().idl_type(), "Account");
    }

    #[test]
    fn test_decref_per_exposure() {
        let table = ObjectTable::new();
        let account = Arc::new(Account { balance: 0 });
        let handle = table.store(&account);
        table.store(&account);
        table.incref(handle);

        table.decref(handle);
        table.decref(handle);
        assert_eq!(table.len(), 1);
        table.decref(handle);
        assert!(table.is_empty());
        assert_eq!(Arc::strong_count(&account), 1);

        // already gone
        table.decref(handle);
        table.incref(handle);
        assert!(table.is_empty());
    }

    #[test]
    fn test_null_and_unknown_handles() {
        let table = ObjectTable::new();
        assert!(table.load(NULL_HANDLE).unwrap().is_none());
        assert!(table.load_as::<Ledger>(NULL_HANDLE).unwrap().is_none());
        assert!(matches!(
            table.load(42),
            Err(Error::Packing(PackingError::BadObject(42)))
        ));
    }

    #[test]
    fn test_failed_encode_takes_stores_back() {
        let table = ObjectTable::new();
        let kept = Arc::new(Account { balance: 1 });
        let kept_handle = table.store(&kept);

        let result: Result<()> = table.undo_stores_on_error(|| {
            table.store(&kept);
            table.store(&Arc::new(Ledger));
            Err(Error::packing("second field failed"))
        });
        assert!(result.is_err());
        assert_eq!(table.len(), 1);
        assert_eq!(table.refcount(kept_handle), 1);
    }

    #[test]
    fn test_successful_encode_keeps_stores() {
        let table = ObjectTable::new();
        let account = Arc::new(Account { balance: 1 });

        let handle = table.undo_stores_on_error(|| Ok(table.store(&account))).unwrap();
        assert_eq!(table.refcount(handle), 1);

        // an inner success still rolls back with a failing outer encode
        let result: Result<()> = table.undo_stores_on_error(|| {
            table.undo_stores_on_error(|| Ok(table.store(&account)))?;
            Err(Error::packing("outer failed"))
        });
        assert!(result.is_err());
        assert_eq!(table.refcount(handle), 1);
    }

    #[test]
    fn test_load_as_wrong_class() {
        let table = ObjectTable::new();
        let handle = table.store(&Arc::new(Ledger));
        assert!(matches!(
            table.load_as::<Account>(handle),
            Err(Error::Packing(PackingError::BadObject(_)))
        ));
    }
}

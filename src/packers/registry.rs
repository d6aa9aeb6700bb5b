//! Type id registry.
//!
//! Built once per service or client and read-only afterwards, so lookups
//! take no locks. Built-in ids (below 900) are always present; service ids
//! are added through [`RegistryBuilder`].

use std::collections::HashMap;
use std::sync::Arc;

use super::containers::{DynMapOf, DynSeqOf};
use super::heteromap::HeteroMapPacker;
use super::primitives::{ids, Bool, Buffer, Date, Float, Int16, Int32, Int64, Int8, Null, Str};
use super::DynPacker;
use crate::error::{Error, Result};

/// Immutable map from type id to packer.
pub struct PackerRegistry {
    builtins: HashMap<i32, Arc<dyn DynPacker>>,
    service: HashMap<i32, Arc<dyn DynPacker>>,
    builtin_heteromap: Arc<HeteroMapPacker>,
    heteromap: Arc<HeteroMapPacker>,
}

impl PackerRegistry {
    /// Registry with built-in types only.
    pub fn builtin() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a packer by id, built-in ids first.
    pub fn get(&self, id: i32) -> Option<&Arc<dyn DynPacker>> {
        self.builtins.get(&id).or_else(|| self.service.get(&id))
    }

    /// Like [`get`](Self::get), but an unknown id is a protocol error.
    pub fn lookup(&self, id: i32) -> Result<&Arc<dyn DynPacker>> {
        self.resolve(id, false)
    }

    pub(crate) fn resolve(&self, id: i32, builtin_only: bool) -> Result<&Arc<dyn DynPacker>> {
        let found = if builtin_only {
            self.builtins.get(&id)
        } else {
            self.get(id)
        };
        found.ok_or_else(|| Error::protocol(format!("unknown type id: {}", id)))
    }

    /// The service heterogeneous map packer (id 999).
    pub fn heteromap(&self) -> &HeteroMapPacker {
        &self.heteromap
    }

    /// The built-in heterogeneous map packer (id 998).
    pub fn builtin_heteromap(&self) -> &HeteroMapPacker {
        &self.builtin_heteromap
    }

    /// Ids registered by the service, in ascending order.
    pub fn service_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.service.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for PackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackerRegistry")
            .field("builtins", &self.builtins.len())
            .field("service_ids", &self.service_ids())
            .finish()
    }
}

/// Collects service packers before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    service: Vec<Arc<dyn DynPacker>>,
}

impl RegistryBuilder {
    /// Register a service packer under its own id.
    pub fn register<P: DynPacker + 'static>(mut self, packer: P) -> Self {
        self.service.push(Arc::new(packer));
        self
    }

    pub fn register_arc(mut self, packer: Arc<dyn DynPacker>) -> Self {
        self.service.push(packer);
        self
    }

    /// Freeze the registry.
    ///
    /// A service packer reusing a built-in id is ignored in favour of the
    /// built-in, and a later registration of the same id replaces an earlier one.
    pub fn build(self) -> Arc<PackerRegistry> {
        Arc::new_cyclic(|weak| {
            let builtin_heteromap = Arc::new(HeteroMapPacker::new(
                ids::BUILTIN_HETERO_MAP,
                weak.clone(),
                true,
            ));
            let heteromap = Arc::new(HeteroMapPacker::new(ids::HETERO_MAP, weak.clone(), false));

            let mut builtins = builtin_packers();
            builtins.insert(ids::BUILTIN_HETERO_MAP, builtin_heteromap.clone());

            let mut service: HashMap<i32, Arc<dyn DynPacker>> = HashMap::new();
            service.insert(ids::HETERO_MAP, heteromap.clone());
            for packer in self.service {
                let id = packer.packer_id();
                if builtins.contains_key(&id) {
                    tracing::warn!(id, "service packer shadows a built-in id, ignored");
                    continue;
                }
                service.insert(id, packer);
            }

            PackerRegistry {
                builtins,
                service,
                builtin_heteromap,
                heteromap,
            }
        })
    }
}

fn builtin_packers() -> HashMap<i32, Arc<dyn DynPacker>> {
    let int8: Arc<dyn DynPacker> = Arc::new(Int8);
    let boolean: Arc<dyn DynPacker> = Arc::new(Bool);
    let int16: Arc<dyn DynPacker> = Arc::new(Int16);
    let int32: Arc<dyn DynPacker> = Arc::new(Int32);
    let int64: Arc<dyn DynPacker> = Arc::new(Int64);
    let float: Arc<dyn DynPacker> = Arc::new(Float);
    let buffer: Arc<dyn DynPacker> = Arc::new(Buffer);
    let date: Arc<dyn DynPacker> = Arc::new(Date);
    let string: Arc<dyn DynPacker> = Arc::new(Str);

    let elements = [&int8, &boolean, &int16, &int32, &int64, &float, &buffer, &date, &string];

    let mut map: HashMap<i32, Arc<dyn DynPacker>> = HashMap::new();
    for (offset, elem) in (0i32..).zip(elements) {
        let list = DynSeqOf::list(ids::LIST_OF_INT8 + offset, Arc::clone(elem));
        let set = DynSeqOf::set(ids::SET_OF_INT8 + offset, Arc::clone(elem));
        map.insert(list.packer_id(), Arc::new(list));
        map.insert(set.packer_id(), Arc::new(set));
    }

    let pairs = [
        (ids::MAP_OF_INT32_INT32, &int32, &int32),
        (ids::MAP_OF_INT32_STR, &int32, &string),
        (ids::MAP_OF_STR_INT32, &string, &int32),
        (ids::MAP_OF_STR_STR, &string, &string),
    ];
    for (id, key, value) in pairs {
        map.insert(id, Arc::new(DynMapOf::new(id, Arc::clone(key), Arc::clone(value))));
    }

    for elem in elements {
        map.insert(elem.packer_id(), Arc::clone(elem));
    }
    map.insert(ids::NULL, Arc::new(Null));
    map
}

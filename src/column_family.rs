//! Column families: named keyspaces, each with its own memtables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memtable::{Memtable, MemtableList};

pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// State of one column family, guarded by the database mutex.
#[derive(Debug)]
pub struct ColumnFamilyData {
    id: u32,
    name: String,
    mem: Arc<Memtable>,
    imm: MemtableList,
    /// WAL segments older than this hold nothing this family still needs.
    log_number: u64,
    dropped: bool,
}

impl ColumnFamilyData {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mem(&self) -> &Arc<Memtable> {
        &self.mem
    }

    pub fn imm(&self) -> &MemtableList {
        &self.imm
    }

    pub fn imm_mut(&mut self) -> &mut MemtableList {
        &mut self.imm
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = self.log_number.max(number);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Seals the mutable memtable and installs `mem` in its place.
    pub fn switch_memtable(&mut self, mem: Arc<Memtable>) -> Arc<Memtable> {
        let sealed = std::mem::replace(&mut self.mem, mem);
        sealed.set_next_log_number(self.mem.log_number());
        self.imm.add(sealed.clone());
        sealed
    }

    /// Oldest WAL segment whose data this family has not flushed.
    pub fn oldest_unflushed_log(&self) -> u64 {
        self.imm
            .iter_newest_first()
            .last()
            .map(|m| m.log_number())
            .unwrap_or_else(|| self.mem.log_number())
            .max(self.log_number)
    }

    pub fn has_unflushed_data(&self) -> bool {
        !self.mem.is_empty() || !self.imm.is_empty()
    }
}

/// What the memtable inserter needs to know about one family.
#[derive(Debug, Clone)]
pub struct CfMemtable {
    pub id: u32,
    pub mem: Arc<Memtable>,
    pub log_number: u64,
}

/// Immutable view of every live family's mutable memtable.
///
/// Rebuilt under the database mutex whenever a memtable is switched or a
/// family is created or dropped; writers use the copy that was current when
/// their group was formed.
#[derive(Debug, Default, Clone)]
pub struct ColumnFamilyMemtables {
    tables: HashMap<u32, CfMemtable>,
}

impl ColumnFamilyMemtables {
    pub fn get(&self, id: u32) -> Option<&CfMemtable> {
        self.tables.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Every column family of an open database, keyed by id.
#[derive(Debug)]
pub struct ColumnFamilySet {
    families: BTreeMap<u32, ColumnFamilyData>,
    by_name: HashMap<String, u32>,
    next_id: u32,
}

impl ColumnFamilySet {
    /// Creates the set holding only the default family.
    pub fn new(default_mem: Arc<Memtable>) -> Self {
        let mut set = Self {
            families: BTreeMap::new(),
            by_name: HashMap::new(),
            next_id: 0,
        };
        set.insert(DEFAULT_COLUMN_FAMILY_NAME, default_mem);
        set
    }

    fn insert(&mut self, name: &str, mem: Arc<Memtable>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.families.insert(
            id,
            ColumnFamilyData {
                id,
                name: name.to_string(),
                log_number: mem.log_number(),
                mem,
                imm: MemtableList::new(),
                dropped: false,
            },
        );
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Adds a family named `name` and returns its id.
    pub fn create(&mut self, name: &str, mem: Arc<Memtable>) -> Result<u32> {
        if self.by_name.contains_key(name) {
            return Err(Error::InvalidArgument(format!(
                "Column family already exists: {}",
                name
            )));
        }
        Ok(self.insert(name, mem))
    }

    /// Marks a family dropped; its memtables are discarded with it.
    pub fn drop_family(&mut self, id: u32) -> Result<ColumnFamilyData> {
        if id == 0 {
            return Err(Error::InvalidArgument(
                "Can't drop default column family".into(),
            ));
        }
        let mut cfd = self
            .families
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("column family {}", id)))?;
        self.by_name.remove(&cfd.name);
        cfd.dropped = true;
        Ok(cfd)
    }

    pub fn get(&self, id: u32) -> Option<&ColumnFamilyData> {
        self.families.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ColumnFamilyData> {
        self.families.get_mut(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnFamilyData> {
        self.families.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ColumnFamilyData> {
        self.families.values_mut()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn memtables(&self) -> ColumnFamilyMemtables {
        ColumnFamilyMemtables {
            tables: self
                .families
                .values()
                .map(|cfd| {
                    (
                        cfd.id,
                        CfMemtable {
                            id: cfd.id,
                            mem: cfd.mem.clone(),
                            log_number: cfd.log_number,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Oldest WAL segment any family still needs for unflushed data.
    pub fn min_log_number_to_keep(&self) -> u64 {
        self.families
            .values()
            .map(ColumnFamilyData::oldest_unflushed_log)
            .min()
            .unwrap_or(0)
    }

    /// Oldest WAL segment holding a prepared section referenced by a memtable.
    pub fn min_log_containing_prep(&self) -> u64 {
        self.families
            .values()
            .flat_map(|cfd| {
                std::iter::once(cfd.mem.min_log_containing_prep())
                    .chain(std::iter::once(cfd.imm.min_log_containing_prep()))
            })
            .filter(|&log| log != 0)
            .min()
            .unwrap_or(0)
    }

    /// Total sealed memtables across families.
    pub fn num_immutable(&self) -> usize {
        self.families.values().map(|cfd| cfd.imm.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::ValueKind;

    fn mem(id: u64, log: u64) -> Arc<Memtable> {
        Arc::new(Memtable::new(id, log, 1 << 20, None))
    }

    #[test]
    fn test_create_and_drop() -> Result<()> {
        let mut set = ColumnFamilySet::new(mem(1, 1));
        let id = set.create("users", mem(2, 1))?;
        assert_eq!(id, 1);
        assert_eq!(set.id_of("users"), Some(1));
        assert!(set.create("users", mem(3, 1)).is_err());

        let dropped = set.drop_family(id)?;
        assert!(dropped.is_dropped());
        assert!(set.get(id).is_none());
        assert!(set.memtables().get(id).is_none());
        assert!(set.drop_family(0).is_err());
        Ok(())
    }

    #[test]
    fn test_switch_tracks_oldest_log() -> Result<()> {
        let mut set = ColumnFamilySet::new(mem(1, 4));
        let cfd = set.get_mut(0).expect("default family");
        cfd.mem()
            .add(1, ValueKind::Value, b"k", b"v", None)?;

        let sealed = cfd.switch_memtable(mem(2, 5));
        assert!(sealed.is_frozen());
        assert_eq!(sealed.next_log_number(), 5);
        assert_eq!(set.min_log_number_to_keep(), 4);

        let cfd = set.get_mut(0).expect("default family");
        let picked = cfd.imm_mut().pick_memtables_to_flush();
        let ids: Vec<_> = picked.iter().map(|m| m.id()).collect();
        cfd.imm_mut().remove_flushed(&ids);
        cfd.set_log_number(5);
        assert_eq!(set.min_log_number_to_keep(), 5);
        Ok(())
    }
}

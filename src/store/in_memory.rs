use std::collections::hash_map::Entry;
use std::sync::RwLock;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::store::{Record, Table};


/// A [Table] that keeps its records in a hash map. This is the store for tests and for
///  deployments that do not need to survive a restart.
pub struct InMemoryTable<R: Record> {
    records: RwLock<FxHashMap<R::Key, R>>,
}

impl <R: Record> Default for InMemoryTable<R> {
    fn default() -> Self {
        InMemoryTable {
            records: RwLock::new(FxHashMap::default()),
        }
    }
}

impl <R: Record> Table<R> for InMemoryTable<R> {
    fn insert(&self, record: R) -> anyhow::Result<()> {
        match self.records.write().unwrap().entry(record.key()) {
            Entry::Occupied(e) => bail!("record with key {:?} exists already", e.key()),
            Entry::Vacant(e) => {
                e.insert(record);
                Ok(())
            }
        }
    }

    fn get(&self, key: &R::Key) -> anyhow::Result<Option<R>> {
        Ok(self.records.read().unwrap().get(key).cloned())
    }

    fn update(&self, record: R) -> anyhow::Result<()> {
        match self.records.write().unwrap().get_mut(&record.key()) {
            None => bail!("updating record with key {:?} which does not exist", record.key()),
            Some(existing) => {
                *existing = record;
                Ok(())
            }
        }
    }

    fn delete(&self, key: &R::Key) -> anyhow::Result<Option<R>> {
        Ok(self.records.write().unwrap().remove(key))
    }

    fn find(&self, predicate: &dyn Fn(&R) -> bool) -> anyhow::Result<Vec<R>> {
        Ok(self.records.read().unwrap()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }

    fn modify(&self, key: &R::Key, f: &mut dyn FnMut(&mut R)) -> anyhow::Result<Option<R>> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(key) {
            None => Ok(None),
            Some(record) => {
                f(record);
                Ok(Some(record.clone()))
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// An [InMemoryTable] that counts `find` calls and fails inserts on request
    pub struct InstrumentedTable<R: Record> {
        inner: InMemoryTable<R>,
        pub fail_inserts: AtomicBool,
        pub num_finds: AtomicUsize,
    }

    impl <R: Record> Default for InstrumentedTable<R> {
        fn default() -> Self {
            InstrumentedTable {
                inner: InMemoryTable::default(),
                fail_inserts: AtomicBool::new(false),
                num_finds: AtomicUsize::new(0),
            }
        }
    }

    impl <R: Record> InstrumentedTable<R> {
        pub fn set_failing_inserts(&self, failing: bool) {
            self.fail_inserts.store(failing, Ordering::SeqCst);
        }

        pub fn take_num_finds(&self) -> usize {
            self.num_finds.swap(0, Ordering::SeqCst)
        }
    }

    impl <R: Record> Table<R> for InstrumentedTable<R> {
        fn insert(&self, record: R) -> anyhow::Result<()> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                bail!("simulated failure inserting {:?}", record.key());
            }
            self.inner.insert(record)
        }

        fn get(&self, key: &R::Key) -> anyhow::Result<Option<R>> {
            self.inner.get(key)
        }

        fn update(&self, record: R) -> anyhow::Result<()> {
            self.inner.update(record)
        }

        fn delete(&self, key: &R::Key) -> anyhow::Result<Option<R>> {
            self.inner.delete(key)
        }

        fn find(&self, predicate: &dyn Fn(&R) -> bool) -> anyhow::Result<Vec<R>> {
            self.num_finds.fetch_add(1, Ordering::SeqCst);
            self.inner.find(predicate)
        }

        fn modify(&self, key: &R::Key, f: &mut dyn FnMut(&mut R)) -> anyhow::Result<Option<R>> {
            self.inner.modify(key, f)
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    struct Row {
        id: u32,
        value: &'static str,
    }
    impl Record for Row {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn test_insert_get_delete() {
        let table = InMemoryTable::default();
        table.insert(Row { id: 1, value: "a" }).unwrap();
        assert!(table.insert(Row { id: 1, value: "b" }).is_err());
        assert_eq!(table.get(&1).unwrap(), Some(Row { id: 1, value: "a" }));

        assert_eq!(table.delete(&1).unwrap(), Some(Row { id: 1, value: "a" }));
        assert_eq!(table.delete(&1).unwrap(), None);
        assert_eq!(table.get(&1).unwrap(), None);
    }

    #[test]
    fn test_update_requires_existing() {
        let table = InMemoryTable::default();
        assert!(table.update(Row { id: 1, value: "a" }).is_err());
        table.insert(Row { id: 1, value: "a" }).unwrap();
        table.update(Row { id: 1, value: "b" }).unwrap();
        assert_eq!(table.get(&1).unwrap().unwrap().value, "b");
    }

    #[test]
    fn test_find_and_modify() {
        let table = InMemoryTable::default();
        for id in 1..=5 {
            table.insert(Row { id, value: if id % 2 == 0 { "even" } else { "odd" } }).unwrap();
        }

        let mut even = table.find(&|r: &Row| r.value == "even").unwrap();
        even.sort_by_key(|r| r.id);
        assert_eq!(even.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 4]);

        let modified = table.modify(&3, &mut |r| r.value = "changed").unwrap();
        assert_eq!(modified, Some(Row { id: 3, value: "changed" }));
        assert_eq!(table.modify(&17, &mut |r| r.value = "changed").unwrap(), None);
    }
}

use std::collections::{BTreeMap, HashMap, HashSet};

use runsnake_protocol::{Interner, SharedStr};

use crate::model::memory::{Address, AddressAllocator, RawRecord, RecordKind, TypeSummary};

/// A record while the reduction passes rewrite it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    pub address: Address,
    pub type_name: SharedStr,
    pub name: Option<SharedStr>,
    pub kind: RecordKind,
    pub size: u64,
    /// Outgoing references, possibly to records no longer in the index.
    pub refs: Vec<Address>,
}

impl IndexedRecord {
    pub fn is_object(&self) -> bool {
        matches!(self.kind, RecordKind::Object)
    }
}

/// Address → record for one dump, plus the synthetic-address allocator of
/// the load it belongs to.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: BTreeMap<Address, IndexedRecord>,
    allocator: AddressAllocator,
    names: Interner,
    raw_total: u64,
    duplicates: usize,
    duplicate_bytes: u64,
    types: Vec<TypeSummary>,
}

impl MemoryIndex {
    /// Index raw dump records. A repeated address keeps its first record;
    /// the bytes of the records dropped are tallied apart from the total.
    pub fn build(raw: impl IntoIterator<Item = RawRecord>) -> Self {
        let mut index = Self::default();
        let mut types: HashMap<SharedStr, TypeSummary> = HashMap::new();

        for record in raw {
            let address = Address::Object(record.address);
            if index.records.contains_key(&address) {
                index.duplicates += 1;
                index.duplicate_bytes += record.size;
                log::warn!("duplicate address {address} ({}); keeping the first record", record.type_name);
                continue;
            }
            let type_name = index.names.intern(&record.type_name);
            let name = record.name.as_deref().map(|n| index.names.intern(n));

            let summary = types.entry(type_name.clone()).or_insert_with(|| TypeSummary {
                type_name: type_name.clone(),
                count: 0,
                bytes: 0,
            });
            summary.count += 1;
            summary.bytes += record.size;
            index.raw_total += record.size;

            index.records.insert(
                address,
                IndexedRecord {
                    address,
                    type_name,
                    name,
                    kind: RecordKind::Object,
                    size: record.size,
                    refs: record.refs.into_iter().map(Address::Object).collect(),
                },
            );
        }

        let mut types: Vec<TypeSummary> = types.into_values().collect();
        types.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.type_name.cmp(&b.type_name)));
        index.types = types;

        log::debug!(
            "indexed {} records, {} bytes, {} types, {} duplicates",
            index.records.len(),
            index.raw_total,
            index.types.len(),
            index.duplicates
        );
        index
    }

    pub fn get(&self, address: Address) -> Option<&IndexedRecord> {
        self.records.get(&address)
    }

    pub fn get_mut(&mut self, address: Address) -> Option<&mut IndexedRecord> {
        self.records.get_mut(&address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.records.contains_key(&address)
    }

    pub fn insert(&mut self, record: IndexedRecord) {
        self.records.insert(record.address, record);
    }

    pub fn remove(&mut self, address: Address) -> Option<IndexedRecord> {
        self.records.remove(&address)
    }

    /// Records in address order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexedRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IndexedRecord> {
        self.records.values_mut()
    }

    /// Snapshot of the current addresses, for passes that mutate while
    /// walking.
    pub fn addresses(&self) -> Vec<Address> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn mint(&mut self) -> Address {
        self.allocator.mint()
    }

    pub fn intern(&mut self, s: &str) -> SharedStr {
        self.names.intern(s)
    }

    /// Bytes currently held by indexed records.
    pub fn total_size(&self) -> u64 {
        self.records.values().map(|r| r.size).sum()
    }

    /// Bytes of the dump as it was indexed.
    pub fn raw_total(&self) -> u64 {
        self.raw_total
    }

    /// Records dropped for repeating an address already indexed.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Bytes of the dropped duplicate records, not part of [`raw_total`](Self::raw_total).
    pub fn duplicate_bytes(&self) -> u64 {
        self.duplicate_bytes
    }

    pub fn type_summary(&self) -> &[TypeSummary] {
        &self.types
    }

    pub(crate) fn take_type_summary(&mut self) -> Vec<TypeSummary> {
        std::mem::take(&mut self.types)
    }

    pub fn back_references(&self) -> BackReferences {
        BackReferences::build(self)
    }
}

/// Address → distinct referrers, derived from forward references.
///
/// Never patched in place: passes that rewrite references build a fresh
/// one instead.
#[derive(Debug, Default)]
pub struct BackReferences {
    referrers: HashMap<Address, Vec<Address>>,
}

impl BackReferences {
    /// Referrers are listed in address order. Self references are left out.
    pub fn build(index: &MemoryIndex) -> Self {
        let mut referrers: HashMap<Address, Vec<Address>> = HashMap::new();
        let mut seen = HashSet::new();
        for record in index.iter() {
            seen.clear();
            for &target in &record.refs {
                if target != record.address && seen.insert(target) {
                    referrers.entry(target).or_default().push(record.address);
                }
            }
        }
        Self { referrers }
    }

    pub fn of(&self, address: Address) -> &[Address] {
        self.referrers.get(&address).map_or(&[], Vec::as_slice)
    }

    pub fn count(&self, address: Address) -> usize {
        self.of(address).len()
    }
}

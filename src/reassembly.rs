use crate::packet::container::FragmentHeader;
use crate::util::safe_converter::SafeCast;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct ReassemblyEntry {
    created_at: Instant,
    /// number of fragments, known once the terminal fragment arrived
    total: Option<u16>,
    fragments: BTreeMap<u16, Vec<u8>>,
}

impl ReassemblyEntry {
    fn is_complete(&self) -> bool {
        match self.total {
            Some(total) => self.fragments.len() == total.safe_cast(),
            None => false,
        }
    }

    fn assemble(self) -> Vec<u8> {
        let len = self.fragments.values().map(|f| f.len()).sum();
        let mut result = Vec::with_capacity(len);
        for fragment in self.fragments.into_values() {
            result.extend_from_slice(&fragment);
        }
        result
    }
}

/// Collects the fragments of a single peer's fragmented payloads until they are complete.
///
/// Fragment groups are identified by their fragmentation id, so several master payloads can
///  be in reassembly at the same time. A group that does not complete within the reassembly
///  timeout is discarded and never delivered.
pub struct FragmentReassembler {
    max_open_groups: usize,
    entries: FxHashMap<u32, ReassemblyEntry>,
}

impl FragmentReassembler {
    pub fn new(max_open_groups: usize) -> FragmentReassembler {
        FragmentReassembler {
            max_open_groups,
            entries: FxHashMap::default(),
        }
    }

    pub fn num_open_groups(&self) -> usize {
        self.entries.len()
    }

    /// Stores a fragment, returning the master payload if this fragment completed its group.
    ///
    /// The second element of the result lists fragmentation ids of groups that were evicted
    ///  to make room for a new group.
    pub fn on_fragment(&mut self, header: &FragmentHeader, payload: &[u8], now: Instant) -> (Option<Vec<u8>>, Vec<u32>) {
        let mut evicted = Vec::new();
        if !self.entries.contains_key(&header.fragmentation_id) {
            while self.entries.len() >= self.max_open_groups {
                match self.oldest_group() {
                    Some(oldest) => {
                        debug!("too many open fragment groups - evicting group {}", oldest);
                        self.entries.remove(&oldest);
                        evicted.push(oldest);
                    }
                    None => break,
                }
            }
        }

        let entry = self.entries.entry(header.fragmentation_id)
            .or_insert_with(|| ReassemblyEntry {
                created_at: now,
                total: None,
                fragments: BTreeMap::new(),
            });

        if header.is_last {
            let total = header.index + 1;
            match entry.total {
                Some(known) if known != total => {
                    warn!("fragment group {}: conflicting terminal fragments {} and {} - dropping fragment", header.fragmentation_id, known - 1, header.index);
                    return (None, evicted);
                }
                _ => {}
            }
            if let Some((&highest, _)) = entry.fragments.last_key_value() {
                if highest >= total {
                    warn!("fragment group {}: terminal fragment {} is below already received fragment {} - dropping fragment", header.fragmentation_id, header.index, highest);
                    return (None, evicted);
                }
            }
            entry.total = Some(total);
        }
        else if let Some(total) = entry.total {
            if header.index >= total {
                warn!("fragment group {}: fragment {} is beyond the terminal fragment - dropping", header.fragmentation_id, header.index);
                return (None, evicted);
            }
        }

        if entry.fragments.contains_key(&header.index) {
            trace!("fragment group {}: duplicate fragment {} - ignoring", header.fragmentation_id, header.index);
            return (None, evicted);
        }
        entry.fragments.insert(header.index, payload.to_vec());

        if entry.is_complete() {
            let entry = self.entries.remove(&header.fragmentation_id)
                .expect("entry was just accessed");
            trace!("fragment group {} complete with {} fragments", header.fragmentation_id, entry.fragments.len());
            return (Some(entry.assemble()), evicted);
        }
        (None, evicted)
    }

    /// Removes all groups that were started longer than `timeout` ago, returning their ids
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<u32> {
        let expired: Vec<u32> = self.entries.iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) > timeout)
            .map(|(&id, _)| id)
            .collect();

        for id in &expired {
            debug!("fragment group {} timed out - discarding partial payload", id);
            self.entries.remove(id);
        }
        expired
    }

    fn oldest_group(&self) -> Option<u32> {
        self.entries.iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(&id, _)| id)
    }
}

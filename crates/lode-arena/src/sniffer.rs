//! Allocation event log for diagnosing heap misuse.
//!
//! An [`ArenaSniffer`] is attached to a heap when
//! [`HeapConfig::call_tracing`](lode_core::HeapConfig) is set. It records
//! every allocation and backout with the caller's source location, so that a
//! corrupted address can be traced back to the code that allocated and
//! freed it.
//!
//! Recording is best-effort: if the log itself cannot grow, the event is
//! dropped and the log is flagged incomplete. A diagnostic failure never
//! turns a successful allocation into an error.

use std::fmt;
use std::panic::Location;

use lode_core::{Address, AddressRange, FaultSite, SharedInjector};

use crate::guard::BoundaryGuard;
use crate::tags::{AllocationKind, ValidationTags};

/// Kind of a logged heap event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Memory handed out.
    Alloc,
    /// Memory backed out.
    Free,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc => f.pad("Alloc"),
            Self::Free => f.pad("Free"),
        }
    }
}

/// One logged allocation or backout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnifferEvent {
    /// What happened.
    pub kind: EventKind,
    /// The bytes involved, at their rounded (actual) size.
    pub memory: AddressRange,
    /// Size the caller asked for.
    pub requested_size: usize,
    /// Where the call was made.
    pub location: &'static Location<'static>,
    /// For a free, where the matching allocation was made, when known.
    pub alloc_location: Option<&'static Location<'static>>,
}

impl SnifferEvent {
    fn matches_alloc_of(&self, free: &SnifferEvent) -> bool {
        self.kind == EventKind::Alloc
            && self.memory.base() == free.memory.base()
            && self.requested_size == free.requested_size
    }
}

impl fmt::Display for SnifferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<5} {} requested {:#x} actual {:#x} at {}",
            self.kind,
            self.memory.base(),
            self.requested_size,
            self.memory.size(),
            self.location
        )?;
        if let Some(alloc) = self.alloc_location {
            write!(f, " (allocated at {alloc})")?;
        }
        Ok(())
    }
}

/// Per-heap allocation event log.
#[derive(Debug, Default)]
pub struct ArenaSniffer {
    /// Oldest first; iteration for callers is newest first.
    events: Vec<SnifferEvent>,
    incomplete: bool,
    injector: Option<SharedInjector>,
}

impl ArenaSniffer {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult `injector` at [`FaultSite::SnifferRecord`] before recording.
    pub fn with_fault_injector(mut self, injector: SharedInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Append an event.
    ///
    /// A free picks up the location of the newest matching allocation. If
    /// the log cannot grow the event is dropped and the log is marked
    /// incomplete.
    pub fn record(
        &mut self,
        kind: EventKind,
        memory: AddressRange,
        requested_size: usize,
        location: &'static Location<'static>,
    ) {
        let injected = self
            .injector
            .as_ref()
            .is_some_and(|i| i.should_fail(FaultSite::SnifferRecord));
        if injected || self.events.try_reserve(1).is_err() {
            if !self.incomplete {
                tracing::warn!(%memory, "sniffer could not record event, log is now incomplete");
            }
            self.incomplete = true;
            return;
        }

        let mut event = SnifferEvent {
            kind,
            memory,
            requested_size,
            location,
            alloc_location: None,
        };
        if kind == EventKind::Free {
            event.alloc_location = self
                .events
                .iter()
                .rev()
                .find(|e| e.matches_alloc_of(&event))
                .map(|e| e.location);
        }
        self.events.push(event);
    }

    /// Events, newest first.
    pub fn events(&self) -> impl Iterator<Item = &SnifferEvent> {
        self.events.iter().rev()
    }

    /// Number of logged events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether an event was ever dropped.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Drop matched alloc/free pairs.
    ///
    /// Each free is paired with the newest older allocation of the same
    /// address and requested size. Unpaired events keep their order.
    pub fn compact(&mut self) {
        let mut doomed = vec![false; self.events.len()];
        for free in (0..self.events.len()).rev() {
            if doomed[free] || self.events[free].kind != EventKind::Free {
                continue;
            }
            let target = self.events[free];
            let alloc = (0..free)
                .rev()
                .find(|&i| !doomed[i] && self.events[i].matches_alloc_of(&target));
            if let Some(alloc) = alloc {
                doomed[free] = true;
                doomed[alloc] = true;
            }
        }
        let mut index = 0;
        self.events.retain(|_| {
            let keep = !doomed[index];
            index += 1;
            keep
        });
    }

    /// The newest event whose memory contains `address`.
    pub fn find_event(&self, address: Address) -> Option<&SnifferEvent> {
        self.events().find(|e| e.memory.contains(address))
    }

    /// A one-paragraph description of where `address` came from.
    ///
    /// With `tags`, the description also says whether the allocation's
    /// validation tag still matches the log. With `guard`, it says whether
    /// the allocation's guard bytes were overwritten.
    pub fn describe(
        &self,
        address: Address,
        tags: Option<&ValidationTags>,
        guard: Option<&BoundaryGuard<'_>>,
    ) -> Option<String> {
        let event = self.find_event(address)?;
        let mut text = format!(
            "{address} lies {:#x} bytes into {:#x} bytes at {}",
            address.distance_from(event.memory.base()),
            event.memory.size(),
            event.memory.base()
        );
        match event.kind {
            EventKind::Alloc => {
                text.push_str(&format!(", allocated at {}", event.location));
            }
            EventKind::Free => {
                if let Some(alloc) = event.alloc_location {
                    text.push_str(&format!(", allocated at {alloc}"));
                }
                text.push_str(&format!(", later freed at {}", event.location));
            }
        }
        if !tag_matches(event, tags) {
            text.push_str(" (validation tag mismatch: possible corruption)");
        }
        if !guard_intact(event, guard) {
            text.push_str(" (boundary guard overwritten: write past the end)");
        }
        Some(text)
    }

    /// Whether `event` shows no sign of corruption.
    ///
    /// Only allocation events carry a claim that can be checked; frees
    /// always validate. An allocation fails if its validation tag in
    /// `tags` disagrees with the log, or if `guard` finds its guard bytes
    /// overwritten. A `None` check is skipped.
    pub fn validate(
        &self,
        event: &SnifferEvent,
        tags: Option<&ValidationTags>,
        guard: Option<&BoundaryGuard<'_>>,
    ) -> bool {
        tag_matches(event, tags) && guard_intact(event, guard)
    }

    /// Forget every event and the incomplete flag.
    pub fn clear(&mut self) {
        self.events.clear();
        self.incomplete = false;
    }
}

fn tag_matches(event: &SnifferEvent, tags: Option<&ValidationTags>) -> bool {
    if event.kind != EventKind::Alloc {
        return true;
    }
    tags.is_none_or(|tags| {
        tags.get(event.memory.base()).is_some_and(|tag| {
            tag.kind == AllocationKind::Alloc && tag.requested_size == event.requested_size
        })
    })
}

fn guard_intact(event: &SnifferEvent, guard: Option<&BoundaryGuard<'_>>) -> bool {
    if event.kind != EventKind::Alloc {
        return true;
    }
    guard.is_none_or(|guard| {
        !guard.covers(event.memory, event.requested_size)
            || guard.is_intact(event.memory.base(), event.requested_size)
    })
}

impl fmt::Display for ArenaSniffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LoaderHeapEvents (in reverse time order!)")?;
        if self.incomplete {
            writeln!(f, "  (log incomplete: some events were dropped)")?;
        }
        for event in self.events() {
            writeln!(f, "  {event}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lode_core::FaultInjector;

    fn mem(base: usize, size: usize) -> AddressRange {
        AddressRange::new(Address(base), size)
    }

    #[derive(Debug)]
    struct RefuseLog;

    impl FaultInjector for RefuseLog {
        fn should_fail(&self, site: FaultSite) -> bool {
            site == FaultSite::SnifferRecord
        }
    }

    #[test]
    fn events_are_newest_first() {
        let mut sniffer = ArenaSniffer::new();
        sniffer.record(EventKind::Alloc, mem(0x1000, 16), 10, Location::caller());
        sniffer.record(EventKind::Alloc, mem(0x1010, 32), 32, Location::caller());
        let bases: Vec<_> = sniffer.events().map(|e| e.memory.base()).collect();
        assert_eq!(bases, vec![Address(0x1010), Address(0x1000)]);
    }

    #[test]
    fn free_remembers_alloc_location() {
        let mut sniffer = ArenaSniffer::new();
        let here = Location::caller();
        sniffer.record(EventKind::Alloc, mem(0x1000, 16), 10, here);
        sniffer.record(EventKind::Free, mem(0x1000, 16), 10, Location::caller());
        let free = sniffer.events().next().unwrap();
        assert_eq!(free.alloc_location, Some(here));
    }

    #[test]
    fn compact_removes_matched_pairs_only() {
        let mut sniffer = ArenaSniffer::new();
        sniffer.record(EventKind::Alloc, mem(0x1000, 16), 10, Location::caller());
        sniffer.record(EventKind::Alloc, mem(0x1010, 16), 16, Location::caller());
        sniffer.record(EventKind::Free, mem(0x1010, 16), 16, Location::caller());
        // Size mismatch: not a pair.
        sniffer.record(EventKind::Free, mem(0x1000, 16), 12, Location::caller());
        sniffer.compact();
        let kept: Vec<_> = sniffer.events().map(|e| (e.kind, e.requested_size)).collect();
        assert_eq!(kept, vec![(EventKind::Free, 12), (EventKind::Alloc, 10)]);
    }

    #[test]
    fn describe_reports_alloc_and_free_sites() {
        let mut sniffer = ArenaSniffer::new();
        sniffer.record(EventKind::Alloc, mem(0x1000, 32), 32, Location::caller());
        sniffer.record(EventKind::Free, mem(0x1000, 32), 32, Location::caller());
        let text = sniffer.describe(Address(0x1008), None, None).unwrap();
        assert!(text.contains("allocated at"), "{text}");
        assert!(text.contains("later freed at"), "{text}");
        assert!(sniffer.describe(Address(0x2000), None, None).is_none());
    }

    #[test]
    fn validate_compares_against_tags() {
        let mut sniffer = ArenaSniffer::new();
        let mut tags = ValidationTags::new();
        sniffer.record(EventKind::Alloc, mem(0x1000, 32), 30, Location::caller());
        tags.insert(Address(0x1000), 30, Location::caller());
        let event = *sniffer.events().next().unwrap();
        assert!(sniffer.validate(&event, Some(&tags), None));

        tags.insert(Address(0x1000), 8, Location::caller());
        assert!(!sniffer.validate(&event, Some(&tags), None));
        let text = sniffer.describe(Address(0x1000), Some(&tags), None).unwrap();
        assert!(text.contains("mismatch"), "{text}");
    }

    #[test]
    fn refused_record_marks_log_incomplete() {
        let mut sniffer = ArenaSniffer::new().with_fault_injector(Arc::new(RefuseLog));
        sniffer.record(EventKind::Alloc, mem(0x1000, 16), 16, Location::caller());
        assert!(sniffer.is_empty());
        assert!(sniffer.is_incomplete());
        assert!(sniffer.to_string().contains("incomplete"));
        sniffer.clear();
        assert!(!sniffer.is_incomplete());
    }

    #[test]
    fn display_lists_header_then_events() {
        let mut sniffer = ArenaSniffer::new();
        sniffer.record(EventKind::Alloc, mem(0x1000, 16), 16, Location::caller());
        let dump = sniffer.to_string();
        assert!(dump.starts_with("LoaderHeapEvents (in reverse time order!)"));
        assert!(dump.contains("Alloc"));
    }
}

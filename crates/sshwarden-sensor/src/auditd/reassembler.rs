//! Reassembly of multi-record audit events.
//!
//! The kernel splits one logical event across several records sharing a
//! sequence id. Records for one event are contiguous in the stream, so an
//! event is complete when its EOE end marker arrives or when a higher
//! sequence id shows up. Events that never complete -- a truncated
//! stream, a lost record -- are flushed as-is after a timeout.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::record::{AuditRecord, RecordType};

#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Maximum number of incomplete events held at once.
    pub max_in_flight: usize,
    /// How long an incomplete event may wait before being flushed as-is.
    pub event_timeout: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1000,
            event_timeout: Duration::from_secs(2),
        }
    }
}

struct InFlight {
    records: Vec<AuditRecord>,
    first_seen: Instant,
}

/// Groups records by sequence id and emits completed groups in ascending
/// sequence order.
pub struct Reassembler {
    config: ReassemblerConfig,
    in_flight: BTreeMap<u64, InFlight>,
    /// Highest sequence id flushed so far; later records for it are lost.
    last_flushed: Option<u64>,
    lost: u64,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            in_flight: BTreeMap::new(),
            last_flushed: None,
            lost: 0,
        }
    }

    /// Add one record. Returns any groups this arrival completed.
    pub fn push(&mut self, record: AuditRecord) -> Vec<Vec<AuditRecord>> {
        let seq = record.sequence;

        // A record for an already-flushed event arrived too late.
        if self.last_flushed.is_some_and(|last| seq <= last) {
            self.lost += 1;
            return Vec::new();
        }

        let terminal = record.rtype.is_terminal();
        let entry = self.in_flight.entry(seq).or_insert_with(|| InFlight {
            records: Vec::new(),
            first_seen: Instant::now(),
        });
        if record.rtype != RecordType::Eoe {
            entry.records.push(record);
        }

        let mut done = Vec::new();

        // The stream has moved past every lower sequence id.
        let tail = self.in_flight.split_off(&seq);
        let lower = std::mem::replace(&mut self.in_flight, tail);
        for (s, inflight) in lower {
            self.note_flushed(s);
            done.push(inflight.records);
        }

        if terminal {
            if let Some(inflight) = self.in_flight.remove(&seq) {
                self.note_flushed(seq);
                done.push(inflight.records);
            }
        }

        // Capacity bound: force-flush the oldest events.
        while self.in_flight.len() > self.config.max_in_flight {
            if let Some((s, inflight)) = self.in_flight.pop_first() {
                self.note_flushed(s);
                self.lost += 1;
                done.push(inflight.records);
            }
        }

        done
    }

    /// Flush events that have waited longer than the timeout.
    pub fn maintain(&mut self) -> Vec<Vec<AuditRecord>> {
        let timeout = self.config.event_timeout;
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, e)| e.first_seen.elapsed() >= timeout)
            .map(|(s, _)| *s)
            .collect();

        let mut done = Vec::new();
        for seq in expired {
            if let Some(inflight) = self.in_flight.remove(&seq) {
                self.note_flushed(seq);
                done.push(inflight.records);
            }
        }
        done
    }

    /// Flush everything; used when the input stream ends.
    pub fn flush_all(&mut self) -> Vec<Vec<AuditRecord>> {
        let drained = std::mem::take(&mut self.in_flight);
        let mut done = Vec::new();
        for (seq, inflight) in drained {
            self.note_flushed(seq);
            done.push(inflight.records);
        }
        done
    }

    /// Number of records dropped because their event was already flushed
    /// or evicted.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn note_flushed(&mut self, seq: u64) {
        self.last_flushed = Some(self.last_flushed.map_or(seq, |last| last.max(seq)));
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode a log buffer snapshot into events and fan them out to sinks.
// Author: Lukas Bower

//! Buffer consumption.
//!
//! The firmware keeps writing while the host copies the buffer, so the write
//! pointer read with the snapshot is only a hint: records past it may be torn
//! and the region right behind it may already be overwritten. Every
//! comparison below tolerates that race.

use chrono::Local;
use log::{debug, warn};

use crate::fwlog::layout::{
    dwords_from_le_bytes, BufferHeader, EventHeader, LogEvent, HEADER_DWORDS, MAX_EVENT_PARAMS,
};
use crate::sinks::ChunkConsumer;

/// Header and payload of one buffer read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    /// Buffer header as read with the payload.
    pub header: BufferHeader,
    payload: Vec<u32>,
}

impl BufferSnapshot {
    /// Parse a block read of `HEADER_DWORDS + size_in_dwords` dwords.
    pub fn from_le_bytes(bytes: &[u8], size_in_dwords: u32) -> Option<Self> {
        let words = dwords_from_le_bytes(bytes);
        let expected = (HEADER_DWORDS + size_in_dwords) as usize;
        if size_in_dwords == 0 || words.len() < expected {
            return None;
        }
        let header = BufferHeader::parse(&words)?;
        let payload = words[HEADER_DWORDS as usize..expected].to_vec();
        Some(Self { header, payload })
    }

    /// Build a snapshot from an already decoded header and payload.
    pub fn from_parts(header: BufferHeader, payload: Vec<u32>) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        Some(Self { header, payload })
    }

    /// Firmware write cursor.
    pub fn write_ptr(&self) -> u32 {
        self.header.write_ptr
    }

    /// Payload size in dwords.
    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }

    fn word(&self, ptr: u32) -> u32 {
        self.payload[(ptr % self.size()) as usize]
    }
}

/// What one [`BufferConsumer::consume`] call observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Cursor to persist for the next poll.
    pub cursor: u32,
    /// Events fanned out.
    pub events: u32,
    /// Dwords lost to an overrun, zero when none.
    pub missed: u32,
    /// True when the overrun was reported to the sinks.
    pub overrun_reported: bool,
    /// True when a device restart was detected.
    pub restarted: bool,
    /// Contiguous corrupted regions reported.
    pub corrupted_regions: u32,
    /// Dwords the last record claimed beyond the write pointer.
    pub inconsistent: u32,
}

fn for_active(sinks: &[&dyn ChunkConsumer], mut f: impl FnMut(&dyn ChunkConsumer)) {
    for sink in sinks {
        if sink.is_active() {
            f(*sink);
        }
    }
}

/// Turns snapshots into events. Holds no state between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferConsumer;

impl BufferConsumer {
    /// Consume everything between `cursor` and the snapshot's write pointer.
    pub fn consume(
        snapshot: &BufferSnapshot,
        cursor: u32,
        sinks: &[&dyn ChunkConsumer],
    ) -> ConsumeOutcome {
        let write_ptr = snapshot.write_ptr();
        let size = snapshot.size();
        let mut outcome = ConsumeOutcome {
            cursor,
            ..ConsumeOutcome::default()
        };
        if write_ptr == cursor {
            return outcome;
        }

        let now = Local::now();
        for_active(sinks, |s| s.on_start_new_chunk(now));

        let mut rptr = cursor;
        if write_ptr < rptr {
            debug!("write pointer {write_ptr} behind cursor {rptr}: device restarted");
            for_active(sinks, |s| s.report_restart());
            outcome.restarted = true;
            rptr = 0;
        }

        let mut corrupted_entry_expected = false;
        if write_ptr - rptr > size {
            let missed = write_ptr - rptr - size;
            outcome.missed = missed;
            if rptr != 0 {
                warn!("log buffer overrun, {missed} dwords lost");
                for_active(sinks, |s| s.report_overrun(missed));
                outcome.overrun_reported = true;
            }
            rptr = write_ptr - size;
            corrupted_entry_expected = true;
        }

        let mut in_bad_region = false;
        while rptr < write_ptr {
            let header = EventHeader::from_raw(snapshot.word(rptr));
            if !header.is_valid() {
                if !corrupted_entry_expected && !in_bad_region {
                    let raw = header.raw();
                    debug!("corrupted log entry {raw:#010x} at {rptr}");
                    for_active(sinks, |s| s.report_corrupted(raw));
                    outcome.corrupted_regions += 1;
                    in_bad_region = true;
                }
                rptr = rptr.saturating_add(1);
                continue;
            }
            corrupted_entry_expected = false;
            in_bad_region = false;

            let dword_num = header.dword_num();
            let mut params = [0u32; MAX_EVENT_PARAMS];
            for (index, param) in params.iter_mut().take(dword_num as usize).enumerate() {
                *param = snapshot.word(rptr.wrapping_add(1 + index as u32));
            }
            let event = LogEvent::new(
                header.module(),
                header.level(),
                header.string_offset(),
                &params[..dword_num as usize],
            );
            for_active(sinks, |s| s.consume_event(&event));
            outcome.events += 1;
            rptr = rptr.saturating_add(1 + dword_num);
        }

        if rptr > write_ptr {
            let excess = rptr - write_ptr;
            debug!("last record runs {excess} dwords past write pointer {write_ptr}");
            for_active(sinks, |s| s.report_inconsistent(excess));
            outcome.inconsistent = excess;
            rptr = write_ptr;
        }

        for_active(sinks, |s| s.on_end_chunk());
        outcome.cursor = rptr;
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, Local};

    use super::*;
    use crate::device::FwIdentifier;
    use crate::fwlog::layout::{LogLevel, ModuleLevel, NUM_MODULES};
    use crate::sinks::SinkError;

    /// Sink capturing every callback as a string.
    #[derive(Default)]
    pub(crate) struct CaptureSink {
        pub calls: Mutex<Vec<String>>,
        pub inactive: bool,
    }

    impl CaptureSink {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ChunkConsumer for CaptureSink {
        fn on_start_new_chunk(&self, _ts: DateTime<Local>) {
            self.push("start".into());
        }
        fn report_overrun(&self, missed: u32) {
            self.push(format!("overrun {missed}"));
        }
        fn report_restart(&self) {
            self.push("restart".into());
        }
        fn report_corrupted(&self, signature: u32) {
            self.push(format!("corrupted {signature:#x}"));
        }
        fn report_inconsistent(&self, excess: u32) {
            self.push(format!("inconsistent {excess}"));
        }
        fn report_device_removed(&self) {
            self.push("removed".into());
        }
        fn report_device_discovered(&self) {
            self.push("discovered".into());
        }
        fn report_fw_updated(&self, _fw: &FwIdentifier, _levels: &[ModuleLevel; NUM_MODULES]) {
            self.push("fw_updated".into());
        }
        fn consume_event(&self, event: &LogEvent) {
            self.push(format!("event {} {:?}", event.string_offset, event.params()));
        }
        fn on_end_chunk(&self) {
            self.push("end".into());
        }
        fn prepare(&self, _buffer_size: u32) -> Result<(), SinkError> {
            Ok(())
        }
        fn enable(
            &self,
            _levels: &[ModuleLevel; NUM_MODULES],
            _fw: &FwIdentifier,
        ) -> Result<(), SinkError> {
            Ok(())
        }
        fn stop(&self) {}
        fn split(&self) -> Result<(), SinkError> {
            Ok(())
        }
        fn is_active(&self) -> bool {
            !self.inactive
        }
    }

    /// Lay `records` into a ring of `size` dwords starting at `start`,
    /// returning the payload and the resulting write pointer.
    pub(crate) fn fill(size: u32, start: u32, records: &[(u32, &[u32])]) -> (Vec<u32>, u32) {
        let mut payload = vec![0u32; size as usize];
        let mut ptr = start;
        for (offset, params) in records {
            let header = EventHeader::encode(1, LogLevel::Info, *offset, params.len() as u8);
            payload[(ptr % size) as usize] = header.raw();
            ptr += 1;
            for p in params.iter() {
                payload[(ptr % size) as usize] = *p;
                ptr += 1;
            }
        }
        (payload, ptr)
    }

    pub(crate) fn snapshot(write_ptr: u32, payload: Vec<u32>) -> BufferSnapshot {
        let header = BufferHeader {
            write_ptr,
            module_levels: [ModuleLevel::empty(); NUM_MODULES],
        };
        BufferSnapshot::from_parts(header, payload).unwrap()
    }

    fn run(snap: &BufferSnapshot, cursor: u32, sink: &CaptureSink) -> ConsumeOutcome {
        BufferConsumer::consume(snap, cursor, &[sink as &dyn ChunkConsumer])
    }

    #[test]
    fn nothing_new_is_a_no_op() {
        let sink = CaptureSink::default();
        let snap = snapshot(40, vec![0; 64]);
        let outcome = run(&snap, 40, &sink);
        assert_eq!(outcome.cursor, 40);
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn fresh_stream_decodes_to_write_pointer() {
        // 20 records of 1 header + 4 params = 100 dwords
        let records: Vec<(u32, &[u32])> = (0..20).map(|i| (i, &[1u32, 2, 3, 4] as &[u32])).collect();
        let (payload, write_ptr) = fill(1024, 0, &records);
        assert_eq!(write_ptr, 100);
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 0, &sink);
        assert_eq!(outcome.cursor, 100);
        assert_eq!(outcome.events, 20);
        assert_eq!(outcome.missed, 0);
        assert_eq!(outcome.corrupted_regions, 0);
        assert_eq!(outcome.inconsistent, 0);
        assert_eq!(sink.count("event"), 20);
        assert_eq!(sink.calls().first().map(String::as_str), Some("start"));
        assert_eq!(sink.calls().last().map(String::as_str), Some("end"));
    }

    #[test]
    fn overrun_reports_exact_missed_count() {
        let size = 64;
        let records: Vec<(u32, &[u32])> = (0..100).map(|i| (i, &[] as &[u32])).collect();
        let (payload, write_ptr) = fill(size, 0, &records);
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 10, &sink);
        assert_eq!(outcome.missed, 100 - 10 - 64);
        assert!(outcome.overrun_reported);
        assert_eq!(sink.count("overrun 26"), 1);
        assert_eq!(outcome.cursor, 100);
        assert_eq!(outcome.events, 64);
    }

    #[test]
    fn overrun_at_stream_start_is_not_reported() {
        let size = 1024;
        let records: Vec<(u32, &[u32])> = (0..1050).map(|i| (i, &[] as &[u32])).collect();
        let (payload, write_ptr) = fill(size, 0, &records);
        assert_eq!(write_ptr, 1050);
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 0, &sink);
        assert_eq!(outcome.missed, 26);
        assert!(!outcome.overrun_reported);
        assert_eq!(sink.count("overrun"), 0);
        assert_eq!(outcome.cursor, 1050);
    }

    #[test]
    fn debris_after_overrun_is_not_corruption() {
        let size = 32;
        // Cursor lands on the middle of a 3-param record: two param dwords of
        // debris precede the next valid header.
        let mut payload = vec![0u32; size as usize];
        let write_ptr = 100;
        let start = write_ptr - size;
        payload[(start % size) as usize] = 0x1234_5678 & !(0b111 << 29);
        payload[((start + 1) % size) as usize] = 0x0000_0042;
        for ptr in start + 2..write_ptr {
            payload[(ptr % size) as usize] =
                EventHeader::encode(0, LogLevel::Warn, ptr, 0).raw();
        }
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 5, &sink);
        assert_eq!(outcome.missed, 100 - 5 - 32);
        assert_eq!(outcome.corrupted_regions, 0);
        assert_eq!(sink.count("corrupted"), 0);
        assert_eq!(outcome.events, 30);
        assert_eq!(outcome.cursor, write_ptr);
    }

    #[test]
    fn corruption_reported_once_per_region() {
        let (mut payload, write_ptr) = fill(
            64,
            0,
            &[(1, &[][..]), (2, &[][..]), (3, &[][..]), (4, &[][..]), (5, &[][..]), (6, &[][..])],
        );
        // two separate bad regions: dwords 1..3 and dword 4
        payload[1] = 0;
        payload[2] = 0xffff;
        payload[4] = 7;
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 0, &sink);
        assert_eq!(outcome.corrupted_regions, 2);
        assert_eq!(sink.count("corrupted"), 2);
        assert_eq!(outcome.events, 3);
        assert_eq!(outcome.cursor, 6);
    }

    #[test]
    fn restart_resets_cursor_before_decoding() {
        let (payload, write_ptr) = fill(256, 0, &[(7, &[1][..]), (8, &[][..])]);
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 200, &sink);
        assert!(outcome.restarted);
        assert_eq!(sink.count("restart"), 1);
        assert_eq!(outcome.missed, 0);
        assert_eq!(outcome.events, 2);
        assert_eq!(outcome.cursor, 3);
        let calls = sink.calls();
        let restart = calls.iter().position(|c| c == "restart").unwrap();
        let first_event = calls.iter().position(|c| c.starts_with("event")).unwrap();
        assert!(restart < first_event);
    }

    #[test]
    fn restart_past_buffer_size_resyncs_without_overrun() {
        let size = 1024;
        let records: Vec<(u32, &[u32])> = (0..2000).map(|i| (i, &[] as &[u32])).collect();
        let (payload, write_ptr) = fill(size, 0, &records);
        assert_eq!(write_ptr, 2000);
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 5000, &sink);
        assert!(outcome.restarted);
        assert_eq!(sink.count("restart"), 1);
        assert_eq!(outcome.missed, 976);
        assert!(!outcome.overrun_reported);
        assert_eq!(sink.count("overrun"), 0);
        assert_eq!(outcome.corrupted_regions, 0);
        assert_eq!(outcome.events, 1024);
        assert_eq!(outcome.cursor, 2000);
    }

    #[test]
    fn torn_record_clamps_to_write_pointer() {
        let (payload, _) = fill(64, 0, &[(1, &[][..]), (2, &[5, 6, 7][..])]);
        // write pointer published after the header but before its params
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(2, payload), 0, &sink);
        assert_eq!(outcome.inconsistent, 3);
        assert_eq!(sink.count("inconsistent 3"), 1);
        assert_eq!(outcome.cursor, 2);
    }

    #[test]
    fn params_wrap_around_the_ring() {
        let size = 8;
        let (payload, write_ptr) = fill(size, 6, &[(9, &[10, 11, 12][..])]);
        let sink = CaptureSink::default();
        let outcome = run(&snapshot(write_ptr, payload), 6, &sink);
        assert_eq!(outcome.cursor, 10);
        assert_eq!(sink.count("event 9 [10, 11, 12]"), 1);
    }

    #[test]
    fn inactive_sinks_are_skipped() {
        let (payload, write_ptr) = fill(64, 0, &[(1, &[][..])]);
        let sink = CaptureSink {
            inactive: true,
            ..CaptureSink::default()
        };
        let outcome = run(&snapshot(write_ptr, payload), 0, &sink);
        assert_eq!(outcome.events, 1);
        assert!(sink.calls().is_empty());
    }
}

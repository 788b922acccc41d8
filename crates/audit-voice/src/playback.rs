//! Gapless scheduling of inbound model audio.
//!
//! Each chunk starts at `max(now, cursor)` and pushes the cursor by its duration, so
//! back-to-back chunks play without gap or overlap. An interruption drops every
//! scheduled chunk and moves the cursor back to `now`.

use crate::audio::{decode_pcm16, pcm_duration, PlaybackSink};
use crate::error::VoiceResult;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Placement of one chunk on the playback timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub start: Instant,
    pub end: Instant,
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: Option<Instant>,
    scheduled: Vec<ScheduledChunk>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: Instant, duration: Duration) -> ScheduledChunk {
        let start = match self.cursor {
            Some(cursor) if cursor > now => cursor,
            _ => now,
        };
        let chunk = ScheduledChunk {
            start,
            end: start + duration,
        };
        self.cursor = Some(chunk.end);
        self.scheduled.retain(|c| c.end > now);
        self.scheduled.push(chunk);
        chunk
    }

    /// Forget every scheduled chunk; returns how many were still pending.
    pub fn interrupt(&mut self, now: Instant) -> usize {
        let pending = self.scheduled.iter().filter(|c| c.end > now).count();
        self.scheduled.clear();
        self.cursor = Some(now);
        pending
    }

    pub fn cursor(&self) -> Option<Instant> {
        self.cursor
    }

    pub fn is_playing(&self, now: Instant) -> bool {
        self.scheduled.iter().any(|c| c.start <= now && c.end > now)
    }

    pub fn pending(&self, now: Instant) -> usize {
        self.scheduled.iter().filter(|c| c.end > now).count()
    }
}

/// Decodes model audio and feeds the playback device in order.
pub struct Playback {
    sink: Box<dyn PlaybackSink>,
    sample_rate: u32,
    scheduler: PlaybackScheduler,
    closed: bool,
}

impl Playback {
    pub fn new(sink: Box<dyn PlaybackSink>, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            scheduler: PlaybackScheduler::new(),
            closed: false,
        }
    }

    /// Decode and schedule one base64 PCM16 chunk.
    pub fn enqueue(&mut self, data: &str, now: Instant) -> VoiceResult<ScheduledChunk> {
        let samples = decode_pcm16(data)?;
        let chunk = self
            .scheduler
            .schedule(now, pcm_duration(samples.len(), self.sample_rate));
        self.sink.play(samples, self.sample_rate)?;
        Ok(chunk)
    }

    pub fn interrupt(&mut self, now: Instant) {
        let dropped = self.scheduler.interrupt(now);
        if let Err(e) = self.sink.interrupt() {
            warn!("Playback interrupt failed: {}", e);
        }
        debug!(dropped, "playback interrupted");
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Stop and release the device. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.scheduler.interrupt(Instant::now());
        self.sink.close();
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PlaybackSink for RecordingSink {
        fn play(&mut self, samples: Vec<i16>, sample_rate: u32) -> VoiceResult<()> {
            self.log.lock().unwrap().push(format!("play {} @{}", samples.len(), sample_rate));
            Ok(())
        }
        fn interrupt(&mut self) -> VoiceResult<()> {
            self.log.lock().unwrap().push("interrupt".into());
            Ok(())
        }
        fn close(&mut self) {
            self.log.lock().unwrap().push("close".into());
        }
    }

    #[test]
    fn back_to_back_chunks_have_no_gap_or_overlap() {
        let mut s = PlaybackScheduler::new();
        let t0 = Instant::now();
        let mut chunks = Vec::new();
        for i in 0..5 {
            // Arrivals come faster than playback.
            let now = t0 + Duration::from_millis(i * 10);
            chunks.push(s.schedule(now, Duration::from_millis(100)));
        }
        for pair in chunks.windows(2) {
            assert!(pair[1].start >= pair[0].start);
            assert_eq!(pair[1].start, pair[0].end);
        }
        assert_eq!(chunks[0].start, t0);
    }

    #[test]
    fn late_chunk_starts_now() {
        let mut s = PlaybackScheduler::new();
        let t0 = Instant::now();
        let first = s.schedule(t0, Duration::from_millis(50));
        let later = t0 + Duration::from_millis(200);
        let second = s.schedule(later, Duration::from_millis(50));
        assert_eq!(second.start, later);
        assert!(second.start > first.end);
    }

    #[test]
    fn interrupt_resets_cursor_and_drops_pending() {
        let mut s = PlaybackScheduler::new();
        let t0 = Instant::now();
        s.schedule(t0, Duration::from_millis(100));
        s.schedule(t0, Duration::from_millis(100));
        let cut = t0 + Duration::from_millis(30);
        assert!(s.is_playing(cut));
        assert_eq!(s.interrupt(cut), 2);
        assert_eq!(s.cursor(), Some(cut));
        assert!(!s.is_playing(cut));
        let next = s.schedule(cut, Duration::from_millis(10));
        assert_eq!(next.start, cut);
    }

    #[test]
    fn playback_decodes_and_closes_once() {
        let sink = RecordingSink::default();
        let log = sink.log.clone();
        let mut p = Playback::new(Box::new(sink), 24_000);
        let now = Instant::now();
        let chunk = p.enqueue(&crate::audio::encode_pcm16(&[0.1; 2400]), now).unwrap();
        assert_eq!(chunk.end - chunk.start, Duration::from_millis(100));
        p.interrupt(now);
        p.close();
        p.close();
        drop(p);
        assert_eq!(*log.lock().unwrap(), vec!["play 2400 @24000", "interrupt", "close"]);
    }
}

//! Request timing tree (spec §4.J), grounded on `stopwatch.cxx`: a
//! `Stopwatch` records named timestamped events under a budget (16, as in
//! the source's `static_vector`), and can spawn child stopwatches (e.g. one
//! per backend attempt within a request) that dump indented under their
//! parent.

use std::time::Instant;

const MAX_EVENTS: usize = 16;
const MAX_NAME_LEN: usize = 96;

struct Event {
    name: String,
    at: Instant,
}

pub struct Stopwatch {
    name: String,
    start: Instant,
    events: Vec<Event>,
    children: Vec<Stopwatch>,
    enabled: bool,
}

fn truncate_name(name: &str, suffix: Option<&str>) -> String {
    let mut full = name.to_string();
    if let Some(s) = suffix {
        full.push_str(s);
    }
    full.truncate(MAX_NAME_LEN);
    full
}

impl Stopwatch {
    /// Root stopwatch; `enabled` mirrors the process-wide
    /// `stopwatch_is_enabled()` gate so disabled builds pay no allocation
    /// cost beyond this one struct.
    pub fn new_root(name: &str, suffix: Option<&str>, enabled: bool) -> Self {
        Stopwatch {
            name: truncate_name(name, suffix),
            start: Instant::now(),
            events: Vec::new(),
            children: Vec::new(),
            enabled,
        }
    }

    pub fn new_child(&self, name: &str, suffix: Option<&str>) -> Stopwatch {
        Stopwatch {
            name: truncate_name(name, suffix),
            start: Instant::now(),
            events: Vec::new(),
            children: Vec::new(),
            enabled: self.enabled,
        }
    }

    pub fn add_child(&mut self, child: Stopwatch) {
        if self.enabled {
            self.children.push(child);
        }
    }

    /// `RecordEvent()` — silently drops events past `MAX_EVENTS`, matching
    /// the source's full-array no-op.
    pub fn record_event(&mut self, name: &str) {
        if !self.enabled || self.events.len() >= MAX_EVENTS {
            return;
        }
        self.events.push(Event { name: name.to_string(), at: Instant::now() });
    }

    /// `Dump()` — renders this stopwatch and its children as indented
    /// `name init=Nms event=Mms ...` lines relative to `root_time`.
    pub fn dump(&self, root_time: Instant, indent: usize, out: &mut String) {
        if !self.enabled {
            return;
        }
        out.push_str(&" ".repeat(indent));
        out.push_str(&self.name);
        out.push_str(&format!(" init={}ms", (self.start.saturating_duration_since(root_time)).as_millis()));
        for event in &self.events {
            out.push_str(&format!(
                " {}={}ms",
                event.name,
                event.at.saturating_duration_since(self.start).as_millis()
            ));
        }
        out.push('\n');
        for child in &self.children {
            child.dump(root_time, indent + 2, out);
        }
    }

    pub fn root_time(&self) -> Instant {
        self.start
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        if self.enabled {
            let mut out = String::new();
            self.dump(self.start, 0, &mut out);
            tracing::debug!(target: "stopwatch", "{}", out.trim_end());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_beyond_capacity_are_dropped() {
        let mut sw = Stopwatch::new_root("req", None, true);
        for i in 0..MAX_EVENTS + 5 {
            sw.record_event(&format!("e{i}"));
        }
        assert_eq!(sw.events.len(), MAX_EVENTS);
    }

    #[test]
    fn test_disabled_stopwatch_records_nothing() {
        let mut sw = Stopwatch::new_root("req", None, false);
        sw.record_event("x");
        assert!(sw.events.is_empty());
    }

    #[test]
    fn test_name_truncated_to_max_len() {
        let long_name = "x".repeat(200);
        let sw = Stopwatch::new_root(&long_name, None, true);
        assert_eq!(sw.name.len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_dump_includes_child_indentation() {
        let mut root = Stopwatch::new_root("root", None, true);
        let child = root.new_child("child", None);
        root.add_child(child);
        let mut out = String::new();
        root.dump(root.root_time(), 0, &mut out);
        assert!(out.contains("root init="));
        assert!(out.contains("  child init="));
    }
}

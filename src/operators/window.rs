//! Window state machine.
//!
//! [`WindowState`] is a plain struct driven by three inputs: tuple arrival
//! ([`WindowState::on_tuple`]), timer ticks in processing-time mode
//! ([`WindowState::on_tick`]) and end of input ([`WindowState::flush`]). It reads no
//! clock and spawns nothing, so replaying the same ordered input with the same `now`
//! values yields the same windows.
//!
//! # Time windows
//!
//! Tumbling and hopping windows are aligned to the epoch. A tuple belongs to every window
//! whose `[start, end)` contains its assignment time: the event timestamp in event-time
//! mode, the arrival time otherwise.
//!
//! A window fires once the watermark reaches its end. In processing time the watermark is
//! the current time. In event time it is the largest timestamp seen minus the late
//! tolerance; with several input streams it is the minimum of the per-stream values, and
//! a stream that has not produced a tuple yet holds it back.
//!
//! Fired event-time windows are retained while `end + late_tolerance > watermark`. A late
//! tuple for a retained window is merged and the window fires again; a tuple whose
//! windows are all past retention is dropped and counted.
//!
//! # Sliding windows
//!
//! A sliding window ends at each tuple: it fires with every tuple whose assignment time
//! is in `[t - length, t]`.
//!
//! # Count windows
//!
//! Every `interval` tuples (or `length` when no interval is set) the last `length` tuples
//! are emitted. A partial window at end of input is discarded.

use crate::ast::{WindowSpec, WindowType};
use crate::tuple::{Tuple, WindowRange, WindowTuplesSet};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Window parameters.
#[derive(Debug, Clone)]
pub struct WindowConfig {
  /// Window declaration.
  pub spec: WindowSpec,
  /// Assign tuples by event time.
  pub is_event_time: bool,
  /// Allowed lateness in milliseconds (event time only).
  pub late_tolerance: i64,
  /// Streams that feed the window; the event-time watermark waits for all of them.
  pub streams: Vec<String>,
}

/// Result of feeding one tuple.
#[derive(Debug, Default, PartialEq)]
pub struct WindowOutput {
  /// Windows to emit, in firing order.
  pub fired: Vec<WindowTuplesSet>,
  /// True when the tuple was too late for every window it belongs to.
  pub late_dropped: bool,
}

/// The window operator's state.
#[derive(Debug)]
pub struct WindowState {
  config: WindowConfig,
  /// Open time windows.
  pending: BTreeMap<WindowRange, Vec<Arc<Tuple>>>,
  /// Fired event-time windows kept for late merges.
  fired: BTreeMap<WindowRange, Vec<Arc<Tuple>>>,
  /// Buffer of sliding and count windows.
  buffer: VecDeque<Arc<Tuple>>,
  /// Sliding event-time windows waiting for the watermark, by end time.
  sliding_triggers: BTreeMap<i64, usize>,
  /// Largest event time per stream (lower-cased names).
  stream_max: HashMap<String, i64>,
  /// Tuples since the last count window emission.
  since_emit: usize,
}

impl WindowState {
  /// Creates an empty state.
  pub fn new(config: WindowConfig) -> Self {
    let mut stream_max = HashMap::new();
    if config.is_event_time {
      for s in &config.streams {
        stream_max.insert(s.to_lowercase(), i64::MIN);
      }
    }
    Self {
      config,
      pending: BTreeMap::new(),
      fired: BTreeMap::new(),
      buffer: VecDeque::new(),
      sliding_triggers: BTreeMap::new(),
      stream_max,
      since_emit: 0,
    }
  }

  /// The configuration.
  pub fn config(&self) -> &WindowConfig {
    &self.config
  }

  fn is_count(&self) -> bool {
    self.config.spec.window_type == WindowType::Count
  }

  fn is_sliding(&self) -> bool {
    self.config.spec.window_type == WindowType::Sliding
  }

  /// Current event-time watermark, if every stream has reported.
  pub fn watermark(&self) -> Option<i64> {
    if !self.config.is_event_time {
      return None;
    }
    let min = self.stream_max.values().copied().min()?;
    if min == i64::MIN {
      return None;
    }
    Some(min.saturating_sub(self.config.late_tolerance))
  }

  /// Time windows containing `ts`.
  fn assign(&self, ts: i64) -> Vec<WindowRange> {
    let size = self.config.spec.length_ms().max(1);
    let slide = match self.config.spec.window_type {
      WindowType::Hopping => self.config.spec.interval_ms().max(1),
      _ => size,
    };
    let last_start = ts.div_euclid(slide) * slide;
    let count = (size + slide - 1) / slide;
    let mut ranges: Vec<WindowRange> = (0..count)
      .map(|i| {
        let start = last_start - i * slide;
        WindowRange::new(start, start + size)
      })
      .filter(|w| w.contains(ts))
      .collect();
    ranges.sort();
    ranges
  }

  /// Feeds one tuple.
  ///
  /// # Arguments
  ///
  /// * `tuple` - The arriving tuple.
  /// * `now` - Current processing time in milliseconds.
  pub fn on_tuple(&mut self, tuple: Arc<Tuple>, now: i64) -> WindowOutput {
    let ts = if self.config.is_event_time {
      tuple.timestamp
    } else {
      now
    };
    if self.is_count() {
      return WindowOutput {
        fired: self.count_tuple(tuple),
        late_dropped: false,
      };
    }
    if self.is_sliding() {
      return self.sliding_tuple(tuple, ts);
    }

    let mut out = WindowOutput::default();
    let watermark = self.watermark();
    let mut accepted = false;
    for range in self.assign(ts) {
      if let Some(tuples) = self.fired.get_mut(&range) {
        tuples.push(tuple.clone());
        out.fired.push(build_set(range, tuples));
        accepted = true;
      } else if watermark.is_some_and(|w| range.end <= w) {
        if watermark.is_some_and(|w| range.end + self.config.late_tolerance > w) {
          let tuples = vec![tuple.clone()];
          out.fired.push(build_set(range, &tuples));
          self.fired.insert(range, tuples);
          accepted = true;
        }
      } else {
        self.pending.entry(range).or_default().push(tuple.clone());
        accepted = true;
      }
    }
    out.late_dropped = !accepted;

    if self.config.is_event_time {
      let stream = tuple.emitter.to_lowercase();
      let entry = self.stream_max.entry(stream).or_insert(i64::MIN);
      *entry = (*entry).max(ts);
      if let Some(w) = self.watermark() {
        out.fired.extend(self.advance(w));
      }
    }
    out
  }

  /// Fires windows due at processing time `now`.
  pub fn on_tick(&mut self, now: i64) -> Vec<WindowTuplesSet> {
    if self.config.is_event_time || self.is_count() || self.is_sliding() {
      return Vec::new();
    }
    self.advance(now)
  }

  /// The processing time at which the next window fires, if any is open.
  pub fn next_deadline(&self) -> Option<i64> {
    if self.config.is_event_time || self.is_count() || self.is_sliding() {
      return None;
    }
    self.pending.keys().map(|r| r.end).min()
  }

  /// Fires everything still open at end of input.
  pub fn flush(&mut self) -> Vec<WindowTuplesSet> {
    if self.is_count() {
      self.buffer.clear();
      return Vec::new();
    }
    if self.is_sliding() {
      return self.fire_sliding(i64::MAX);
    }
    self.advance(i64::MAX)
  }

  /// Fires pending windows ending at or before `watermark` and evicts expired ones.
  fn advance(&mut self, watermark: i64) -> Vec<WindowTuplesSet> {
    if self.is_sliding() {
      return self.fire_sliding(watermark);
    }
    let mut fired = Vec::new();
    let due: Vec<WindowRange> = self
      .pending
      .keys()
      .take_while(|r| r.end <= watermark)
      .copied()
      .collect();
    for range in due {
      if let Some(tuples) = self.pending.remove(&range) {
        fired.push(build_set(range, &tuples));
        if self.config.is_event_time {
          self.fired.insert(range, tuples);
        }
      }
    }
    let tolerance = self.config.late_tolerance;
    self
      .fired
      .retain(|r, _| r.end.saturating_add(tolerance) > watermark);
    fired
  }

  fn count_tuple(&mut self, tuple: Arc<Tuple>) -> Vec<WindowTuplesSet> {
    let length = self.config.spec.length.max(1) as usize;
    let interval = match self.config.spec.interval {
      i if i > 0 => i as usize,
      _ => length,
    };
    self.buffer.push_back(tuple);
    while self.buffer.len() > length {
      self.buffer.pop_front();
    }
    self.since_emit += 1;
    if self.since_emit < interval {
      return Vec::new();
    }
    self.since_emit = 0;
    let tuples: Vec<Arc<Tuple>> = self.buffer.iter().cloned().collect();
    if interval >= length {
      self.buffer.clear();
    }
    let start = tuples.first().map(|t| t.timestamp).unwrap_or_default();
    let end = tuples.last().map(|t| t.timestamp + 1).unwrap_or_default();
    vec![build_set(WindowRange::new(start, end), &tuples)]
  }

  fn sliding_tuple(&mut self, tuple: Arc<Tuple>, ts: i64) -> WindowOutput {
    let mut out = WindowOutput::default();
    let watermark = self.watermark();
    if let Some(w) = watermark {
      if ts.saturating_add(self.config.late_tolerance) <= w {
        out.late_dropped = true;
        return out;
      }
    }
    let assigned = if tuple.timestamp == ts {
      tuple.clone()
    } else {
      Arc::new(Tuple {
        timestamp: ts,
        ..(*tuple).clone()
      })
    };
    let pos = self
      .buffer
      .iter()
      .rposition(|t| t.timestamp <= ts)
      .map(|p| p + 1)
      .unwrap_or(0);
    self.buffer.insert(pos, assigned);

    if self.config.is_event_time {
      *self.sliding_triggers.entry(ts).or_default() += 1;
      let stream = tuple.emitter.to_lowercase();
      let entry = self.stream_max.entry(stream).or_insert(i64::MIN);
      *entry = (*entry).max(ts);
      if let Some(w) = self.watermark() {
        out.fired = self.fire_sliding(w);
      }
    } else {
      out.fired = vec![self.sliding_set(ts)];
      self.prune_sliding(ts);
    }
    out
  }

  fn sliding_set(&self, end: i64) -> WindowTuplesSet {
    let start = end - self.config.spec.length_ms();
    let tuples: Vec<Arc<Tuple>> = self
      .buffer
      .iter()
      .filter(|t| t.timestamp >= start && t.timestamp <= end)
      .cloned()
      .collect();
    build_set(WindowRange::new(start, end), &tuples)
  }

  fn fire_sliding(&mut self, watermark: i64) -> Vec<WindowTuplesSet> {
    let due: Vec<(i64, usize)> = self
      .sliding_triggers
      .range(..=watermark)
      .map(|(k, v)| (*k, *v))
      .collect();
    let mut fired = Vec::new();
    for (end, times) in due {
      self.sliding_triggers.remove(&end);
      for _ in 0..times {
        fired.push(self.sliding_set(end));
      }
    }
    if watermark != i64::MAX {
      let horizon = watermark.saturating_sub(self.config.late_tolerance);
      self.prune_sliding(horizon);
    }
    fired
  }

  fn prune_sliding(&mut self, now: i64) {
    let keep_from = now - self.config.spec.length_ms();
    let oldest_trigger = self.sliding_triggers.keys().next().copied();
    let keep_from = match oldest_trigger {
      Some(t) => keep_from.min(t - self.config.spec.length_ms()),
      None => keep_from,
    };
    while self
      .buffer
      .front()
      .is_some_and(|t| t.timestamp < keep_from)
    {
      self.buffer.pop_front();
    }
  }
}

fn build_set(range: WindowRange, tuples: &[Arc<Tuple>]) -> WindowTuplesSet {
  let mut set = WindowTuplesSet::new(Some(range));
  for t in tuples {
    set.add_tuple(t.clone());
  }
  set
}

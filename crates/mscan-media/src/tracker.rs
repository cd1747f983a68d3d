//! Event tracking: turns the per-frame motion stream into motion events.
//!
//! The tracker is a two-state machine over `(frame_index, has_motion)`
//! updates. A candidate opens on the first motion frame and reaches back by
//! the pre-event window; it must survive `min_event_len` consecutive motion
//! frames to become an event, and an event closes after `post_event_len`
//! consecutive frames without motion.

use tracing::debug;

/// Raw event bounds in global frame indices. `start` inclusive, `end`
/// exclusive. Converted to timecoded [`mscan_models::MotionEvent`] by the
/// pipeline once the framerate is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawEvent {
    pub start: u64,
    pub end: u64,
    pub peak_score: f32,
    pub peak_frame: u64,
}

/// State transition reported by [`EventTracker::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerUpdate {
    None,
    /// A candidate reached the minimum length; frames from `start` onward
    /// belong to the event.
    Started { start: u64 },
    /// The open event closed.
    Finished(RawEvent),
}

#[derive(Debug)]
enum State {
    Idle {
        /// Candidate opened by a motion frame but not yet `min_len` long.
        candidate: Option<Candidate>,
    },
    InEvent {
        start: u64,
        last_motion: u64,
        /// Processed frames seen since the last motion frame.
        frames_since_motion: u64,
        peak_score: f32,
        peak_frame: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    start: u64,
    streak: u64,
    peak_score: f32,
    peak_frame: u64,
}

/// Parameters are in frames; the caller converts time values using the
/// stream framerate and scales for frame skip (see [`EventTracker::new`]).
pub struct EventTracker {
    /// Consecutive motion frames required to confirm an event (processed
    /// frames when skipping).
    min_len: u64,
    /// Decoded frames included before the first motion frame.
    pre_len: u64,
    /// Processed no-motion frames required to close an event.
    post_len: u64,
    /// Decoded-frame equivalent of `post_len`, used to pad the stream tail.
    post_len_decoded: u64,
    /// Events never reach into their predecessor (or before the scan start).
    floor: u64,
    state: State,
}

impl EventTracker {
    /// `min_event_len` and `post_event_len` are given in decoded frames and
    /// scaled to processed frames here; `pre_event_len` stays in decoded
    /// frames because the pre-roll is served from the decode stream.
    pub fn new(
        min_event_len: u64,
        pre_event_len: u64,
        post_event_len: u64,
        frame_skip: u32,
        start_floor: u64,
    ) -> Self {
        let step = frame_skip as u64 + 1;
        let scale = |frames: u64| frames.div_ceil(step);
        Self {
            min_len: scale(min_event_len).max(1),
            pre_len: pre_event_len,
            post_len: scale(post_event_len).max(1),
            post_len_decoded: post_event_len,
            floor: start_floor,
            state: State::Idle { candidate: None },
        }
    }

    pub fn in_event(&self) -> bool {
        matches!(self.state, State::InEvent { .. })
    }

    /// Earliest frame index the pipeline must retain for this tracker: the
    /// candidate/event start, or `index - pre_len` when idle.
    pub fn retain_from(&self, index: u64) -> u64 {
        match &self.state {
            State::Idle { candidate: None } => {
                index.saturating_sub(self.pre_len).max(self.floor)
            }
            State::Idle {
                candidate: Some(c),
            } => c.start,
            State::InEvent { start, .. } => *start,
        }
    }

    /// Feed one processed frame.
    pub fn update(&mut self, index: u64, score: f32, has_motion: bool) -> TrackerUpdate {
        let state = std::mem::replace(&mut self.state, State::Idle { candidate: None });
        match state {
            State::Idle { candidate } => {
                if !has_motion {
                    if candidate.is_some() {
                        // Motion died before reaching the minimum length.
                        debug!(index, "candidate event abandoned");
                    }
                    return TrackerUpdate::None;
                }
                let mut cand = candidate.unwrap_or(Candidate {
                    start: index.saturating_sub(self.pre_len).max(self.floor),
                    streak: 0,
                    peak_score: score,
                    peak_frame: index,
                });
                cand.streak += 1;
                if score > cand.peak_score {
                    cand.peak_score = score;
                    cand.peak_frame = index;
                }
                if cand.streak >= self.min_len {
                    debug!(start = cand.start, index, "motion event started");
                    self.state = State::InEvent {
                        start: cand.start,
                        last_motion: index,
                        frames_since_motion: 0,
                        peak_score: cand.peak_score,
                        peak_frame: cand.peak_frame,
                    };
                    return TrackerUpdate::Started { start: cand.start };
                }
                self.state = State::Idle {
                    candidate: Some(cand),
                };
                TrackerUpdate::None
            }
            State::InEvent {
                start,
                mut last_motion,
                mut frames_since_motion,
                mut peak_score,
                mut peak_frame,
            } => {
                if has_motion {
                    last_motion = index;
                    frames_since_motion = 0;
                    if score > peak_score {
                        peak_score = score;
                        peak_frame = index;
                    }
                } else {
                    frames_since_motion += 1;
                    if frames_since_motion >= self.post_len {
                        // The post-event window elapsed; the closing frame
                        // itself is not part of the event.
                        let event = RawEvent {
                            start,
                            end: index,
                            peak_score,
                            peak_frame,
                        };
                        debug!(start = event.start, end = event.end, "motion event finished");
                        self.floor = event.end;
                        return TrackerUpdate::Finished(event);
                    }
                }
                self.state = State::InEvent {
                    start,
                    last_motion,
                    frames_since_motion,
                    peak_score,
                    peak_frame,
                };
                TrackerUpdate::None
            }
        }
    }

    /// Close any open event at end of stream. `total_frames` is the number
    /// of decoded frames (i.e. one past the last valid index).
    pub fn finish(&mut self, total_frames: u64) -> Option<RawEvent> {
        let state = std::mem::replace(&mut self.state, State::Idle { candidate: None });
        let State::InEvent {
            start,
            last_motion,
            peak_score,
            peak_frame,
            ..
        } = state
        else {
            return None;
        };
        let end = (last_motion + self.post_len_decoded).min(total_frames).max(start + 1);
        self.state = State::Idle { candidate: None };
        self.floor = end;
        Some(RawEvent {
            start,
            end,
            peak_score,
            peak_frame,
        })
    }
}

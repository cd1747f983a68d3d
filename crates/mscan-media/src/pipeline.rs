//! The three-stage scan pipeline.
//!
//! Decode, detect, and encode run on their own threads, connected by small
//! bounded queues so a slow stage applies backpressure instead of buffering
//! the whole video. Frames move in strict source order; the detector is
//! never parallelized across frames because the subtractor is stateful.
//!
//! Shutdown paths:
//! - End of stream: the decoder drops its sender, downstream stages drain
//!   and finalize.
//! - Cancel: the shared flag stops the decoder; everything downstream drains
//!   its queue, the tracker closes any open event, and the sink finalizes.
//! - Worker error: the first error is recorded, the flag is raised, and the
//!   remaining stages wind down as for a cancel.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opencv::core::Mat;
use tracing::{debug, info, warn};

use mscan_models::{MotionEvent, Timecode};

use crate::detector::{Detection, MotionDetector};
use crate::error::{ScanError, ScanResult};
use crate::sink::OutputSink;
use crate::source::{Frame, VideoSource};
use crate::tracker::{EventTracker, TrackerUpdate};

/// Queue depth between stages. Small on purpose: frames are large and the
/// queues exist for overlap, not buffering.
const QUEUE_CAPACITY: usize = 4;

/// How often the orchestrator thread publishes progress to observers.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Progress snapshot delivered to observers.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub frames_read: u64,
    /// Estimate; containers may over- or under-report.
    pub total_frames: u64,
    pub events: u64,
}

/// Callbacks driven from the orchestrator thread. Implementations must not
/// block; they run between progress polls.
pub trait ScanObserver: Send + Sync {
    fn on_progress(&self, _progress: &Progress) {}
    fn on_event(&self, _event: &MotionEvent) {}
}

pub(crate) struct PipelineParams {
    pub frame_skip: u32,
    /// Global index of the first scanned frame (after seeking).
    pub start_index: u64,
    /// Stop before this index, when trimming the scan range.
    pub stop_index: Option<u64>,
    pub fps: f64,
    pub total_frames: u64,
}

pub(crate) struct PipelineOutput {
    pub events: Vec<MotionEvent>,
    pub outputs: Vec<PathBuf>,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub canceled: bool,
}

struct DecodedFrame {
    frame: Frame,
    /// False for frames dropped by `frame_skip`; they still flow through for
    /// event pre-roll and output.
    process: bool,
}

enum EncodeMsg {
    EventStart { id: u32, start: Timecode },
    EventFrame { frame: Frame, detection: Detection },
    EventEnd { event: MotionEvent },
    Mask { mask: Mat },
}

/// Shared error slot: the first failure wins and cancels the pipeline.
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<ScanError>>>);

impl ErrorSlot {
    fn record(&self, err: ScanError, cancel: &AtomicBool) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        cancel.store(true, Ordering::Relaxed);
    }

    fn take(&self) -> Option<ScanError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

pub(crate) fn run(
    source: VideoSource,
    detector: MotionDetector,
    tracker: EventTracker,
    sink: Box<dyn OutputSink>,
    params: PipelineParams,
    cancel: Arc<AtomicBool>,
    observers: &[Arc<dyn ScanObserver>],
) -> ScanResult<PipelineOutput> {
    let (decoded_tx, decoded_rx) = sync_channel::<DecodedFrame>(QUEUE_CAPACITY);
    let (encode_tx, encode_rx) = sync_channel::<EncodeMsg>(QUEUE_CAPACITY);

    let frames_read = Arc::new(AtomicU64::new(0));
    let frames_processed = Arc::new(AtomicU64::new(0));
    let errors = ErrorSlot::default();
    // Completed events, shared so the orchestrator can notify observers
    // while the scan is still running.
    let finished_events = Arc::new(Mutex::new(Vec::<MotionEvent>::new()));

    let decode_handle = spawn_decoder(
        source,
        decoded_tx,
        params.frame_skip,
        params.start_index,
        params.stop_index,
        cancel.clone(),
        frames_read.clone(),
        errors.clone(),
    );
    let detect_handle = spawn_detector(
        detector,
        tracker,
        decoded_rx,
        encode_tx,
        params.fps,
        params.start_index,
        cancel.clone(),
        frames_processed.clone(),
        finished_events.clone(),
        errors.clone(),
    );
    let encode_handle = spawn_encoder(sink, encode_rx, cancel.clone(), errors.clone());

    // The orchestrator thread owns the observers: poll counters, hand out
    // progress, and forward events as they close.
    let mut delivered_events = 0;
    loop {
        let done = encode_handle.is_finished()
            && detect_handle.is_finished()
            && decode_handle.is_finished();
        let progress = Progress {
            frames_read: frames_read.load(Ordering::Relaxed),
            total_frames: params.total_frames,
            events: {
                let events = finished_events.lock().unwrap_or_else(|e| e.into_inner());
                events.len() as u64
            },
        };
        for observer in observers {
            observer.on_progress(&progress);
        }
        {
            let events = finished_events.lock().unwrap_or_else(|e| e.into_inner());
            for event in events.iter().skip(delivered_events) {
                for observer in observers {
                    observer.on_event(event);
                }
            }
            delivered_events = events.len();
        }
        if done {
            break;
        }
        std::thread::sleep(PROGRESS_INTERVAL);
    }

    decode_handle
        .join()
        .map_err(|_| ScanError::internal("decode worker panicked"))?;
    let events = detect_handle
        .join()
        .map_err(|_| ScanError::internal("detect worker panicked"))?;
    let outputs = encode_handle
        .join()
        .map_err(|_| ScanError::internal("encode worker panicked"))?;

    if let Some(err) = errors.take() {
        return Err(err);
    }

    Ok(PipelineOutput {
        events,
        outputs,
        frames_read: frames_read.load(Ordering::Relaxed),
        frames_processed: frames_processed.load(Ordering::Relaxed),
        canceled: cancel.load(Ordering::Relaxed),
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_decoder(
    mut source: VideoSource,
    tx: SyncSender<DecodedFrame>,
    frame_skip: u32,
    start_index: u64,
    stop_index: Option<u64>,
    cancel: Arc<AtomicBool>,
    frames_read: Arc<AtomicU64>,
    errors: ErrorSlot,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let step = frame_skip as u64 + 1;
        loop {
            if cancel.load(Ordering::Relaxed) {
                debug!("decoder stopping on cancel");
                break;
            }
            let frame = match source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("decoder reached end of stream");
                    break;
                }
                Err(err) => {
                    errors.record(err, &cancel);
                    break;
                }
            };
            if let Some(stop) = stop_index {
                if frame.index >= stop {
                    debug!(stop, "decoder reached scan end position");
                    break;
                }
            }
            frames_read.fetch_add(1, Ordering::Relaxed);
            let process = (frame.index - start_index) % step == 0;
            if tx.send(DecodedFrame { frame, process }).is_err() {
                // Downstream exited; its error (if any) is already recorded.
                break;
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_detector(
    mut detector: MotionDetector,
    mut tracker: EventTracker,
    rx: Receiver<DecodedFrame>,
    tx: SyncSender<EncodeMsg>,
    fps: f64,
    start_index: u64,
    cancel: Arc<AtomicBool>,
    frames_processed: Arc<AtomicU64>,
    finished_events: Arc<Mutex<Vec<MotionEvent>>>,
    errors: ErrorSlot,
) -> std::thread::JoinHandle<Vec<MotionEvent>> {
    std::thread::spawn(move || {
        let mut events: Vec<MotionEvent> = Vec::new();
        // Pre-roll buffer: frames not (yet) part of an event, retained so a
        // confirmed event can reach back `time_before_event` frames.
        let mut buffer: VecDeque<(Frame, Detection)> = VecDeque::new();
        let mut last_detection: Option<Detection> = None;
        let mut in_event = false;
        let mut event_id: u32 = 0;
        let mut next_index = start_index;
        let mut failed = false;

        let mut record_event = |raw: crate::tracker::RawEvent,
                                events: &mut Vec<MotionEvent>|
         -> MotionEvent {
            let event = MotionEvent {
                start: Timecode::new(raw.start, fps),
                end: Timecode::new(raw.end, fps),
                peak_score: raw.peak_score,
                peak_frame: raw.peak_frame,
            };
            events.push(event);
            finished_events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
            event
        };

        for DecodedFrame { frame, process } in rx.iter() {
            next_index = frame.index + 1;
            if failed || cancel.load(Ordering::Relaxed) {
                // Keep draining so the decoder is never stuck on a full
                // queue, but stop doing work.
                continue;
            }

            let detection = if process {
                match detector.process(&frame.pixels, frame.index) {
                    Ok(det) => {
                        frames_processed.fetch_add(1, Ordering::Relaxed);
                        det
                    }
                    Err(err) => {
                        errors.record(err, &cancel);
                        failed = true;
                        continue;
                    }
                }
            } else {
                Detection::carried(frame.index, last_detection.as_ref())
            };

            if let Some(mask) = &detection.mask {
                if tx.send(EncodeMsg::Mask { mask: mask.clone() }).is_err() {
                    break;
                }
            }

            let update = if process {
                tracker.update(frame.index, detection.score, detection.has_motion)
            } else {
                TrackerUpdate::None
            };
            let queued = detection.without_mask();
            last_detection = Some(queued.clone());

            let sent = match update {
                TrackerUpdate::Started { start } => {
                    event_id += 1;
                    debug!(event_id, start, "event opened");
                    let mut ok = tx
                        .send(EncodeMsg::EventStart {
                            id: event_id,
                            start: Timecode::new(start, fps),
                        })
                        .is_ok();
                    // Flush the pre-roll: buffered frames from `start` on
                    // belong to this event.
                    while ok {
                        let Some((bframe, bdet)) = buffer.pop_front() else {
                            break;
                        };
                        if bframe.index < start {
                            continue;
                        }
                        ok = tx
                            .send(EncodeMsg::EventFrame {
                                frame: bframe,
                                detection: bdet,
                            })
                            .is_ok();
                    }
                    in_event = true;
                    ok && tx
                        .send(EncodeMsg::EventFrame {
                            frame,
                            detection: queued,
                        })
                        .is_ok()
                }
                TrackerUpdate::Finished(raw) => {
                    let event = record_event(raw, &mut events);
                    in_event = false;
                    // The closing frame is outside the event; it seeds the
                    // pre-roll for the next one.
                    let ok = tx.send(EncodeMsg::EventEnd { event }).is_ok();
                    buffer.push_back((frame, queued));
                    ok
                }
                TrackerUpdate::None => {
                    if in_event {
                        tx.send(EncodeMsg::EventFrame {
                            frame,
                            detection: queued,
                        })
                        .is_ok()
                    } else {
                        buffer.push_back((frame, queued));
                        let retain = tracker.retain_from(next_index);
                        while buffer
                            .front()
                            .map(|(f, _)| f.index < retain)
                            .unwrap_or(false)
                        {
                            buffer.pop_front();
                        }
                        true
                    }
                }
            };
            if !sent {
                break;
            }
        }

        // Close any open event. On a clean end of stream the sink finalizes
        // it; on cancel or error the event is still reported, but no
        // EventEnd is sent so the sink can discard the partial clip.
        let interrupted = failed || cancel.load(Ordering::Relaxed);
        if let Some(raw) = tracker.finish(next_index) {
            let event = record_event(raw, &mut events);
            if !interrupted {
                let _ = tx.send(EncodeMsg::EventEnd { event });
            }
        }
        info!(events = events.len(), "detection finished");
        events
    })
}

fn spawn_encoder(
    mut sink: Box<dyn OutputSink>,
    rx: Receiver<EncodeMsg>,
    cancel: Arc<AtomicBool>,
    errors: ErrorSlot,
) -> std::thread::JoinHandle<Vec<PathBuf>> {
    std::thread::spawn(move || {
        let mut failed = false;
        for msg in rx.iter() {
            if failed {
                continue;
            }
            let result = match msg {
                EncodeMsg::EventStart { id, start } => sink.event_start(id, &start),
                EncodeMsg::EventFrame { frame, detection } => sink.write(frame, &detection),
                EncodeMsg::EventEnd { event } => sink.event_end(&event),
                EncodeMsg::Mask { mask } => sink.write_mask(&mask),
            };
            if let Err(err) = result {
                errors.record(err, &cancel);
                failed = true;
            }
        }
        match sink.finish(cancel.load(Ordering::Relaxed)) {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!("output finalization failed: {}", err);
                errors.record(err, &cancel);
                Vec::new()
            }
        }
    })
}

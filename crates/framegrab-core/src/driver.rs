//! Single-frame and continuous capture on an open session.

use crate::display::{Display, DisplayError, QUIT_KEY};
use crate::overlay::{draw_fps, renders_text};
use crate::rate::RateMeter;
use crate::save::{SaveError, SavePolicy};
use framegrab_hw::{normalize, AcquisitionMode, AcquisitionSession, CanonicalFrame, SessionError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Display(#[from] DisplayError),
}

/// Cooperative cancellation flag, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Grab one frame in `SingleFrame` mode.
///
/// Returns `None` when the frame arrived incomplete. Acquisition is stopped
/// again before returning, on success and on error.
pub fn capture_single(
    session: &mut AcquisitionSession<'_>,
    timeout: Duration,
) -> Result<Option<CanonicalFrame>, DriverError> {
    session.select_mode(AcquisitionMode::SingleFrame)?;
    session.start_streaming()?;

    let grabbed = match session.fetch_frame(timeout) {
        Ok(guard) => Ok(guard.convert(|raw| normalize(raw).frame)),
        Err(SessionError::IncompleteFrame { sequence, status }) => {
            tracing::warn!(sequence, %status, "image incomplete");
            Ok(None)
        }
        Err(e) => Err(e),
    };

    if let Err(e) = session.stop_streaming() {
        tracing::warn!(error = %e, "failed to stop acquisition");
    }
    Ok(grabbed?)
}

/// Why a continuous capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Signal,
    QuitKey,
    FrameLimit,
}

/// What a continuous capture produced.
#[derive(Debug, Clone, Default)]
pub struct LoopSummary {
    pub frames: u64,
    pub incomplete: u64,
    pub timeouts: u64,
    pub saved: Vec<PathBuf>,
    pub elapsed: Duration,
    pub fps: f64,
    pub reason: StopReason,
}

/// Continuous acquisition with FPS overlay, periodic saving and preview.
#[derive(Debug, Clone)]
pub struct CaptureLoop {
    timeout: Duration,
    save: SavePolicy,
    frame_limit: Option<u64>,
    max_consecutive_timeouts: u32,
    stop: StopSignal,
}

impl CaptureLoop {
    pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            save: SavePolicy::disabled(),
            frame_limit: None,
            max_consecutive_timeouts: Self::DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            stop: StopSignal::new(),
        }
    }

    pub fn with_save_policy(mut self, save: SavePolicy) -> Self {
        self.save = save;
        self
    }

    /// End after this many produced frames.
    pub fn with_frame_limit(mut self, limit: Option<u64>) -> Self {
        self.frame_limit = limit;
        self
    }

    /// Timeouts in a row tolerated before the loop gives up.
    pub fn with_max_consecutive_timeouts(mut self, max: u32) -> Self {
        self.max_consecutive_timeouts = max;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Stream until stopped, then stop acquisition.
    ///
    /// The loop ends on the stop signal, the quit key, the frame limit or a
    /// fatal fetch error. Closing the camera is left to the session guard.
    pub fn run(
        &self,
        session: &mut AcquisitionSession<'_>,
        display: &mut dyn Display,
    ) -> Result<LoopSummary, DriverError> {
        session.select_mode(AcquisitionMode::Continuous)?;
        session.start_streaming()?;

        let outcome = self.stream(session, display);

        if let Err(e) = session.stop_streaming() {
            tracing::warn!(error = %e, "failed to stop acquisition");
        }
        outcome
    }

    fn stream(
        &self,
        session: &mut AcquisitionSession<'_>,
        display: &mut dyn Display,
    ) -> Result<LoopSummary, DriverError> {
        if self.save.is_enabled() {
            self.save.ensure_dir()?;
        }
        if !renders_text() {
            tracing::debug!("built without the `opencv` feature; FPS overlay disabled");
        }

        let mut meter = RateMeter::start();
        let mut summary = LoopSummary::default();
        let mut consecutive_timeouts = 0u32;

        summary.reason = loop {
            if self.stop.is_stopped() {
                tracing::info!("stop requested");
                break StopReason::Signal;
            }
            if self.frame_limit.is_some_and(|limit| meter.count() >= limit) {
                break StopReason::FrameLimit;
            }

            let guard = match session.fetch_frame(self.timeout) {
                Ok(guard) => guard,
                Err(SessionError::IncompleteFrame { sequence, status }) => {
                    tracing::warn!(sequence, %status, "image incomplete");
                    summary.incomplete += 1;
                    continue;
                }
                Err(SessionError::Timeout(waited)) => {
                    summary.timeouts += 1;
                    consecutive_timeouts += 1;
                    if consecutive_timeouts > self.max_consecutive_timeouts {
                        return Err(SessionError::Timeout(waited).into());
                    }
                    tracing::warn!(
                        attempt = consecutive_timeouts,
                        timeout_ms = waited.as_millis() as u64,
                        "no frame received, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            consecutive_timeouts = 0;

            let Some(normalized) = guard.convert(normalize) else {
                continue;
            };
            let mut frame = normalized.frame;
            let count = meter.tick();
            let fps = meter.fps();
            if let Err(e) = draw_fps(&mut frame, fps) {
                tracing::warn!(count, error = %e, "failed to draw FPS overlay");
            }
            tracing::trace!(count, fps, "frame");

            if self.save.should_save(count) {
                match self.save.save(&frame, count) {
                    Ok(path) => summary.saved.push(path),
                    Err(e) => tracing::warn!(count, error = %e, "failed to save frame"),
                }
            }

            if let Some(key) = display.show(&frame)? {
                if key.eq_ignore_ascii_case(&QUIT_KEY) {
                    tracing::info!("quit key pressed");
                    break StopReason::QuitKey;
                }
            }
        };

        summary.frames = meter.count();
        summary.elapsed = meter.elapsed();
        summary.fps = meter.fps();
        tracing::info!(
            frames = summary.frames,
            incomplete = summary.incomplete,
            saved = summary.saved.len(),
            fps = format!("{:.1}", summary.fps),
            "capture finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegrab_hw::{CameraSpec, CaptureContext, Event, SyntheticSystem};

    fn small(spec: CameraSpec) -> CameraSpec {
        CameraSpec {
            sensor_width: 64,
            sensor_height: 48,
            ..spec
        }
    }

    /// Presses `key` on the `after`-th shown frame.
    struct KeyAfter {
        after: u64,
        key: char,
        shown: u64,
    }

    impl Display for KeyAfter {
        fn show(&mut self, frame: &CanonicalFrame) -> Result<Option<char>, DisplayError> {
            assert_eq!(frame.channels(), 3);
            self.shown += 1;
            Ok((self.shown == self.after).then_some(self.key))
        }
    }

    #[test]
    fn test_capture_single_returns_canonical_frame() {
        let mut ctx = CaptureContext::init(Box::new(SyntheticSystem::new(vec![small(
            CameraSpec::default(),
        )])));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();

        let frame = capture_single(&mut session, Duration::from_millis(50))
            .unwrap()
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert!(!session.is_streaming());
    }

    #[test]
    fn test_capture_single_incomplete_yields_none() {
        let system = SyntheticSystem::new(vec![small(CameraSpec {
            incomplete_every: Some(1),
            ..CameraSpec::default()
        })]);
        let journal = system.journal();
        let mut ctx = CaptureContext::init(Box::new(system));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();

        let frame = capture_single(&mut session, Duration::from_millis(50)).unwrap();
        assert!(frame.is_none());
        assert!(journal.events().contains(&Event::FrameReleased(1)));
    }

    #[test]
    fn test_loop_stops_at_frame_limit() {
        let mut ctx = CaptureContext::init(Box::new(SyntheticSystem::new(vec![small(
            CameraSpec::default(),
        )])));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();

        let summary = CaptureLoop::new(Duration::from_millis(50))
            .with_frame_limit(Some(5))
            .run(&mut session, &mut crate::NullDisplay)
            .unwrap();
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.reason, StopReason::FrameLimit);
        assert!(summary.saved.is_empty());
        assert!(!session.is_streaming());
    }

    #[test]
    fn test_quit_key_ends_loop() {
        let mut ctx = CaptureContext::init(Box::new(SyntheticSystem::new(vec![small(
            CameraSpec::default(),
        )])));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        let mut display = KeyAfter {
            after: 3,
            key: 'q',
            shown: 0,
        };

        let summary = CaptureLoop::new(Duration::from_millis(50))
            .run(&mut session, &mut display)
            .unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.reason, StopReason::QuitKey);
    }

    #[test]
    fn test_other_keys_are_ignored() {
        let mut ctx = CaptureContext::init(Box::new(SyntheticSystem::new(vec![small(
            CameraSpec::default(),
        )])));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        let mut display = KeyAfter {
            after: 1,
            key: 'x',
            shown: 0,
        };

        let summary = CaptureLoop::new(Duration::from_millis(50))
            .with_frame_limit(Some(4))
            .run(&mut session, &mut display)
            .unwrap();
        assert_eq!(summary.reason, StopReason::FrameLimit);
        assert_eq!(summary.frames, 4);
    }

    #[test]
    fn test_stop_signal_set_before_run() {
        let mut ctx = CaptureContext::init(Box::new(SyntheticSystem::new(vec![small(
            CameraSpec::default(),
        )])));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();

        let capture = CaptureLoop::new(Duration::from_millis(50));
        capture.stop_signal().stop();
        let summary = capture.run(&mut session, &mut crate::NullDisplay).unwrap();
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.reason, StopReason::Signal);
    }

    #[test]
    fn test_timeouts_become_fatal_after_retries() {
        let system = SyntheticSystem::new(vec![small(CameraSpec {
            frame_limit: Some(2),
            ..CameraSpec::default()
        })]);
        let journal = system.journal();
        let mut ctx = CaptureContext::init(Box::new(system));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();

        let result = CaptureLoop::new(Duration::from_millis(1))
            .with_max_consecutive_timeouts(2)
            .run(&mut session, &mut crate::NullDisplay);
        assert!(matches!(
            result,
            Err(DriverError::Session(SessionError::Timeout(_)))
        ));
        assert!(!session.is_streaming());
        assert!(journal.events().contains(&Event::EndAcquisition));
    }

    #[test]
    fn test_incomplete_frames_are_counted_and_skipped() {
        let mut ctx = CaptureContext::init(Box::new(SyntheticSystem::new(vec![small(
            CameraSpec {
                incomplete_every: Some(3),
                ..CameraSpec::default()
            },
        )])));
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();

        // Sequences 3, 6 and 9 are incomplete; 6 good frames need 8 fetches.
        let summary = CaptureLoop::new(Duration::from_millis(50))
            .with_frame_limit(Some(6))
            .run(&mut session, &mut crate::NullDisplay)
            .unwrap();
        assert_eq!(summary.frames, 6);
        assert_eq!(summary.incomplete, 2);
    }
}

//! Scoped ownership of the capture system, the camera list, an open camera
//! and its outstanding frames.
//!
//! Borrowing enforces the teardown order: a [`FrameGuard`] borrows the
//! [`AcquisitionSession`], which borrows the [`CameraList`], which borrows
//! the [`CaptureContext`]. Dropping them therefore always runs
//! release frame → stop acquisition → close camera → clear list →
//! release system, whichever way the caller exits.

use crate::device::{AcquisitionMode, CaptureDevice, CaptureSystem, DeviceError, DeviceInfo};
use crate::frame::RawFrame;
use crate::node::{Access, Node, NodeError, NodeMap, NodeValue};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no camera available")]
    DeviceUnavailable,
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("incomplete frame {sequence}: {status}")]
    IncompleteFrame { sequence: u64, status: String },
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("device error: {0}")]
    Device(DeviceError),
}

impl SessionError {
    /// Per-frame conditions the caller may skip past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::IncompleteFrame { .. } | SessionError::Timeout(_)
        )
    }
}

impl From<DeviceError> for SessionError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Timeout(d) => SessionError::Timeout(d),
            other => SessionError::Device(other),
        }
    }
}

/// Process-scoped handle on a capture backend.
///
/// Released exactly once, by [`teardown`](Self::teardown) or on drop.
pub struct CaptureContext {
    system: Box<dyn CaptureSystem>,
    released: bool,
}

impl CaptureContext {
    pub fn init(system: Box<dyn CaptureSystem>) -> Self {
        tracing::debug!(backend = system.name(), "capture system initialized");
        Self {
            system,
            released: false,
        }
    }

    /// Enumerate cameras. The list must be dropped before the context.
    pub fn cameras(&mut self) -> Result<CameraList<'_>, SessionError> {
        let cameras = self.system.cameras()?;
        tracing::info!(
            backend = self.system.name(),
            count = cameras.len(),
            "cameras detected"
        );
        Ok(CameraList {
            cameras,
            system: self.system.as_mut(),
        })
    }

    pub fn teardown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.system.release_instance() {
            tracing::warn!(error = %e, "failed to release capture system");
        }
    }
}

impl Drop for CaptureContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Enumerated cameras. Cleared on drop.
pub struct CameraList<'c> {
    cameras: Vec<Box<dyn CaptureDevice>>,
    system: &'c mut dyn CaptureSystem,
}

impl CameraList<'_> {
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn infos(&self) -> Vec<DeviceInfo> {
        self.cameras.iter().map(|c| c.info()).collect()
    }
}

impl Drop for CameraList<'_> {
    fn drop(&mut self) {
        self.cameras.clear();
        self.system.on_list_cleared();
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    ModeSelected(AcquisitionMode),
    Streaming(AcquisitionMode),
    Closed,
}

/// An initialized camera and its acquisition stream.
pub struct AcquisitionSession<'l> {
    camera: &'l mut dyn CaptureDevice,
    state: SessionState,
}

impl<'l> AcquisitionSession<'l> {
    /// Initialize the first camera in `cameras`.
    pub fn open(cameras: &'l mut CameraList<'_>) -> Result<Self, SessionError> {
        let camera = cameras
            .cameras
            .first_mut()
            .ok_or(SessionError::DeviceUnavailable)?
            .as_mut();
        camera.init()?;
        let info = camera.info();
        tracing::info!(
            vendor = %info.vendor,
            model = %info.model,
            serial = %info.serial,
            "camera opened"
        );
        Ok(Self {
            camera,
            state: SessionState::Opened,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, SessionState::Streaming(_))
    }

    pub fn info(&self) -> DeviceInfo {
        self.camera.info()
    }

    pub fn select_mode(&mut self, mode: AcquisitionMode) -> Result<(), SessionError> {
        if !self.camera.is_writable(Node::AcquisitionMode) {
            return Err(SessionError::ConfigurationRejected(format!(
                "cannot set AcquisitionMode to {mode}"
            )));
        }
        self.camera
            .write(Node::AcquisitionMode, NodeValue::Enum(mode.entry().to_string()))
            .map_err(|e| SessionError::ConfigurationRejected(e.to_string()))?;
        self.state = SessionState::ModeSelected(mode);
        tracing::info!(mode = %mode, "acquisition mode selected");
        Ok(())
    }

    pub fn start_streaming(&mut self) -> Result<(), SessionError> {
        let mode = match self.state {
            SessionState::ModeSelected(mode) => mode,
            SessionState::Streaming(_) => return Ok(()),
            SessionState::Opened => AcquisitionMode::Continuous,
            SessionState::Closed => return Err(SessionError::DeviceUnavailable),
        };
        self.camera.begin_acquisition()?;
        self.state = SessionState::Streaming(mode);
        tracing::debug!(mode = %mode, "acquisition started");
        Ok(())
    }

    /// Wait up to `timeout` for the next complete frame.
    ///
    /// Incomplete frames are released here and reported as
    /// [`SessionError::IncompleteFrame`]; they never reach the caller.
    pub fn fetch_frame(&mut self, timeout: Duration) -> Result<FrameGuard<'_>, SessionError> {
        if !self.is_streaming() {
            return Err(SessionError::Device(DeviceError::NotStreaming));
        }
        let raw = self.camera.next_frame(timeout)?;
        let sequence = raw.sequence;

        if raw.incomplete {
            let status = raw.status.unwrap_or_else(|| "unknown".to_string());
            if let Err(e) = self.camera.release_frame(sequence) {
                tracing::warn!(sequence, error = %e, "failed to release incomplete frame");
            }
            return Err(SessionError::IncompleteFrame { sequence, status });
        }

        Ok(FrameGuard {
            camera: &mut *self.camera,
            raw: Some(raw),
            sequence,
            released: false,
        })
    }

    /// Stop the stream. Does nothing when it was never started.
    pub fn stop_streaming(&mut self) -> Result<(), SessionError> {
        let SessionState::Streaming(mode) = self.state else {
            return Ok(());
        };
        self.state = SessionState::ModeSelected(mode);
        self.camera.end_acquisition()?;
        tracing::debug!("acquisition stopped");
        Ok(())
    }

    /// Stop (if streaming) and close the camera.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.stop_streaming() {
            tracing::warn!(error = %e, "failed to stop acquisition");
        }
        self.state = SessionState::Closed;
        if let Err(e) = self.camera.deinit() {
            tracing::warn!(error = %e, "failed to close camera");
        }
        tracing::debug!("camera closed");
    }
}

/// The session exposes the open camera's node map.
impl NodeMap for AcquisitionSession<'_> {
    fn access(&self, node: Node) -> Access {
        self.camera.access(node)
    }

    fn read(&self, node: Node) -> Result<NodeValue, NodeError> {
        self.camera.read(node)
    }

    fn max(&self, node: Node) -> Result<NodeValue, NodeError> {
        self.camera.max(node)
    }

    fn write(&mut self, node: Node, value: NodeValue) -> Result<(), NodeError> {
        self.camera.write(node, value)
    }

    fn entries(&self, node: Node) -> Result<Vec<String>, NodeError> {
        self.camera.entries(node)
    }
}

impl Drop for AcquisitionSession<'_> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A complete frame on loan from the camera.
///
/// The device-side slot is released exactly once: after
/// [`convert`](Self::convert), by [`release`](Self::release), or on drop.
pub struct FrameGuard<'s> {
    camera: &'s mut dyn CaptureDevice,
    raw: Option<RawFrame>,
    sequence: u64,
    released: bool,
}

impl FrameGuard<'_> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The frame, unless it was already handed to [`convert`](Self::convert).
    pub fn raw(&self) -> Option<&RawFrame> {
        self.raw.as_ref()
    }

    /// Hand the frame to `f`, then release it back to the camera.
    pub fn convert<T>(mut self, f: impl FnOnce(RawFrame) -> T) -> Option<T> {
        let out = self.raw.take().map(f);
        self.release_slot();
        out
    }

    /// Give the frame back without using it.
    pub fn release(mut self) -> Result<(), SessionError> {
        self.released = true;
        self.raw = None;
        self.camera.release_frame(self.sequence)?;
        Ok(())
    }

    fn release_slot(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.camera.release_frame(self.sequence) {
            tracing::warn!(sequence = self.sequence, error = %e, "failed to release frame");
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{CameraSpec, Event, Journal, SyntheticSystem};

    fn context(spec: CameraSpec) -> (CaptureContext, Journal) {
        let system = SyntheticSystem::new(vec![spec]);
        let journal = system.journal();
        (CaptureContext::init(Box::new(system)), journal)
    }

    #[test]
    fn test_open_without_cameras_is_unavailable() {
        let system = SyntheticSystem::new(Vec::new());
        let journal = system.journal();
        let mut ctx = CaptureContext::init(Box::new(system));
        {
            let mut cameras = ctx.cameras().unwrap();
            assert!(cameras.is_empty());
            let err = AcquisitionSession::open(&mut cameras).err().unwrap();
            assert!(matches!(err, SessionError::DeviceUnavailable));
        }
        ctx.teardown();
        assert_eq!(journal.events(), vec![Event::ListCleared, Event::SystemReleased]);
    }

    #[test]
    fn test_teardown_without_streaming() {
        let (mut ctx, journal) = context(CameraSpec::default());
        {
            let mut cameras = ctx.cameras().unwrap();
            let session = AcquisitionSession::open(&mut cameras).unwrap();
            assert_eq!(session.state(), SessionState::Opened);
            // Dropped without ever starting the stream.
        }
        drop(ctx);
        assert_eq!(
            journal.events(),
            vec![
                Event::Init,
                Event::Deinit,
                Event::ListCleared,
                Event::SystemReleased
            ]
        );
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let (mut ctx, journal) = context(CameraSpec::default());
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        session.stop_streaming().unwrap();
        session.close();
        assert!(!journal.events().contains(&Event::EndAcquisition));
    }

    #[test]
    fn test_teardown_order_after_streaming() {
        let (mut ctx, journal) = context(CameraSpec::default());
        {
            let mut cameras = ctx.cameras().unwrap();
            let mut session = AcquisitionSession::open(&mut cameras).unwrap();
            session.select_mode(AcquisitionMode::Continuous).unwrap();
            session.start_streaming().unwrap();
            let frame = session.fetch_frame(Duration::from_millis(100)).unwrap();
            assert!(frame.raw().is_some());
            // Early exit with a frame still on loan.
        }
        ctx.teardown();
        assert_eq!(
            journal.events(),
            vec![
                Event::Init,
                Event::BeginAcquisition,
                Event::FrameReleased(1),
                Event::EndAcquisition,
                Event::Deinit,
                Event::ListCleared,
                Event::SystemReleased
            ]
        );
    }

    #[test]
    fn test_mode_rejected_while_streaming() {
        let (mut ctx, _journal) = context(CameraSpec::default());
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        session.select_mode(AcquisitionMode::SingleFrame).unwrap();
        session.start_streaming().unwrap();
        let err = session.select_mode(AcquisitionMode::Continuous).unwrap_err();
        assert!(matches!(err, SessionError::ConfigurationRejected(_)));
    }

    #[test]
    fn test_incomplete_frame_is_released_and_reported() {
        let (mut ctx, journal) = context(CameraSpec {
            incomplete_every: Some(2),
            ..CameraSpec::default()
        });
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        session.start_streaming().unwrap();

        let timeout = Duration::from_millis(100);
        let first = session.fetch_frame(timeout).unwrap();
        assert_eq!(first.convert(|raw| raw.sequence), Some(1));

        let err = session.fetch_frame(timeout).err().unwrap();
        assert!(err.is_recoverable());
        assert!(matches!(err, SessionError::IncompleteFrame { sequence: 2, .. }));

        let released: Vec<_> = journal
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::FrameReleased(_)))
            .collect();
        assert_eq!(released, vec![Event::FrameReleased(1), Event::FrameReleased(2)]);
    }

    #[test]
    fn test_frame_released_exactly_once() {
        let (mut ctx, journal) = context(CameraSpec::default());
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        session.start_streaming().unwrap();
        let frame = session.fetch_frame(Duration::from_millis(100)).unwrap();
        frame.release().unwrap();
        session.close();
        let count = journal
            .events()
            .iter()
            .filter(|e| **e == Event::FrameReleased(1))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let (mut ctx, _journal) = context(CameraSpec {
            frame_limit: Some(0),
            ..CameraSpec::default()
        });
        let mut cameras = ctx.cameras().unwrap();
        let mut session = AcquisitionSession::open(&mut cameras).unwrap();
        session.start_streaming().unwrap();
        let err = session.fetch_frame(Duration::from_millis(5)).err().unwrap();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[test]
    fn test_failed_start_still_closes() {
        let (mut ctx, journal) = context(CameraSpec {
            fail_begin: true,
            ..CameraSpec::default()
        });
        {
            let mut cameras = ctx.cameras().unwrap();
            let mut session = AcquisitionSession::open(&mut cameras).unwrap();
            assert!(session.start_streaming().is_err());
        }
        ctx.teardown();
        assert_eq!(
            journal.events(),
            vec![
                Event::Init,
                Event::Deinit,
                Event::ListCleared,
                Event::SystemReleased
            ]
        );
    }

    #[test]
    fn test_failed_stop_still_closes() {
        let (mut ctx, journal) = context(CameraSpec {
            fail_end: true,
            ..CameraSpec::default()
        });
        {
            let mut cameras = ctx.cameras().unwrap();
            let mut session = AcquisitionSession::open(&mut cameras).unwrap();
            session.start_streaming().unwrap();
        }
        ctx.teardown();
        assert_eq!(
            journal.events(),
            vec![
                Event::Init,
                Event::BeginAcquisition,
                Event::Deinit,
                Event::ListCleared,
                Event::SystemReleased
            ]
        );
    }
}

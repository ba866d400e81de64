use crate::ports::{Frame, FrameSource};

/// Scoped ownership of an open camera stream.
///
/// The stream is released exactly once: either through [`release`](Self::release)
/// or, if the lease is dropped while still held, on drop.
pub struct CameraLease<S: FrameSource> {
    source: Option<S>,
}

impl<S: FrameSource> CameraLease<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
        }
    }

    pub fn is_held(&self) -> bool {
        self.source.is_some()
    }

    /// Latest frame, or `None` when no frame is ready or the lease was released.
    pub fn current_frame(&mut self) -> Option<Frame> {
        self.source.as_mut()?.current_frame()
    }

    /// Release the stream. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
            tracing::info!("camera released");
        }
    }
}

impl<S: FrameSource> Drop for CameraLease<S> {
    fn drop(&mut self) {
        self.release();
    }
}

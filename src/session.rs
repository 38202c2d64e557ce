//! Scoped ownership of an open camera.
//!
//! A [`Session`] opens the device when created and closes it when dropped, so
//! every early return, `?` and panic unwind releases the camera exactly once.

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::traits::{CameraDevice, Result};

/// An open camera, closed on drop.
pub struct Session<'a, C: CameraDevice> {
    camera: &'a mut C,
    closed: bool,
}

impl<'a, C: CameraDevice> Session<'a, C> {
    /// Open `camera` for the lifetime of the returned guard.
    pub fn open(camera: &'a mut C) -> Result<Self> {
        camera.open()?;
        debug!(model = %camera.info().model, "session opened");
        Ok(Self {
            camera,
            closed: false,
        })
    }

    /// Close the camera now and report any close failure.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.camera.close()
    }
}

impl<C: CameraDevice> Deref for Session<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.camera
    }
}

impl<C: CameraDevice> DerefMut for Session<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.camera
    }
}

impl<C: CameraDevice> Drop for Session<'_, C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.camera.close() {
            warn!(%err, "failed to close camera");
        } else {
            debug!("session closed");
        }
    }
}

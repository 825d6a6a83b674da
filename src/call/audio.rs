use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The exclusive device audio resource (microphone and speaker route).
pub trait AudioDevice: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self);
}

/// Device for hosts where audio is routed elsewhere.
#[derive(Debug, Default)]
pub struct NullAudioDevice;

impl AudioDevice for NullAudioDevice {
    fn acquire(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

/// Pairs every device acquisition with exactly one release.
///
/// The device is only acquired once the orchestrator has armed the controller
/// (the call is connected) *and* the host has activated audio, in either order.
/// [`release`](Self::release) is safe to call on every terminal transition.
pub struct AudioSessionController {
    device: Arc<dyn AudioDevice>,
    armed: bool,
    activation_pending: bool,
    acquired: bool,
    acquisitions: u64,
    releases: u64,
}

impl AudioSessionController {
    pub fn new(device: Arc<dyn AudioDevice>) -> Self {
        Self {
            device,
            armed: false,
            activation_pending: false,
            acquired: false,
            acquisitions: 0,
            releases: 0,
        }
    }

    /// The call is connected; acquire as soon as the host activates audio.
    /// Returns true if the device was acquired by this call.
    pub fn expect_activation(&mut self) -> bool {
        self.armed = true;
        if self.activation_pending {
            self.activation_pending = false;
            return self.acquire();
        }
        false
    }

    /// The host activated the audio session. Returns true if the device was acquired.
    pub fn on_activated(&mut self) -> bool {
        if self.acquired {
            return false;
        }
        if !self.armed {
            debug!("audio activation before connect, deferring");
            self.activation_pending = true;
            return false;
        }
        self.acquire()
    }

    /// The host took the audio session away. Returns true if the device was released.
    pub fn on_deactivated(&mut self) -> bool {
        self.activation_pending = false;
        self.release_device()
    }

    /// Terminal release. A no-op if nothing was acquired.
    pub fn release(&mut self) -> bool {
        self.armed = false;
        self.activation_pending = false;
        self.release_device()
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }

    fn acquire(&mut self) -> bool {
        match self.device.acquire() {
            Ok(()) => {
                self.acquired = true;
                self.acquisitions += 1;
                info!(acquisitions = self.acquisitions, "audio device acquired");
                true
            }
            Err(e) => {
                warn!("failed to acquire audio device: {}", e);
                false
            }
        }
    }

    fn release_device(&mut self) -> bool {
        if !self.acquired {
            return false;
        }
        self.device.release();
        self.acquired = false;
        self.releases += 1;
        info!(releases = self.releases, "audio device released");
        true
    }
}

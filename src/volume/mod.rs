//! Client-local volume and mute override.
//!
//! Nothing in here is ever sent to the server: muting only changes what this
//! client's active backend outputs.

/// What the caller must do after [`LocalVolume::begin_toggle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Read the active backend's true output level, then call
    /// [`LocalVolume::complete_mute`] with it
    ReadLevel,
    /// Mute was turned off; drive output to this level
    Unmuted(u8),
    /// Another toggle is still in flight
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVolume {
    muted: bool,
    volume_before_mute: u8,
    mute_pending: bool,
    shared_volume: u8,
}

impl Default for LocalVolume {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LocalVolume {
    pub fn new(shared_volume: u8) -> Self {
        let shared_volume = shared_volume.min(100);
        Self {
            muted: false,
            volume_before_mute: shared_volume,
            mute_pending: false,
            shared_volume,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_pending(&self) -> bool {
        self.mute_pending
    }

    pub fn shared_volume(&self) -> u8 {
        self.shared_volume
    }

    /// Level the active backend should output right now
    pub fn effective(&self) -> u8 {
        if self.muted {
            0
        } else {
            self.volume_before_mute
        }
    }

    /// First phase of a mute toggle
    pub fn begin_toggle(&mut self) -> Toggle {
        if self.mute_pending {
            return Toggle::Rejected;
        }
        if self.muted {
            self.muted = false;
            return Toggle::Unmuted(self.volume_before_mute);
        }
        self.mute_pending = true;
        Toggle::ReadLevel
    }

    /// Second phase of turning mute on. `level` is the backend's reported
    /// output, `None` when it could not be read. Returns the new effective
    /// level.
    pub fn complete_mute(&mut self, level: Option<u8>) -> u8 {
        if !self.mute_pending {
            return self.effective();
        }
        self.volume_before_mute = level.unwrap_or(self.shared_volume).min(100);
        self.muted = true;
        self.mute_pending = false;
        self.effective()
    }

    /// Record a shared volume push. Returns the level to apply, or `None`
    /// when local mute keeps output where it is.
    pub fn on_shared_volume(&mut self, percent: u8) -> Option<u8> {
        self.shared_volume = percent.min(100);
        if self.muted {
            return None;
        }
        self.volume_before_mute = self.shared_volume;
        Some(self.effective())
    }
}

//! Callback control flow.

/// What a callback wants the running loop to do next.
///
/// Pausing is not an error: the loop stops after the current unit and can
/// be resumed by calling it again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Flow {
    #[default]
    Continue,
    Pause,
}

impl Flow {
    #[must_use]
    pub fn is_pause(self) -> bool {
        self == Self::Pause
    }

    /// Pause if either side paused.
    #[must_use]
    pub fn merge(self, other: Flow) -> Flow {
        if self.is_pause() || other.is_pause() {
            Self::Pause
        } else {
            Self::Continue
        }
    }
}

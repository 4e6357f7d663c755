use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityConfig {
    /// RMS energy above which a window counts as speech.
    pub threshold: f32,
    /// Length of one analysis window.
    pub window: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            window: Duration::from_millis(100),
        }
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Speaking/silence detector for the local capture signal.
///
/// Only transitions are reported, and nothing is reported while muted.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    config: ActivityConfig,
    speaking: bool,
    muted: bool,
}

impl ActivityMonitor {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            speaking: false,
            muted: false,
        }
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// While muted the detector stays silent; speaking state restarts from silence on unmute.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if muted {
            self.speaking = false;
        }
    }

    /// Feeds one window of samples; returns the new state on a transition.
    pub fn observe(&mut self, samples: &[f32]) -> Option<bool> {
        self.observe_level(rms(samples))
    }

    pub fn observe_level(&mut self, level: f32) -> Option<bool> {
        if self.muted {
            return None;
        }
        let speaking = level > self.config.threshold;
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }
}

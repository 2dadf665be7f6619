use crate::config::WatermarkConfig;

/// Hysteresis gate driven by the client's reported buffer depth.
///
/// Engages once the buffer rises above the high watermark and releases only
/// once it falls below the low one; anything in between keeps the current
/// state.
#[derive(Debug, Clone)]
pub struct Throttle {
    config: WatermarkConfig,
    low_ms: f64,
    high_ms: f64,
    throttled: bool,
}

impl Throttle {
    pub fn new(config: WatermarkConfig) -> Self {
        Self {
            low_ms: config.low_ms,
            high_ms: config.high_ms,
            config,
            throttled: false,
        }
    }

    pub fn with_watermarks(low_ms: f64, high_ms: f64) -> Self {
        Self::new(WatermarkConfig {
            low_ms,
            high_ms,
            ..WatermarkConfig::default()
        })
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn watermarks(&self) -> (f64, f64) {
        (self.low_ms, self.high_ms)
    }

    /// Re-centres the watermarks on the client's preferred buffer size.
    pub fn retarget(&mut self, target_ms: f64) {
        let c = &self.config;
        self.low_ms = c.floor_ms.max(target_ms - c.below_target_ms);
        self.high_ms = (self.low_ms + c.min_gap_ms).max(target_ms + c.above_target_ms);
    }

    /// Feeds one status report and returns the resulting state.
    pub fn update(&mut self, buffer_ms: f64, target_ms: Option<f64>) -> bool {
        if let Some(target) = target_ms.filter(|t| t.is_finite() && *t > 0.0) {
            self.retarget(target);
        }
        if buffer_ms > self.high_ms {
            self.throttled = true;
        } else if buffer_ms < self.low_ms {
            self.throttled = false;
        }
        self.throttled
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(WatermarkConfig::default())
    }
}

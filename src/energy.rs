use tokio::time::Instant;

/// Running watt-hour total built from instantaneous power samples.
///
/// Each sample is held constant until the next one (left rectangle rule), so accuracy depends
/// on the polling interval. The sign of the total follows the sign of the samples.
#[derive(Debug, Clone)]
pub struct EnergyIntegrator {
    watt_hours: f64,
    last_watts: f64,
    last_sample: Instant,
}

impl EnergyIntegrator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            watt_hours: 0.0,
            last_watts: 0.0,
            last_sample: start,
        }
    }

    /// Adds the previous sample held over the time since it was taken, then holds `watts`.
    pub fn update(&mut self, watts: f64) {
        self.update_at(watts, Instant::now());
    }

    pub fn update_at(&mut self, watts: f64, now: Instant) {
        let elapsed_hours = now.saturating_duration_since(self.last_sample).as_secs_f64() / 3600.0;
        self.watt_hours += self.last_watts * elapsed_hours;
        log::trace!(
            "energy {:.2}W over {elapsed_hours:.6}h, total {:.4}Wh, next {watts:.2}W",
            self.last_watts,
            self.watt_hours
        );
        self.last_watts = watts;
        self.last_sample = now;
    }

    pub fn watt_hours(&self) -> f64 {
        self.watt_hours
    }
}

impl Default for EnergyIntegrator {
    fn default() -> Self {
        Self::new()
    }
}

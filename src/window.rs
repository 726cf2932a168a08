use crate::config::{RunConfig, parse_config_date};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime, Timelike, Utc};

/// The six timestamps that frame one run cycle, derived once and never
/// mutated afterward. All times are naive UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationWindow {
    /// Nominal cycle time, rounded down to the native update interval.
    pub current: NaiveDateTime,
    /// Desired warm-start time; observed precipitation lags behind
    /// real time, so the run starts 4.5 hours in the past.
    pub search_start: NaiveDateTime,
    /// Oldest timestamp worth probing for states.
    pub fail_floor: NaiveDateTime,
    pub warmup_end: NaiveDateTime,
    pub state_save_end: NaiveDateTime,
    pub run_end: NaiveDateTime,
    /// First forecast timestamp, substituted into the control document
    /// only when forecast-extended mode is active.
    pub forecast_start: NaiveDateTime,
    pub forecast_timestep: String,
    /// Forecast-extended run: the forecast-driven task directive is the
    /// active one and the run extends past the forecast horizon.
    pub forecast_mode: bool,
}

impl SimulationWindow {
    /// Derive the window for one cycle from the configuration and a wall
    /// clock reading. Hindcast mode pins `current` to the configured date.
    pub fn derive(config: &RunConfig, now: NaiveDateTime) -> Result<Self> {
        let mut current = match &config.hindcast {
            Some(hindcast) => parse_config_date(&hindcast.date)?,
            None => now,
        };

        // Round minutes down to the native interval boundary.
        let minute = match config.system_timestep_minutes {
            30 => (current.minute() / 30) * 30,
            _ => 0,
        };
        current = current
            .with_minute(minute)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .context("Failed to round cycle time")?;

        let search_start = current - Duration::minutes(4 * 60 + 30);
        let state_save_end = current - Duration::hours(4);
        let warmup_end = current - Duration::hours(4);
        let fail_floor = current - Duration::hours(6);

        let forecast_mode = config.forecast.is_some();
        let hindcast_mode = config.hindcast.is_some();

        let mut forecast_start = current;
        let mut forecast_timestep = "60u".to_string();
        let run_end = match &config.forecast {
            Some(forecast) => {
                forecast_timestep = forecast.timestep.clone();
                let forecast_end = if hindcast_mode {
                    forecast_start = parse_config_date(
                        forecast
                            .start
                            .as_deref()
                            .context("forecast.start missing in hindcast mode")?,
                    )?;
                    parse_config_date(
                        forecast
                            .end
                            .as_deref()
                            .context("forecast.end missing in hindcast mode")?,
                    )?
                } else {
                    // Operational forecasts start at the current cycle and
                    // cover the next 24 hours.
                    current + Duration::hours(24)
                };
                // Dry tail after the last forecast timestamp.
                forecast_end + Duration::hours(6)
            }
            None => current + Duration::hours(6),
        };

        let window = SimulationWindow {
            current,
            search_start,
            fail_floor,
            warmup_end,
            state_save_end,
            run_end,
            forecast_start,
            forecast_timestep,
            forecast_mode,
        };
        debug_assert!(window.search_start >= window.fail_floor);
        Ok(window)
    }

    pub fn derive_now(config: &RunConfig) -> Result<Self> {
        Self::derive(config, Utc::now().naive_utc())
    }

    /// Stamp used to name engine outputs and logs for this cycle.
    pub fn output_stamp(&self) -> String {
        self.current.format("%Y%m%d.%H%M%S").to_string()
    }

    /// Stamp used to tag per-cycle artifacts such as the consolidated
    /// observation table.
    pub fn cycle_tag(&self) -> String {
        self.current.format("%Y%m%d_%H%M").to_string()
    }
}

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Explicit run configuration. Every optional knob is a field with a
/// documented default resolved here at load time; call sites never probe
/// for missing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub domain: String,
    pub subdomain: String,
    /// Model identifier substituted into control documents (e.g. "crest").
    pub system_model: String,
    #[serde(default)]
    system_name: Option<String>,
    /// Native update interval in minutes; 30 or 60.
    pub system_timestep_minutes: u32,

    pub engine_binary: PathBuf,
    pub states_dir: PathBuf,
    pub precip_dir: PathBuf,
    pub precip_stage_dir: PathBuf,
    pub qpf_store_dir: PathBuf,
    pub template_dir: PathBuf,
    pub template: String,
    pub work_dir: PathBuf,

    /// State variables that must all exist at one timestamp for a warm start.
    pub state_variables: Vec<String>,

    #[serde(default)]
    pub hindcast: Option<HindcastConfig>,
    #[serde(default)]
    pub forecast: Option<ForecastConfig>,
    #[serde(default)]
    pub highres: Option<HighResConfig>,
    #[serde(default)]
    pub assimilation: Option<AssimilationConfig>,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HindcastConfig {
    /// Fixed cycle time, "%Y-%m-%d %H:%M" UTC.
    pub date: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForecastConfig {
    /// First forecast timestamp, required in hindcast mode.
    #[serde(default)]
    pub start: Option<String>,
    /// Last forecast timestamp, required in hindcast mode.
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_forecast_timestep")]
    pub timestep: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HighResConfig {
    /// Output-raster value at or above which a cell triggers the rerun.
    pub threshold: f64,
    pub template: String,
    pub mask_grid: PathBuf,
    pub gauge_list: PathBuf,
    pub work_dir: PathBuf,
    /// Disjoint state directory for the high-res pass; state files are
    /// copied in from `states_dir`, never shared.
    pub states_dir: PathBuf,
    #[serde(default = "default_resolution_tag")]
    pub resolution_tag: String,
    #[serde(default = "default_min_gauges")]
    pub min_gauges: usize,
    #[serde(default = "default_highres_state_variables")]
    pub state_variables: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssimilationConfig {
    /// Reservoir list file, one identifier per line. Missing file is fatal.
    pub list_path: PathBuf,
    pub manual_dir: PathBuf,
    pub climatology_dir: PathBuf,
    pub consolidated_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_forecast_timestep() -> String {
    "60u".to_string()
}

fn default_resolution_tag() -> String {
    "25m".to_string()
}

fn default_min_gauges() -> usize {
    1
}

fn default_highres_state_variables() -> Vec<String> {
    vec!["crest_SM".to_string(), "kwr_IR".to_string()]
}

pub fn parse_config_date(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, CONFIG_DATE_FORMAT)
        .with_context(|| format!("Bad config date {:?}, expected {}", raw, CONFIG_DATE_FORMAT))
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: RunConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.system_timestep_minutes, 30 | 60) {
            bail!(
                "system_timestep_minutes must be 30 or 60, got {}",
                self.system_timestep_minutes
            );
        }
        if self.state_variables.is_empty() {
            bail!("state_variables must name at least one variable");
        }
        if let Some(hindcast) = &self.hindcast {
            parse_config_date(&hindcast.date)?;
            if let Some(forecast) = &self.forecast {
                let start = forecast
                    .start
                    .as_deref()
                    .context("forecast.start is required in hindcast mode")?;
                let end = forecast
                    .end
                    .as_deref()
                    .context("forecast.end is required in hindcast mode")?;
                if parse_config_date(start)? > parse_config_date(end)? {
                    bail!("forecast.start is after forecast.end");
                }
            }
        }
        if let Some(highres) = &self.highres {
            if highres.state_variables.is_empty() {
                bail!("highres.state_variables must name at least one variable");
            }
            if highres.work_dir == self.work_dir {
                bail!("highres.work_dir must be disjoint from work_dir");
            }
        }
        Ok(())
    }

    /// Display name used in alert subjects, defaulting to
    /// "MODEL DOMAIN SUBDOMAIN" uppercased.
    pub fn system_name(&self) -> String {
        self.system_name.clone().unwrap_or_else(|| {
            format!(
                "{} {} {}",
                self.system_model.to_uppercase(),
                self.domain.to_uppercase(),
                self.subdomain.to_uppercase()
            )
        })
    }

    pub fn template_path(&self) -> PathBuf {
        self.template_dir.join(&self.template)
    }
}

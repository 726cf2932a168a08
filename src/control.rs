use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};

const TIME_FORMAT: &str = "%Y%m%d%H%M";

/// Mutually exclusive task directives: the observation-driven task runs
/// unless forecast-extended mode is on, the forecast-driven task only then.
const TASK_QPE: &str = "task=Simulation_QPE";
const TASK_QPF: &str = "task=Simulation_QPF";

/// Directive suppressed whenever a warm-start state was found.
const WARMUP_DIRECTIVE: &str = "TIME_WARMEND=";

/// Fully resolved substitution values for one control document.
#[derive(Debug, Clone)]
pub struct ControlValues {
    pub output_path: String,
    pub states_path: String,
    pub time_begin: NaiveDateTime,
    pub time_warm_end: NaiveDateTime,
    pub time_state: NaiveDateTime,
    pub time_end: NaiveDateTime,
    pub time_begin_forecast: NaiveDateTime,
    pub forecast_timestep: String,
    pub system_model: String,
}

impl ControlValues {
    fn substitutions(&self) -> [(&'static str, String); 9] {
        let stamp = |t: NaiveDateTime| t.format(TIME_FORMAT).to_string();
        [
            ("{OUTPUTPATH}", self.output_path.clone()),
            ("{STATESPATH}", self.states_path.clone()),
            ("{TIMEBEGIN}", stamp(self.time_begin)),
            ("{TIMEWARMEND}", stamp(self.time_warm_end)),
            ("{TIMESTATE}", stamp(self.time_state)),
            ("{TIMEEND}", stamp(self.time_end)),
            ("{TIMEBEGINLR}", stamp(self.time_begin_forecast)),
            ("{TIMESTEPLR}", self.forecast_timestep.clone()),
            ("{SYSTEMMODEL}", self.system_model.clone()),
        ]
    }
}

/// Render a control document from its template. Pure transform of
/// (template, values, flags): calling twice with identical inputs yields
/// byte-identical output. An unrecognized placeholder left in the template
/// is a configuration error.
pub fn render_control(
    template: &str,
    values: &ControlValues,
    forecast_mode: bool,
    state_found: bool,
) -> Result<String> {
    let substitutions = values.substitutions();
    let mut out = String::with_capacity(template.len());

    for line in template.lines() {
        let mut line = line.to_string();
        for (token, value) in &substitutions {
            if line.contains(token) {
                line = line.replace(token, value);
            }
        }

        if line.contains(TASK_QPE) {
            line = toggle_directive(TASK_QPE, !forecast_mode);
        } else if line.contains(TASK_QPF) {
            line = toggle_directive(TASK_QPF, forecast_mode);
        }

        // A resolved warm start replaces the warm-up period entirely;
        // never double-comment a line that already is.
        if state_found && line.contains(WARMUP_DIRECTIVE) && !line.trim_start().starts_with('#') {
            line.insert(0, '#');
        }

        if let Some(token) = unresolved_placeholder(&line) {
            bail!("No substitution value for placeholder {} in template", token);
        }

        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn toggle_directive(directive: &str, active: bool) -> String {
    if active {
        directive.to_string()
    } else {
        format!("#{}", directive)
    }
}

/// Find a `{NAME}` token (uppercase alphanumeric) that survived
/// substitution.
fn unresolved_placeholder(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => start = Some(i),
            b'}' => {
                if let Some(s) = start.take() {
                    let inner = &line[s + 1..i];
                    if !inner.is_empty()
                        && inner.bytes().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                    {
                        return Some(&line[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Render the template at `template_path` and write the control document
/// into the working directory.
pub fn write_control_document(
    template_path: &Path,
    work_dir: &Path,
    subdomain: &str,
    values: &ControlValues,
    forecast_mode: bool,
    state_found: bool,
) -> Result<PathBuf> {
    let template = fs::read_to_string(template_path)
        .with_context(|| format!("Failed to read control template: {:?}", template_path))?;
    let rendered = render_control(&template, values, forecast_mode, state_found)?;

    let control_path = work_dir.join(format!(
        "control_{}_{}.txt",
        subdomain, values.system_model
    ));
    fs::write(&control_path, rendered)
        .with_context(|| format!("Failed to write control document: {:?}", control_path))?;
    Ok(control_path)
}

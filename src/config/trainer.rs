use std::{num::NonZeroUsize, str::FromStr};

use serde::{Deserialize, Serialize};

use super::DeviceSet;
use crate::{
    metric::{MetricKind, DEFAULT_FIELD},
    Result, TrainerErr,
};

/// How replicas reconcile their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamServerKind {
    /// No cross-replica reconciliation, only valid with a single device.
    None,
    /// Same-process shared gradient aggregation.
    Local,
}

impl FromStr for ParamServerKind {
    type Err = TrainerErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ParamServerKind::None),
            "local" => Ok(ParamServerKind::Local),
            other => Err(TrainerErr::config(format!("unknown param_server: {other}"))),
        }
    }
}

/// An evaluation metric bound to a label field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub kind: MetricKind,
    #[serde(default = "default_field")]
    pub field: String,
}

fn default_field() -> String {
    DEFAULT_FIELD.to_string()
}

/// The options the trainer itself understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub devices: DeviceSet,
    /// Nominal amount of samples per batch, used to size every replica's slice.
    pub batch_size: NonZeroUsize,
    /// Batches accumulated between two synchronized parameter updates.
    pub update_period: NonZeroUsize,
    pub eval_train: bool,
    pub seed: u64,
    /// `None` picks `none` for one device and `local` otherwise.
    pub param_server: Option<ParamServerKind>,
    pub metrics: Vec<MetricSpec>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            devices: DeviceSet::default(),
            batch_size: NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
            update_period: NonZeroUsize::MIN,
            eval_train: true,
            seed: 0,
            param_server: None,
            metrics: Vec::new(),
        }
    }
}

/// What applying a single option did to a `TrainerConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The option isn't a trainer option.
    Ignored,
    Updated,
    /// A new metric was appended to `metrics`.
    Metric(MetricSpec),
}

impl TrainerConfig {
    /// Loads a configuration from a JSON document, missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Applies a single `name = value` option.
    ///
    /// # Errors
    /// A `Config` error if `name` is a trainer option and `value` isn't valid for it.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<Applied> {
        match name {
            "dev" => self.devices = DeviceSet::parse(value)?,
            "batch_size" => self.batch_size = parse(name, value)?,
            "update_period" => self.update_period = parse(name, value)?,
            "eval_train" => self.eval_train = parse_flag(name, value)?,
            "seed" => self.seed = parse(name, value)?,
            "param_server" => self.param_server = Some(value.parse()?),
            _ => {
                let Some(field) = metric_field(name) else {
                    return Ok(Applied::Ignored);
                };

                let spec = MetricSpec {
                    kind: value.parse()?,
                    field: field.to_string(),
                };
                self.metrics.push(spec.clone());
                return Ok(Applied::Metric(spec));
            }
        }

        Ok(Applied::Updated)
    }
}

/// Extracts the label field of a `metric` or `metric[<field>]` option name.
fn metric_field(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("metric")?;
    if rest.is_empty() {
        return Some(DEFAULT_FIELD);
    }

    rest.strip_prefix('[')?
        .strip_suffix(']')
        .filter(|field| !field.is_empty())
}

pub(crate) fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TrainerErr::config(format!("invalid value for {name}: '{value}'")))
}

pub(crate) fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(TrainerErr::config(format!(
            "invalid value for {name}: '{value}'"
        ))),
    }
}

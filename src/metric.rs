use std::{fmt::Write, str::FromStr};

use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{batch::LabelView, config::MetricSpec, Result, TrainerErr};

/// The default label field a metric is evaluated against.
pub const DEFAULT_FIELD: &str = "label";

const EPS: f64 = 1e-15;

/// The statistics a `MetricSet` knows how to accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Classification error rate.
    Error,
    /// Root mean squared error.
    Rmse,
    /// Negative log likelihood of the labelled class.
    Logloss,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Error => "error",
            MetricKind::Rmse => "rmse",
            MetricKind::Logloss => "logloss",
        }
    }

    /// Scores a single sample.
    fn score(&self, pred: ArrayView1<f32>, label: ArrayView1<f32>) -> Result<f64> {
        let target = label.first().copied().unwrap_or_default();

        let score = match self {
            MetricKind::Error => {
                let class = if pred.len() == 1 {
                    usize::from(pred[0] > 0.5)
                } else {
                    argmax(pred)
                };
                f64::from(u8::from(class != target as usize))
            }
            MetricKind::Rmse => {
                if pred.len() != label.len() {
                    return Err(TrainerErr::SizeMismatch {
                        what: "rmse label width",
                        got: label.len(),
                        expected: pred.len(),
                    });
                }

                pred.iter()
                    .zip(label)
                    .map(|(&p, &y)| f64::from(p - y).powi(2))
                    .sum()
            }
            MetricKind::Logloss => {
                if pred.len() == 1 {
                    let p = f64::from(pred[0]).clamp(EPS, 1. - EPS);
                    let y = f64::from(target);
                    -(y * p.ln() + (1. - y) * (1. - p).ln())
                } else {
                    let class = target as usize;
                    let p = pred.get(class).copied().ok_or_else(|| {
                        TrainerErr::reference(format!(
                            "logloss: label {class} is out of range for {} classes",
                            pred.len()
                        ))
                    })?;
                    -f64::from(p).max(EPS).ln()
                }
            }
        };

        Ok(score)
    }

    fn finish(&self, sum: f64, count: usize) -> f64 {
        if count == 0 {
            return 0.;
        }

        let mean = sum / count as f64;
        match self {
            MetricKind::Rmse => mean.sqrt(),
            _ => mean,
        }
    }
}

impl FromStr for MetricKind {
    type Err = TrainerErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(MetricKind::Error),
            "rmse" => Ok(MetricKind::Rmse),
            "logloss" => Ok(MetricKind::Logloss),
            other => Err(TrainerErr::config(format!("unknown metric: {other}"))),
        }
    }
}

/// Returns the index of the largest component, the first one on ties.
pub fn argmax(v: ArrayView1<f32>) -> usize {
    v.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &x)| {
            if x > max { (i, x) } else { (best, max) }
        })
        .0
}

#[derive(Debug, Clone)]
struct Metric {
    kind: MetricKind,
    field: String,
    sum: f64,
    count: usize,
}

impl Metric {
    fn label(&self) -> String {
        if self.field == DEFAULT_FIELD {
            self.kind.name().to_string()
        } else {
            format!("{}[{}]", self.kind.name(), self.field)
        }
    }
}

/// A named collection of running evaluation statistics.
#[derive(Debug, Clone, Default)]
pub struct MetricSet {
    metrics: Vec<Metric>,
}

impl MetricSet {
    /// Creates a `MetricSet` tracking the given metrics.
    pub fn new<'a, I>(specs: I) -> Self
    where
        I: IntoIterator<Item = &'a MetricSpec>,
    {
        let mut set = Self::default();
        specs.into_iter().for_each(|spec| set.add_metric(spec));
        set
    }

    pub fn add_metric(&mut self, spec: &MetricSpec) {
        self.metrics.push(Metric {
            kind: spec.kind,
            field: spec.field.clone(),
            sum: 0.,
            count: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Resets every statistic, keeping the metric definitions.
    pub fn clear(&mut self) {
        self.metrics.iter_mut().for_each(|m| {
            m.sum = 0.;
            m.count = 0;
        });
    }

    /// Accumulates a batch of predictions against its labels.
    ///
    /// # Arguments
    /// * `preds` - One prediction vector per row.
    /// * `labels` - The label fields of the same rows.
    ///
    /// # Errors
    /// If a metric names a label field the view doesn't have, or the shapes disagree.
    pub fn add_eval(&mut self, preds: ArrayView2<f32>, labels: &LabelView<'_>) -> Result<()> {
        for metric in self.metrics.iter_mut() {
            let field = labels.field(&metric.field).ok_or_else(|| {
                TrainerErr::reference(format!("metric: unknown label field '{}'", metric.field))
            })?;

            if field.nrows() != preds.nrows() {
                return Err(TrainerErr::SizeMismatch {
                    what: "metric labels",
                    got: field.nrows(),
                    expected: preds.nrows(),
                });
            }

            for (pred, label) in preds.axis_iter(Axis(0)).zip(field.axis_iter(Axis(0))) {
                metric.sum += metric.kind.score(pred, label)?;
                metric.count += 1;
            }
        }

        Ok(())
    }

    /// Formats every metric as `\t<name>-<metric>:<value>`.
    pub fn print(&self, name: &str) -> String {
        let mut out = String::new();
        for metric in &self.metrics {
            let value = metric.kind.finish(metric.sum, metric.count);
            let _ = write!(out, "\t{name}-{}:{value:.6}", metric.label());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ndarray::{array, Array2};

    use super::*;

    fn spec(kind: MetricKind) -> MetricSpec {
        MetricSpec {
            kind,
            field: DEFAULT_FIELD.to_string(),
        }
    }

    fn single_field(label: &Array2<f32>) -> (BTreeMap<String, usize>, Vec<(usize, usize)>) {
        let names = BTreeMap::from([(DEFAULT_FIELD.to_string(), 0)]);
        (names, vec![(0, label.ncols())])
    }

    #[test]
    fn test_error_multiclass_and_binary() {
        let mut set = MetricSet::new(&[spec(MetricKind::Error)]);

        let label = array![[1.], [0.]];
        let (names, ranges) = single_field(&label);
        let view = LabelView::new(label.view(), &names, &ranges).unwrap();
        let preds = array![[0.1, 0.9, 0.3], [0.2, 0.1, 0.7]];
        set.add_eval(preds.view(), &view).unwrap();
        assert_eq!(set.print("test"), "\ttest-error:0.500000");

        set.clear();
        let preds = array![[0.7], [0.2]];
        let label = array![[1.], [0.]];
        let view = LabelView::new(label.view(), &names, &ranges).unwrap();
        set.add_eval(preds.view(), &view).unwrap();
        assert_eq!(set.print("test"), "\ttest-error:0.000000");
    }

    #[test]
    fn test_rmse() {
        let mut set = MetricSet::new(&[spec(MetricKind::Rmse)]);
        let label = array![[1.], [1.]];
        let (names, ranges) = single_field(&label);
        let view = LabelView::new(label.view(), &names, &ranges).unwrap();
        set.add_eval(array![[3.], [1.]].view(), &view).unwrap();
        // sqrt((4 + 0) / 2)
        assert_eq!(set.print("eval"), format!("\teval-rmse:{:.6}", 2f64.sqrt()));
    }

    #[test]
    fn test_field_suffix_and_unknown_field() {
        let mut set = MetricSet::new(&[MetricSpec {
            kind: MetricKind::Error,
            field: "aux".to_string(),
        }]);
        assert_eq!(set.print("x"), "\tx-error[aux]:0.000000");

        let label = array![[1.]];
        let (names, ranges) = single_field(&label);
        let view = LabelView::new(label.view(), &names, &ranges).unwrap();
        let err = set.add_eval(array![[1.]].view(), &view).unwrap_err();
        assert!(matches!(err, TrainerErr::InvalidReference(_)));
    }

    #[test]
    fn test_logloss_binary() {
        let mut set = MetricSet::new(&[spec(MetricKind::Logloss)]);
        let label = array![[1.]];
        let (names, ranges) = single_field(&label);
        let view = LabelView::new(label.view(), &names, &ranges).unwrap();
        set.add_eval(array![[0.5]].view(), &view).unwrap();
        assert_eq!(set.print("t"), format!("\tt-logloss:{:.6}", 2f64.ln()));
    }

    #[test]
    fn test_argmax_first_on_ties() {
        assert_eq!(argmax(array![0.1, 0.9, 0.3, 0.2].view()), 1);
        assert_eq!(argmax(array![0.5, 0.5].view()), 0);
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("RMSE".parse::<MetricKind>().unwrap(), MetricKind::Rmse);
        assert!("auc".parse::<MetricKind>().is_err());
    }
}

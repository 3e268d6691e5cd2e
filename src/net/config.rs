use std::{
    collections::{BTreeMap, HashSet},
    io::{Read, Write},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::parse,
    metric::DEFAULT_FIELD,
    stream::{read_blob, write_blob},
    Result, TrainerErr,
};

/// Name of the input node.
pub const INPUT_NODE: &str = "in";

/// The kind of a single layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LayerKind {
    #[serde(rename = "fullc")]
    FullConnected { nhidden: usize },
    Sigmoid,
    Relu,
    Tanh,
}

impl FromStr for LayerKind {
    type Err = TrainerErr;

    /// Parses `fullc:<nhidden>`, `sigmoid`, `relu` or `tanh`.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, arg) = s
            .trim()
            .split_once(':')
            .map_or((s.trim(), None), |(k, a)| (k, Some(a)));

        match (kind, arg) {
            ("fullc", Some(nhidden)) => {
                let nhidden = parse("nhidden", nhidden)?;
                if nhidden == 0 {
                    return Err(TrainerErr::config("fullc: nhidden must be positive"));
                }
                Ok(LayerKind::FullConnected { nhidden })
            }
            ("sigmoid", None) => Ok(LayerKind::Sigmoid),
            ("relu", None) => Ok(LayerKind::Relu),
            ("tanh", None) => Ok(LayerKind::Tanh),
            _ => Err(TrainerErr::config(format!("unknown layer type: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// May be empty, unnamed layers can't be referenced.
    pub name: String,
    pub kind: LayerKind,
}

/// The loss applied to the output node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Mse,
    /// Softmax over the output with the first label column as the class index.
    Softmax,
}

impl FromStr for LossKind {
    type Err = TrainerErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mse" => Ok(LossKind::Mse),
            "softmax" => Ok(LossKind::Softmax),
            other => Err(TrainerErr::config(format!("unknown loss: {other}"))),
        }
    }
}

/// Training hyper-parameters, re-read from the options on every `configure`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyper {
    pub eta: f32,
    pub momentum: f32,
    pub wd: f32,
    pub init_scale: f32,
}

impl Default for Hyper {
    fn default() -> Self {
        Self {
            eta: 0.01,
            momentum: 0.,
            wd: 0.,
            init_scale: 1.,
        }
    }
}

/// A reference to a node of the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Name(String),
    /// `top[-k]`: the `k`-th node counting back from the output, `top[-1]` being the output.
    Top(usize),
}

impl FromStr for NodeRef {
    type Err = TrainerErr;

    fn from_str(s: &str) -> Result<Self> {
        let Some(offset) = s.strip_prefix("top[-").and_then(|r| r.strip_suffix(']')) else {
            return Ok(NodeRef::Name(s.to_string()));
        };

        offset
            .parse()
            .map(NodeRef::Top)
            .map_err(|_| TrainerErr::reference(format!("malformed node offset: {s}")))
    }
}

/// The network topology: layers, labels and loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    pub input_size: usize,
    pub layers: Vec<LayerSpec>,
    pub loss: LossKind,
    label_width: usize,
    label_names: BTreeMap<String, usize>,
    label_ranges: Vec<(usize, usize)>,
    #[serde(skip)]
    pub hyper: Hyper,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            input_size: 0,
            layers: Vec::new(),
            loss: LossKind::Mse,
            label_width: 1,
            label_names: BTreeMap::new(),
            label_ranges: Vec::new(),
            hyper: Hyper::default(),
        }
    }
}

impl NetConfig {
    /// Builds a topology from scratch out of `name = value` options.
    pub fn parse(opts: &[(String, String)]) -> Result<Self> {
        let mut cfg = Self::default();
        cfg.configure(opts)?;
        Ok(cfg)
    }

    /// Applies the options the network understands, ignoring the rest.
    ///
    /// Structural options (`input_size`, `layer[..]`, `label_..`, `loss`) are only honoured
    /// while the topology is still empty, hyper-parameters always are.
    ///
    /// # Errors
    /// A `Config` error on malformed values or if the resulting topology is invalid.
    pub fn configure(&mut self, opts: &[(String, String)]) -> Result<()> {
        let fresh = self.layers.is_empty();
        let mut labels = Vec::new();

        for (name, value) in opts {
            let name = name.as_str();
            match name {
                "eta" => self.hyper.eta = parse(name, value)?,
                "momentum" => self.hyper.momentum = parse(name, value)?,
                "wd" => self.hyper.wd = parse(name, value)?,
                "init_scale" => {
                    let scale: f32 = parse(name, value)?;
                    if !scale.is_finite() || scale < 0. {
                        return Err(TrainerErr::config(format!(
                            "init_scale must be a non-negative number, got {value}"
                        )));
                    }
                    self.hyper.init_scale = scale;
                }
                _ if !fresh => {}
                "input_size" => self.input_size = parse(name, value)?,
                "label_width" => self.label_width = parse(name, value)?,
                "loss" => self.loss = value.parse()?,
                _ => {
                    if let Some(layer) = bracketed(name, "layer") {
                        self.layers.push(LayerSpec {
                            name: layer.to_string(),
                            kind: value.parse()?,
                        });
                    } else if let Some(field) = bracketed(name, "label_vec") {
                        labels.push((field.to_string(), parse_range(name, value)?));
                    }
                }
            }
        }

        if fresh {
            self.set_labels(labels)?;
            self.validate()?;
        }

        Ok(())
    }

    fn set_labels(&mut self, labels: Vec<(String, (usize, usize))>) -> Result<()> {
        let labels = if labels.is_empty() {
            vec![(DEFAULT_FIELD.to_string(), (0, self.label_width))]
        } else {
            labels
        };

        self.label_names.clear();
        self.label_ranges.clear();

        for (name, range) in labels {
            if self.label_names.contains_key(&name) {
                return Err(TrainerErr::config(format!("label field '{name}' declared twice")));
            }
            self.label_names.insert(name, self.label_ranges.len());
            self.label_ranges.push(range);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(TrainerErr::config("input_size must be positive"));
        }
        if self.layers.is_empty() {
            return Err(TrainerErr::config("the network has no layers"));
        }

        let mut names = HashSet::new();
        if let Some(dup) = self
            .layers
            .iter()
            .map(|l| l.name.as_str())
            .filter(|name| !name.is_empty())
            .find(|name| *name == INPUT_NODE || !names.insert(*name))
        {
            return Err(TrainerErr::config(format!("layer name '{dup}' is taken")));
        }

        Ok(())
    }

    /// The amount of nodes, the input node included.
    pub fn num_nodes(&self) -> usize {
        self.layers.len() + 1
    }

    /// The width of every node, input first.
    pub fn node_widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.num_nodes());
        widths.push(self.input_size);

        for layer in &self.layers {
            let width = match layer.kind {
                LayerKind::FullConnected { nhidden } => nhidden,
                _ => widths[widths.len() - 1],
            };
            widths.push(width);
        }

        widths
    }

    pub fn node_width(&self, node: usize) -> Option<usize> {
        self.node_widths().get(node).copied()
    }

    /// Finds the index of the layer called `name`.
    ///
    /// # Errors
    /// An `InvalidReference` if there's no such layer.
    pub fn layer_index(&self, name: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| !l.name.is_empty() && l.name == name)
            .ok_or_else(|| TrainerErr::reference(format!("cannot find layer name: {name}")))
    }

    /// Resolves a node reference to its index.
    ///
    /// # Errors
    /// An `InvalidReference` for unknown names or offsets outside `1..=num_nodes`.
    pub fn node_index(&self, node: &NodeRef) -> Result<usize> {
        let nnode = self.num_nodes();

        match node {
            NodeRef::Top(offset) => {
                if !(1..=nnode).contains(offset) {
                    return Err(TrainerErr::reference(format!(
                        "node offset {offset} must be within 1..={nnode}"
                    )));
                }
                Ok(nnode - offset)
            }
            NodeRef::Name(name) if name == INPUT_NODE => Ok(0),
            NodeRef::Name(name) => self
                .layer_index(name)
                .map(|layer| layer + 1)
                .map_err(|_| TrainerErr::reference(format!("cannot find node name: {name}"))),
        }
    }

    pub fn label_names(&self) -> &BTreeMap<String, usize> {
        &self.label_names
    }

    pub fn label_ranges(&self) -> &[(usize, usize)] {
        &self.label_ranges
    }

    /// Writes the topology as a length-prefixed block.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_blob(w, &serde_json::to_vec(self)?)
    }

    /// Reads a topology written by `save`. Hyper-parameters come back as defaults.
    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let cfg: Self = serde_json::from_slice(&read_blob(r)?)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Extracts `inner` out of `<prefix>[inner]`.
fn bracketed<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?
        .strip_prefix('[')?
        .strip_suffix(']')
}

fn parse_range(name: &str, value: &str) -> Result<(usize, usize)> {
    let (begin, end) = value
        .split_once(',')
        .ok_or_else(|| TrainerErr::config(format!("{name} must be 'begin,end'")))?;

    let (begin, end): (usize, usize) = (parse(name, begin)?, parse(name, end)?);
    if begin >= end {
        return Err(TrainerErr::config(format!("{name}: empty range {begin},{end}")));
    }

    Ok((begin, end))
}

use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayView2};

use crate::{partition::SliceRange, Result, TrainerErr};

/// One mini-batch: features, optional auxiliary inputs and labels, all sharing their row count.
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub data: Array2<f32>,
    pub extra: Vec<Array2<f32>>,
    pub label: Array2<f32>,
    /// Amount of trailing rows that only pad the batch up to its fixed size.
    pub num_batch_padd: usize,
}

impl DataBatch {
    /// Creates a new `DataBatch` without auxiliary inputs nor padding.
    ///
    /// # Errors
    /// A `SizeMismatch` if `data` and `label` don't have the same amount of rows.
    pub fn new(data: Array2<f32>, label: Array2<f32>) -> Result<Self> {
        let batch = Self {
            data,
            extra: Vec::new(),
            label,
            num_batch_padd: 0,
        };
        batch.validate()?;
        Ok(batch)
    }

    pub fn with_extra(mut self, extra: Vec<Array2<f32>>) -> Result<Self> {
        self.extra = extra;
        self.validate()?;
        Ok(self)
    }

    pub fn with_padding(mut self, num_batch_padd: usize) -> Result<Self> {
        self.num_batch_padd = num_batch_padd;
        self.validate()?;
        Ok(self)
    }

    /// The true amount of samples in this batch, padding included.
    pub fn batch_size(&self) -> usize {
        self.data.nrows()
    }

    /// Checks that every tensor agrees on the sample count.
    pub fn validate(&self) -> Result<()> {
        let rows = self.batch_size();
        let mismatch = |what, got| TrainerErr::SizeMismatch {
            what,
            got,
            expected: rows,
        };

        if self.label.nrows() != rows {
            return Err(mismatch("label rows", self.label.nrows()));
        }
        if let Some(extra) = self.extra.iter().find(|e| e.nrows() != rows) {
            return Err(mismatch("auxiliary input rows", extra.nrows()));
        }
        if self.num_batch_padd > rows {
            return Err(mismatch("padding rows", self.num_batch_padd));
        }

        Ok(())
    }

    /// Copies out the rows of `range` from every tensor of the batch.
    pub(crate) fn slice(&self, range: SliceRange) -> BatchSlice {
        let rows = s![range.begin..range.end, ..];

        BatchSlice {
            data: self.data.slice(rows).to_owned(),
            extra: self.extra.iter().map(|e| e.slice(rows).to_owned()).collect(),
            label: self.label.slice(rows).to_owned(),
        }
    }
}

/// The owned rows of a batch handed to a single replica.
#[derive(Debug, Clone)]
pub struct BatchSlice {
    pub data: Array2<f32>,
    pub extra: Vec<Array2<f32>>,
    pub label: Array2<f32>,
}

/// The label tensor carved into named fields.
#[derive(Debug, Clone)]
pub struct LabelView<'a> {
    names: &'a BTreeMap<String, usize>,
    fields: Vec<ArrayView2<'a, f32>>,
}

impl<'a> LabelView<'a> {
    /// Creates a new `LabelView`.
    ///
    /// # Arguments
    /// * `label` - The full label tensor, one row per sample.
    /// * `names` - Maps field names to their index in `ranges`.
    /// * `ranges` - The `[begin, end)` column range of every field.
    ///
    /// # Errors
    /// A `SizeMismatch` if a range goes past the label width.
    pub fn new(
        label: ArrayView2<'a, f32>,
        names: &'a BTreeMap<String, usize>,
        ranges: &[(usize, usize)],
    ) -> Result<Self> {
        let width = label.ncols();

        let fields = ranges
            .iter()
            .map(|&(begin, end)| {
                if begin > end || end > width {
                    return Err(TrainerErr::SizeMismatch {
                        what: "label width",
                        got: width,
                        expected: end,
                    });
                }
                Ok(label.slice_move(s![.., begin..end]))
            })
            .collect::<Result<_>>()?;

        Ok(Self { names, fields })
    }

    /// Returns the field called `name`, if any.
    pub fn field(&self, name: &str) -> Option<ArrayView2<'a, f32>> {
        self.names
            .get(name)
            .and_then(|&i| self.fields.get(i))
            .cloned()
    }

    pub fn fields(&self) -> &[ArrayView2<'a, f32>] {
        &self.fields
    }

    /// Keeps only the first `rows` samples of every field.
    pub fn head(&self, rows: usize) -> LabelView<'a> {
        LabelView {
            names: self.names,
            fields: self
                .fields
                .iter()
                .map(|f| f.slice_move(s![..rows.min(f.nrows()), ..]))
                .collect(),
        }
    }
}

/// A rewindable source of batches.
pub trait DataIter {
    /// Rewinds to the first batch.
    fn before_first(&mut self);

    /// Advances and returns the next batch, or `None` when exhausted.
    fn next_batch(&mut self) -> Option<&DataBatch>;
}

/// A `DataIter` over batches held in memory.
#[derive(Debug, Clone, Default)]
pub struct BatchList {
    batches: Vec<DataBatch>,
    cursor: usize,
}

impl BatchList {
    pub fn new(batches: Vec<DataBatch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl DataIter for BatchList {
    fn before_first(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Option<&DataBatch> {
        let batch = self.batches.get(self.cursor)?;
        self.cursor += 1;
        Some(batch)
    }
}

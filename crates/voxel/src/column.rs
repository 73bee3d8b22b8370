use serde::{Deserialize, Serialize};

/// One run of identical values. `end` is the exclusive cumulative end
/// position, so lookups can binary-search over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Run {
    end: u32,
    value: u8,
}

/// A vertical strip of voxel values stored as coalesced runs.
///
/// Runs always cover exactly `height` voxels and no two adjacent runs share
/// a value, so two columns with the same content compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelColumn {
    runs: Vec<Run>,
}

impl VoxelColumn {
    /// Column of `height` voxels all set to `clear_value`.
    pub fn new(height: u32, clear_value: u8) -> Self {
        assert!(height > 0, "column height must be positive");
        Self {
            runs: vec![Run {
                end: height,
                value: clear_value,
            }],
        }
    }

    /// Build a column from `(length, value)` pairs, coalescing as needed.
    pub fn from_runs(runs: impl IntoIterator<Item = (u32, u8)>) -> Self {
        let mut column = Self { runs: Vec::new() };
        let mut end = 0u32;
        for (length, value) in runs {
            if length == 0 {
                continue;
            }
            end += length;
            match column.runs.last_mut() {
                Some(last) if last.value == value => last.end = end,
                _ => column.runs.push(Run { end, value }),
            }
        }
        assert!(!column.runs.is_empty(), "column needs at least one voxel");
        column
    }

    pub fn from_dense(values: &[u8]) -> Self {
        Self::from_runs(values.iter().map(|&v| (1, v)))
    }

    pub fn to_dense(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.height() as usize);
        for (length, value) in self.runs() {
            out.extend(std::iter::repeat_n(value, length as usize));
        }
        out
    }

    pub fn height(&self) -> u32 {
        self.runs.last().map_or(0, |r| r.end)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Iterate `(length, value)` pairs bottom to top.
    pub fn runs(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        let mut start = 0;
        self.runs.iter().map(move |r| {
            let length = r.end - start;
            start = r.end;
            (length, r.value)
        })
    }

    /// Uniform value of the column, if it consists of a single run.
    pub fn uniform_value(&self) -> Option<u8> {
        match self.runs.as_slice() {
            [only] => Some(only.value),
            _ => None,
        }
    }

    pub fn get(&self, pos: u32) -> u8 {
        assert!(pos < self.height(), "voxel {pos} out of range");
        let index = self.runs.partition_point(|r| r.end <= pos);
        self.runs[index].value
    }

    pub fn set(&mut self, pos: u32, value: u8) {
        self.set_span(pos, 1, value);
    }

    /// Set `length` voxels starting at `start` to `value`.
    pub fn set_span(&mut self, start: u32, length: u32, value: u8) {
        if length == 0 {
            return;
        }
        let stop = start + length;
        assert!(stop <= self.height(), "span {start}+{length} out of range");

        let first = self.runs.partition_point(|r| r.end <= start);
        let last = self.runs.partition_point(|r| r.end < stop);
        let first_start = if first == 0 { 0 } else { self.runs[first - 1].end };

        let mut replacement = Vec::with_capacity(3);
        if first_start < start {
            replacement.push(Run {
                end: start,
                value: self.runs[first].value,
            });
        }
        replacement.push(Run { end: stop, value });
        if self.runs[last].end > stop {
            replacement.push(self.runs[last]);
        }

        let inserted = replacement.len();
        self.runs.splice(first..=last, replacement);
        self.coalesce(first.saturating_sub(1), first + inserted);
    }

    /// Reset the whole column to one run of `value`.
    pub fn clear(&mut self, value: u8) {
        let height = self.height();
        self.runs.clear();
        self.runs.push(Run { end: height, value });
    }

    // merge equal neighbours within [lo, hi]
    fn coalesce(&mut self, lo: usize, hi: usize) {
        let mut i = hi.min(self.runs.len() - 1);
        while i > lo {
            if self.runs[i - 1].value == self.runs[i].value {
                self.runs[i - 1].end = self.runs[i].end;
                self.runs.remove(i);
            }
            i -= 1;
        }
    }
}

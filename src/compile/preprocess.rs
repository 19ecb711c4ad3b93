use crate::value::Value;

/// Cap on the constant pool. When exceeded, the pool is sorted by
/// frequency and the lowest quarter discarded before further accrual.
pub(crate) const MAX_POOLED_CONSTANTS: usize = 6;

/// One read range of a local: opened when the local is pushed onto the
/// operand stack, closed at the matching pop.
#[derive(Debug, Clone)]
pub(crate) struct UsageInterval {
    pub start: usize,
    /// `usize::MAX` while the interval is still open.
    pub end: usize,
    /// How many entries of the same local were already on the operand
    /// stack when this one was pushed.
    pub push_count: usize,
    /// A write to the local landed inside this interval; reads covering
    /// the write may not alias the local's slot.
    pub has_write: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LocalUsage {
    /// The first read was not dominated by a write.
    pub needs_explicit_init: bool,
    pub intervals: Vec<UsageInterval>,
    /// Write positions not shadowed by any in-flight branch.
    pub definite_writes: Vec<usize>,
    /// Write positions since the last branch or throw.
    pub writes_since_branch: Vec<usize>,
}

/// Everything the first traversal learns about a function body.
#[derive(Debug, Default)]
pub(crate) struct PreprocessData {
    pub in_preprocess: bool,
    pub locals: Vec<LocalUsage>,
    /// `(value, n)` where `n` counts references during preprocess and
    /// becomes the assigned stack offset once the pool is organized.
    pub constants: Vec<(Value, usize)>,
}

impl PreprocessData {
    pub fn reset(&mut self, local_count: usize) {
        self.locals.clear();
        self.locals.resize(local_count, LocalUsage::default());
        self.constants.clear();
    }

    /// Record a read of `local` at source position `pos`.
    pub fn add_usage(&mut self, local: u32, pos: usize, push_count: usize) {
        if !self.in_preprocess {
            return;
        }
        let info = &mut self.locals[local as usize];
        info.intervals.push(UsageInterval {
            start: pos,
            end: usize::MAX,
            push_count,
            has_write: false,
        });
        if !info.needs_explicit_init && info.writes_since_branch.is_empty() {
            let dominated = info.definite_writes.iter().any(|&w| w < pos);
            if !dominated {
                info.needs_explicit_init = true;
            }
        }
    }

    /// Close the most recently opened interval of `local`.
    pub fn close_usage(&mut self, local: u32, pos: usize) {
        if !self.in_preprocess {
            return;
        }
        let info = &mut self.locals[local as usize];
        if let Some(interval) = info
            .intervals
            .iter_mut()
            .rev()
            .find(|r| r.end == usize::MAX)
        {
            interval.end = pos;
        }
    }

    /// Record a write to `local`. `definite` is false when any active
    /// block has already seen a branch.
    pub fn add_write(&mut self, local: u32, pos: usize, definite: bool) {
        if !self.in_preprocess {
            return;
        }
        let info = &mut self.locals[local as usize];
        for interval in &mut info.intervals {
            if interval.start <= pos && pos <= interval.end {
                interval.has_write = true;
            }
        }
        if definite {
            info.definite_writes.push(pos);
        }
        info.writes_since_branch.push(pos);
    }

    /// A branch or throw invalidates every local's recent-write record.
    pub fn clear_writes_since_branch(&mut self) {
        for info in &mut self.locals {
            info.writes_since_branch.clear();
        }
    }

    /// Does any interval of `local` covering `pos` contain a write?
    pub fn interval_write_covers(&self, local: u32, pos: usize) -> bool {
        self.locals[local as usize]
            .intervals
            .iter()
            .any(|r| r.start <= pos && pos <= r.end && r.has_write)
    }

    /// Offer a constant to the pool; only counts during preprocess.
    pub fn add_constant(&mut self, value: Value) {
        if !self.in_preprocess {
            return;
        }
        match self.constants.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => self.constants.push((value, 1)),
        }
        if self.constants.len() > MAX_POOLED_CONSTANTS {
            self.sort_by_count();
            let keep = self.constants.len() - MAX_POOLED_CONSTANTS / 4;
            self.constants.truncate(keep);
        }
    }

    /// Sort the pool most-referenced first.
    pub fn sort_by_count(&mut self) {
        self.constants.sort_by(|a, b| b.1.cmp(&a.1));
    }

    /// Stack offset of a pooled constant, once offsets are assigned.
    pub fn pooled_offset(&self, value: &Value) -> Option<u32> {
        self.constants
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, off)| *off as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(values: &[(i32, usize)]) -> PreprocessData {
        let mut pre = PreprocessData {
            in_preprocess: true,
            ..PreprocessData::default()
        };
        for &(v, n) in values {
            for _ in 0..n {
                pre.add_constant(Value::I32(v));
            }
        }
        pre
    }

    #[test]
    fn pool_counts_duplicates() {
        let pre = pool_with(&[(7, 3), (9, 1)]);
        assert_eq!(pre.constants, vec![(Value::I32(7), 3), (Value::I32(9), 1)]);
    }

    #[test]
    fn pool_evicts_lowest_quarter_past_the_cap() {
        // Six distinct constants fill the pool; the seventh triggers a
        // sort and drops the least-referenced entry.
        let mut pre = pool_with(&[(1, 5), (2, 4), (3, 3), (4, 2), (5, 2), (6, 1)]);
        pre.add_constant(Value::I32(7));
        assert_eq!(pre.constants.len(), MAX_POOLED_CONSTANTS);
        assert!(!pre.constants.iter().any(|(v, _)| *v == Value::I32(7)));
        assert!(pre.constants.iter().any(|(v, _)| *v == Value::I32(6)));
    }

    #[test]
    fn first_read_without_dominating_write_needs_init() {
        let mut pre = PreprocessData::default();
        pre.reset(2);
        pre.in_preprocess = true;
        pre.add_write(0, 10, true);
        pre.add_usage(0, 20, 0);
        assert!(!pre.locals[0].needs_explicit_init);

        pre.clear_writes_since_branch();
        pre.add_usage(1, 30, 0);
        assert!(pre.locals[1].needs_explicit_init);
    }

    #[test]
    fn writes_mark_covering_intervals() {
        let mut pre = PreprocessData::default();
        pre.reset(1);
        pre.in_preprocess = true;
        pre.add_usage(0, 10, 0);
        pre.add_write(0, 15, true);
        pre.close_usage(0, 20);
        assert!(pre.interval_write_covers(0, 15));
        assert!(pre.locals[0].intervals[0].has_write);
        assert_eq!(pre.locals[0].intervals[0].end, 20);
    }
}

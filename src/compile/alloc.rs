//! Liveness-driven frame packing.
//!
//! Runs over a function's finished bytecode: rediscovers per-slot live
//! ranges, extends them across branches, packs parameters, locals and
//! pooled constants into a minimal frame of 4-byte cells, and rewrites
//! every operand field to the assigned offsets.

use std::collections::BTreeMap;

use crate::bytecode::opcode::*;
use crate::bytecode::{
    instr_size, layout, CodeBuffer, BR_TABLE_COND_AT, BR_TABLE_DEFAULT_AT, BR_TABLE_ENTRIES_AT,
    BR_TABLE_SIZE_AT, CALL_INDEX_AT, CALL_INDIRECT_CALLEE_AT, CALL_INDIRECT_OFFSETS_AT,
    CALL_INDIRECT_TYPE_AT, CALL_OFFSETS_AT, END_OFFSETS_AT, JUMP_OFFSET_AT, THROW_COUNT_AT,
    THROW_OFFSETS_AT,
};
use crate::bytecode::dump;
use crate::compile::FunctionCompiler;
use crate::value::ValueKind;

/// Live-range record of one tracked slot (parameter, local or pooled
/// constant), keyed by its original frame offset.
#[derive(Debug)]
struct SlotRange {
    kind: ValueKind,
    start: usize,
    end: usize,
    sets: Vec<usize>,
    gets: Vec<usize>,
    needs_init: bool,
    new_pos: u32,
    /// Currently backed by frame cells.
    live: bool,
    /// Already assigned once; slots allocate at most once.
    assigned: bool,
    /// Parameters and dead-region aliases never enter the cell walk.
    permanent: bool,
}

impl SlotRange {
    fn new(kind: ValueKind, original: u32) -> Self {
        SlotRange {
            kind,
            start: usize::MAX,
            end: 0,
            sets: Vec::new(),
            gets: Vec::new(),
            needs_init: false,
            new_pos: original,
            live: false,
            assigned: false,
            permanent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Free,
    Reserved,
    /// Continuation cell of a wider allocation.
    Joined,
}

/// The packed frame: a vector of 4-byte cells above `base`, with free
/// lists per size class. Splitting and coalescing keep 8-byte values
/// 8-aligned and 16-byte values 16-aligned in absolute offsets.
#[derive(Debug)]
struct FrameAlloc {
    base: u32,
    cells: Vec<CellState>,
    free32: Vec<usize>,
    free64: Vec<usize>,
    free128: Vec<usize>,
}

impl FrameAlloc {
    fn new(base: u32) -> Self {
        FrameAlloc {
            base,
            cells: Vec::new(),
            free32: Vec::new(),
            free64: Vec::new(),
            free128: Vec::new(),
        }
    }

    fn offset_of(&self, cell: usize) -> u32 {
        self.base + 4 * cell as u32
    }

    fn aligned(&self, cell: usize, bytes: u32) -> bool {
        self.offset_of(cell) % bytes == 0
    }

    fn frame_end(&self) -> u32 {
        self.offset_of(self.cells.len())
    }

    fn alloc(&mut self, kind: ValueKind) -> u32 {
        match kind.slot_size() {
            4 => self.alloc32(),
            8 => self.alloc64(),
            _ => self.alloc128(),
        }
    }

    fn alloc32(&mut self) -> u32 {
        if let Some(c) = self.free32.pop() {
            self.cells[c] = CellState::Reserved;
            return self.offset_of(c);
        }
        if let Some(c) = self.free64.pop() {
            self.cells[c] = CellState::Reserved;
            self.cells[c + 1] = CellState::Free;
            self.free32.push(c + 1);
            return self.offset_of(c);
        }
        if let Some(c) = self.free128.pop() {
            self.cells[c] = CellState::Reserved;
            self.cells[c + 1] = CellState::Free;
            self.free32.push(c + 1);
            self.free64.push(c + 2);
            return self.offset_of(c);
        }
        self.grow(1, 4)
    }

    fn alloc64(&mut self) -> u32 {
        if let Some(c) = self.free64.pop() {
            self.cells[c] = CellState::Reserved;
            self.cells[c + 1] = CellState::Joined;
            return self.offset_of(c);
        }
        if let Some(c) = self.free128.pop() {
            self.cells[c] = CellState::Reserved;
            self.cells[c + 1] = CellState::Joined;
            self.free64.push(c + 2);
            return self.offset_of(c);
        }
        self.grow(2, 8)
    }

    fn alloc128(&mut self) -> u32 {
        if let Some(c) = self.free128.pop() {
            self.cells[c] = CellState::Reserved;
            for k in c + 1..c + 4 {
                self.cells[k] = CellState::Joined;
            }
            return self.offset_of(c);
        }
        self.grow(4, 16)
    }

    /// Extend the frame by `n` cells at an offset aligned to
    /// `align_bytes`, absorbing any free cells at the tail.
    fn grow(&mut self, n: usize, align_bytes: u32) -> u32 {
        let old_len = self.cells.len();
        let mut start = old_len;
        while start > 0 && self.cells[start - 1] == CellState::Free {
            start -= 1;
        }
        let mut c = start;
        while !self.aligned(c, align_bytes) {
            c += 1;
        }
        // Cells from c on become part of the allocation.
        self.free32.retain(|&x| x < c);
        self.free64.retain(|&x| x < c);
        self.free128.retain(|&x| x < c);
        while self.cells.len() < c + n {
            self.cells.push(CellState::Free);
        }
        // Alignment padding below the allocation stays free.
        for k in old_len..c {
            self.free32.push(k);
        }
        // Absorbed tail cells beyond the allocation go back as well.
        for k in c + n..old_len {
            self.free32.push(k);
        }
        self.cells[c] = CellState::Reserved;
        for k in c + 1..c + n {
            self.cells[k] = CellState::Joined;
        }
        self.offset_of(c)
    }

    fn free(&mut self, offset: u32, kind: ValueKind) {
        let c = ((offset - self.base) / 4) as usize;
        match kind.slot_size() {
            4 => {
                self.cells[c] = CellState::Free;
                self.free32.push(c);
                self.coalesce32(c);
            }
            8 => {
                self.cells[c] = CellState::Free;
                self.cells[c + 1] = CellState::Free;
                self.free64.push(c);
                self.coalesce64(c);
            }
            _ => {
                for k in c..c + 4 {
                    self.cells[k] = CellState::Free;
                }
                self.free128.push(c);
            }
        }
    }

    /// Merge an 8-aligned pair of free 32-bit cells into a 64-bit
    /// entry, then try the 128-bit merge.
    fn coalesce32(&mut self, c: usize) {
        let p = if self.aligned(c, 8) {
            c
        } else if c > 0 && self.aligned(c - 1, 8) {
            c - 1
        } else {
            return;
        };
        if p + 1 >= self.cells.len() {
            return;
        }
        if !list_contains(&self.free32, p) || !list_contains(&self.free32, p + 1) {
            return;
        }
        remove_from(&mut self.free32, p);
        remove_from(&mut self.free32, p + 1);
        self.free64.push(p);
        self.coalesce64(p);
    }

    /// Merge a 16-aligned pair of free 64-bit entries into a 128-bit
    /// entry.
    fn coalesce64(&mut self, p: usize) {
        let quad = if self.aligned(p, 16) {
            p
        } else if p >= 2 && self.aligned(p - 2, 16) {
            p - 2
        } else {
            return;
        };
        let buddy = if quad == p { p + 2 } else { p - 2 };
        if buddy + 1 >= self.cells.len() {
            return;
        }
        if !list_contains(&self.free64, p) || !list_contains(&self.free64, buddy) {
            return;
        }
        remove_from(&mut self.free64, p);
        remove_from(&mut self.free64, buddy);
        self.free128.push(quad);
    }
}

fn list_contains(list: &[usize], v: usize) -> bool {
    list.iter().any(|&x| x == v)
}

fn remove_from(list: &mut Vec<usize>, v: usize) {
    if let Some(i) = list.iter().position(|&x| x == v) {
        list.swap_remove(i);
    }
}

fn mark(ranges: &mut BTreeMap<u32, SlotRange>, offset: u32, at: usize, is_set: bool) {
    if let Some(r) = ranges.get_mut(&offset) {
        if r.start > at {
            r.start = at;
        }
        if r.end < at {
            r.end = at;
        }
        if is_set {
            r.sets.push(at);
        } else {
            r.gets.push(at);
        }
    }
}

/// Parameter and result kinds referenced by a call record.
fn call_kinds(c: &FunctionCompiler<'_>, pos: usize, op: u16) -> (Vec<ValueKind>, Vec<ValueKind>) {
    let ft = if op == OP_CALL {
        let index = c.func.code.read_u32_at(pos + CALL_INDEX_AT);
        c.ctx.function_type(index)
    } else {
        let type_index = c.func.code.read_u32_at(pos + CALL_INDIRECT_TYPE_AT);
        &c.ctx.types[type_index as usize]
    };
    (ft.params().to_vec(), ft.results().to_vec())
}

/// Entry point: pack one compiled function's frame and rewrite its
/// operands. Functions without declared locals are already canonical.
pub(crate) fn pack_frame(c: &mut FunctionCompiler<'_>) {
    if c.locals.len() == c.func_type.params().len() {
        return;
    }

    let code_len = c.func.code.len();
    let mut instr_positions = Vec::new();
    {
        let mut pos = 0;
        while pos < code_len {
            instr_positions.push(pos);
            pos += instr_size(c.func.code.bytes(), pos);
        }
    }

    // ---- Step A: live-range discovery ------------------------------------

    let mut ranges: BTreeMap<u32, SlotRange> = BTreeMap::new();
    let param_count = c.func_type.params().len();
    for (i, info) in c.locals.iter().enumerate() {
        let mut range = SlotRange::new(info.kind, info.pos);
        if i < param_count {
            range.start = 0;
            range.sets.push(0);
            range.permanent = true;
            range.assigned = true;
        }
        ranges.insert(info.pos, range);
    }
    for (value, off) in &c.pre.constants {
        ranges.insert(*off as u32, SlotRange::new(value.kind(), *off as u32));
    }

    // `(from, to)` pairs of every branch edge.
    let mut labels: Vec<(usize, usize)> = Vec::new();

    for &pos in &instr_positions {
        let op = c.func.code.read_u16_at(pos);
        match op {
            OP_JUMP => {
                let target = (pos as i64 + c.func.code.read_i32_at(pos + JUMP_OFFSET_AT) as i64)
                    as usize;
                if target != pos {
                    labels.push((pos, target));
                }
            }
            OP_JUMP_IF_TRUE | OP_JUMP_IF_FALSE => {
                let src = c.func.code.read_u16_at(pos + 2) as u32;
                mark(&mut ranges, src, pos, false);
                let target = (pos as i64 + c.func.code.read_i32_at(pos + JUMP_OFFSET_AT) as i64)
                    as usize;
                if target != pos {
                    labels.push((pos, target));
                }
            }
            OP_BR_TABLE => {
                let cond = c.func.code.read_u16_at(pos + BR_TABLE_COND_AT) as u32;
                mark(&mut ranges, cond, pos, false);
                let count = c.func.code.read_u32_at(pos + BR_TABLE_SIZE_AT) as usize;
                let default = c.func.code.read_i32_at(pos + BR_TABLE_DEFAULT_AT);
                if default != 0 {
                    labels.push((pos, (pos as i64 + default as i64) as usize));
                }
                for j in 0..count {
                    let o = c.func.code.read_i32_at(pos + BR_TABLE_ENTRIES_AT + 4 * j);
                    if o != 0 {
                        labels.push((pos, (pos as i64 + o as i64) as usize));
                    }
                }
            }
            OP_END => {
                let mut at = pos + END_OFFSETS_AT;
                for kind in c.func_type.results().to_vec() {
                    let off = c.func.code.read_u16_at(at) as u32;
                    mark(&mut ranges, off, pos, false);
                    at += 2 * kind.copy_count() as usize;
                }
            }
            OP_CALL | OP_CALL_INDIRECT => {
                let (params, results) = call_kinds(c, pos, op);
                let offsets_at = if op == OP_CALL {
                    CALL_OFFSETS_AT
                } else {
                    let callee = c.func.code.read_u16_at(pos + CALL_INDIRECT_CALLEE_AT) as u32;
                    mark(&mut ranges, callee, pos, false);
                    CALL_INDIRECT_OFFSETS_AT
                };
                let mut at = pos + offsets_at;
                for kind in params {
                    let off = c.func.code.read_u16_at(at) as u32;
                    mark(&mut ranges, off, pos, false);
                    at += 2 * kind.copy_count() as usize;
                }
                for kind in results {
                    let off = c.func.code.read_u16_at(at) as u32;
                    mark(&mut ranges, off, pos, true);
                    at += 2 * kind.copy_count() as usize;
                }
            }
            OP_THROW => {
                let count = c.func.code.read_u16_at(pos + THROW_COUNT_AT) as usize;
                for j in 0..count {
                    let off = c.func.code.read_u16_at(pos + THROW_OFFSETS_AT + 2 * j) as u32;
                    mark(&mut ranges, off, pos, false);
                }
            }
            _ => {
                let l = layout(op);
                if let Some(at) = l.dst {
                    mark(&mut ranges, c.func.code.read_u16_at(pos + at) as u32, pos, true);
                }
                for field in [l.src0, l.src1, l.extra].into_iter().flatten() {
                    mark(
                        &mut ranges,
                        c.func.code.read_u16_at(pos + field) as u32,
                        pos,
                        false,
                    );
                }
            }
        }
    }

    labels.sort_by_key(|&(from, _)| from);

    // ---- Step B: range extension across branches -------------------------

    for range in ranges.values_mut() {
        let mut seen: Vec<(usize, usize)> = Vec::new();
        let mut work: Vec<usize> = range.gets.clone();
        while let Some(p) = work.pop() {
            // The dominating set closest below p.
            let set = range.sets.iter().rev().find(|&&s| s <= p).copied();
            let Some(set) = set else {
                range.needs_init = true;
                range.start = 0;
                continue;
            };
            // The label closest below p.
            let idx = labels.partition_point(|&(from, _)| from < p);
            if idx == 0 {
                continue;
            }
            let (from, to) = labels[idx - 1];
            seen.push((from, to));
            if from > to {
                // Back edge.
                if set > from {
                    continue;
                }
                if set < to {
                    work.push(to.saturating_sub(1));
                }
                if set > to && set < from {
                    work.push(from.saturating_sub(1));
                }
            } else if from < to {
                // Forward edge.
                if set > to {
                    continue;
                }
                if set < from || (set > from && set < to) {
                    work.push(from.saturating_sub(1));
                }
            }
        }
        for (from, to) in seen {
            if from < range.start {
                range.start = from;
            }
            if to > range.end {
                range.end = to;
            }
        }
    }

    // Parameters arrive initialized.
    for info in c.locals.iter().take(param_count) {
        if let Some(r) = ranges.get_mut(&info.pos) {
            r.needs_init = false;
        }
    }

    // ---- Step C: frame packing -------------------------------------------

    let param_size = c.func_type.param_stack_size();

    // All slots with no live range share one dead region sized to the
    // widest of them.
    let mut dead_width = 0u32;
    for range in ranges.values_mut() {
        if range.permanent {
            continue;
        }
        if range.start == usize::MAX || range.start == range.end {
            range.new_pos = param_size;
            range.permanent = true;
            range.assigned = true;
            dead_width = dead_width.max(range.kind.slot_size());
        }
    }

    let mut frame = FrameAlloc::new(param_size + dead_width);

    for &pos in &instr_positions {
        for range in ranges.values_mut() {
            if !range.permanent && range.live && range.end == pos {
                frame.free(range.new_pos, range.kind);
                range.live = false;
            }
        }
        for range in ranges.values_mut() {
            if !range.permanent && !range.assigned && range.start == pos {
                range.new_pos = frame.alloc(range.kind);
                range.assigned = true;
                range.live = true;
            }
        }
    }

    let new_end = frame.frame_end();
    let max_offset = c.initial_stack_size;
    let diff = max_offset.saturating_sub(new_end);

    // ---- Step D: operand rewriting ---------------------------------------

    let remap = |ranges: &BTreeMap<u32, SlotRange>, off: u32| -> u32 {
        match ranges.get(&off) {
            Some(r) => r.new_pos,
            None => off.saturating_sub(diff),
        }
    };

    for &pos in &instr_positions {
        let op = c.func.code.read_u16_at(pos);
        match op {
            OP_JUMP => {}
            OP_JUMP_IF_TRUE | OP_JUMP_IF_FALSE => {
                let src = c.func.code.read_u16_at(pos + 2) as u32;
                let new = remap(&ranges, src);
                c.func.code.write_u16_at(pos + 2, new as u16);
            }
            OP_BR_TABLE => {
                let cond = c.func.code.read_u16_at(pos + BR_TABLE_COND_AT) as u32;
                let new = remap(&ranges, cond);
                c.func.code.write_u16_at(pos + BR_TABLE_COND_AT, new as u16);
            }
            OP_END => {
                let kinds = c.func_type.results().to_vec();
                rewrite_table(&mut c.func.code, pos + END_OFFSETS_AT, &kinds, &ranges, &remap);
            }
            OP_CALL | OP_CALL_INDIRECT => {
                let (params, results) = call_kinds(c, pos, op);
                let offsets_at = if op == OP_CALL {
                    CALL_OFFSETS_AT
                } else {
                    let callee = c.func.code.read_u16_at(pos + CALL_INDIRECT_CALLEE_AT) as u32;
                    let new = remap(&ranges, callee);
                    c.func
                        .code
                        .write_u16_at(pos + CALL_INDIRECT_CALLEE_AT, new as u16);
                    CALL_INDIRECT_OFFSETS_AT
                };
                let mut kinds = params;
                kinds.extend(results);
                rewrite_table(&mut c.func.code, pos + offsets_at, &kinds, &ranges, &remap);
            }
            OP_THROW => {
                let count = c.func.code.read_u16_at(pos + THROW_COUNT_AT) as usize;
                for j in 0..count {
                    let at = pos + THROW_OFFSETS_AT + 2 * j;
                    let off = c.func.code.read_u16_at(at) as u32;
                    let new = remap(&ranges, off);
                    c.func.code.write_u16_at(at, new as u16);
                }
            }
            _ => {
                let l = layout(op);
                for field in [l.dst, l.src0, l.src1, l.extra].into_iter().flatten() {
                    let off = c.func.code.read_u16_at(pos + field) as u32;
                    let new = remap(&ranges, off);
                    c.func.code.write_u16_at(pos + field, new as u16);
                }
            }
        }
    }

    // ---- Step E: init prelude and frame accounting -----------------------

    let mut prelude = CodeBuffer::new();
    for range in ranges.values() {
        if !range.needs_init {
            continue;
        }
        match range.kind.slot_size() {
            4 => {
                prelude.push_u16(OP_CONST32);
                prelude.push_u16(range.new_pos as u16);
                prelude.push_u32(0);
            }
            8 => {
                prelude.push_u16(OP_CONST64);
                prelude.push_u16(range.new_pos as u16);
                prelude.push_u64(0);
            }
            _ => {
                prelude.push_u16(OP_CONST128);
                prelude.push_u16(range.new_pos as u16);
                prelude.push_bytes(&[0u8; 16]);
            }
        }
    }
    let prelude_len = prelude.len();
    if prelude_len > 0 {
        c.func.code.splice_front(prelude.bytes());
        // Catch ranges are absolute byte positions; branch offsets are
        // relative and unaffected.
        for entry in &mut c.func.catch_table {
            entry.try_start += prelude_len;
            entry.try_end += prelude_len;
            entry.catch_start += prelude_len;
        }
    }

    c.func.required_stack_size = c
        .func
        .required_stack_size
        .saturating_sub(diff)
        .max(new_end);
    for entry in &mut c.func.catch_table {
        entry.stack_size_to_be = entry.stack_size_to_be.saturating_sub(diff);
    }

    if dump::enabled() {
        c.func.local_ranges.clear();
        for range in ranges.values() {
            if range.start == usize::MAX {
                continue;
            }
            let start = if range.start != 0 {
                range.start + prelude_len
            } else {
                0
            };
            c.func.local_ranges.push((start, range.end + prelude_len));
        }
    }
}

fn rewrite_table(
    code: &mut CodeBuffer,
    offsets_at: usize,
    kinds: &[ValueKind],
    ranges: &BTreeMap<u32, SlotRange>,
    remap: &dyn Fn(&BTreeMap<u32, SlotRange>, u32) -> u32,
) {
    let mut at = offsets_at;
    for kind in kinds {
        let off = code.read_u16_at(at) as u32;
        let new = remap(ranges, off);
        code.write_u16_at(at, new as u16);
        if *kind == ValueKind::V128 {
            code.write_u16_at(at + 2, (new + 8) as u16);
            at += 4;
        } else {
            at += 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_i32_slots_share_one_cell() {
        let mut frame = FrameAlloc::new(0);
        let a = frame.alloc(ValueKind::I32);
        frame.free(a, ValueKind::I32);
        let b = frame.alloc(ValueKind::I32);
        frame.free(b, ValueKind::I32);
        let d = frame.alloc(ValueKind::I32);
        assert_eq!(a, 0);
        assert_eq!(b, 0);
        assert_eq!(d, 0);
        assert_eq!(frame.frame_end(), 4);
    }

    #[test]
    fn disjoint_f64_slots_share_one_pair() {
        let mut frame = FrameAlloc::new(0);
        let a = frame.alloc(ValueKind::F64);
        frame.free(a, ValueKind::F64);
        let b = frame.alloc(ValueKind::F64);
        assert_eq!(a, 0);
        assert_eq!(b, 0);
        assert_eq!(frame.frame_end(), 8);
    }

    #[test]
    fn freed_i32_tail_seeds_an_aligned_v128() {
        let mut frame = FrameAlloc::new(0);
        let a = frame.alloc(ValueKind::I32);
        assert_eq!(a, 0);
        frame.free(a, ValueKind::I32);
        // The freed cell is 16-aligned; the v128 reuses it and grows
        // three fresh cells.
        let v = frame.alloc(ValueKind::V128);
        assert_eq!(v, 0);
        assert_eq!(frame.frame_end(), 16);
    }

    #[test]
    fn eight_byte_values_land_eight_aligned() {
        let mut frame = FrameAlloc::new(0);
        let a = frame.alloc(ValueKind::I32);
        let b = frame.alloc(ValueKind::I64);
        assert_eq!(a, 0);
        assert_eq!(b, 8);
        // The padding cell at offset 4 is reusable.
        let d = frame.alloc(ValueKind::I32);
        assert_eq!(d, 4);
        assert_eq!(frame.frame_end(), 16);
    }

    #[test]
    fn coalescing_rebuilds_a_v128_slot() {
        let mut frame = FrameAlloc::new(0);
        let a = frame.alloc(ValueKind::I64);
        let b = frame.alloc(ValueKind::I64);
        frame.free(a, ValueKind::I64);
        frame.free(b, ValueKind::I64);
        let v = frame.alloc(ValueKind::V128);
        assert_eq!(v, 0);
        assert_eq!(frame.frame_end(), 16);
    }

    #[test]
    fn split_remainders_return_to_smaller_lists() {
        let mut frame = FrameAlloc::new(0);
        let v = frame.alloc(ValueKind::V128);
        frame.free(v, ValueKind::V128);
        let a = frame.alloc(ValueKind::I32);
        assert_eq!(a, 0);
        // Remaining 4 + 8 bytes of the former 128-bit slot are free.
        let b = frame.alloc(ValueKind::I64);
        assert_eq!(b, 8);
        let d = frame.alloc(ValueKind::I32);
        assert_eq!(d, 4);
        assert_eq!(frame.frame_end(), 16);
    }
}

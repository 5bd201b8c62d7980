//! Aggregate iterator: one result row per entity.
//!
//! Serves any subset of {min, max, sum, count, first, last, first_row,
//! last_row, firstts, lastts, firstrowts, lastrowts}. Queries made up
//! entirely of the first/last family walk partitions from the matching
//! end of time and stop as soon as every candidate is settled; later
//! partitions cannot improve them because partition time ranges are
//! disjoint and ordered. The general path reuses per-block
//! pre-aggregates whenever a whole block qualifies and falls back to
//! the aggregate calculator otherwise.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::agg::{var_run_agg, AggCalc, AggState, SumValue};
use crate::context::OpContext;
use crate::data::{ts_in_spans, AggType, ColumnSchema, EntityId, Timestamp, TsSpan};
use crate::iter::ColumnBatch;
use crate::storage::block::BlockItem;
use crate::storage::partition::Partition;
use crate::storage::segment::Segment;
use crate::Result;

/// One requested aggregate: a projected column and the function over
/// it.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub col: ColumnSchema,
    pub agg: AggType,
}

/// One finished aggregate value.
#[derive(Debug, Clone, PartialEq)]
pub enum AggValue {
    Null,
    /// Fixed-width cell image in the projected column's type.
    Cell(Vec<u8>),
    /// Materialized var-length value.
    Var(Vec<u8>),
    /// Promoted integer SUM.
    Int(i64),
    /// Promoted float (or overflowed) SUM.
    Float(f64),
    Ts(Timestamp),
    Count(u64),
}

/// The aggregate result row of one entity.
#[derive(Debug, Clone)]
pub struct AggRow {
    pub entity_id: EntityId,
    pub values: Vec<AggValue>,
}

pub struct AggIterator {
    /// Ascending time order.
    partitions: Vec<Arc<Partition>>,
    entity_ids: Vec<EntityId>,
    ts_spans: Vec<TsSpan>,
    specs: Vec<AggSpec>,
    cur_entity_idx: usize,

    only_first: bool,
    only_last: bool,
    only_first_last: bool,
}

/// Running candidates and accumulators for one entity.
struct EntityAcc {
    states: Vec<AggState>,
    first: Vec<Option<(Timestamp, AggValue)>>,
    last: Vec<Option<(Timestamp, AggValue)>>,
    first_row: Option<(Timestamp, Vec<AggValue>)>,
    last_row: Option<(Timestamp, Vec<AggValue>)>,
}

impl EntityAcc {
    fn new(specs: &[AggSpec]) -> Self {
        Self {
            states: specs.iter().map(|s| AggState::new(s.col.ty)).collect(),
            first: vec![None; specs.len()],
            last: vec![None; specs.len()],
            first_row: None,
            last_row: None,
        }
    }

    fn all_first_found(&self, specs: &[AggSpec]) -> bool {
        specs.iter().enumerate().all(|(i, s)| match s.agg {
            AggType::First | AggType::FirstTs => self.first[i].is_some(),
            AggType::FirstRow | AggType::FirstRowTs => self.first_row.is_some(),
            _ => true,
        })
    }

    fn all_last_found(&self, specs: &[AggSpec]) -> bool {
        specs.iter().enumerate().all(|(i, s)| match s.agg {
            AggType::Last | AggType::LastTs => self.last[i].is_some(),
            AggType::LastRow | AggType::LastRowTs => self.last_row.is_some(),
            _ => true,
        })
    }
}

impl AggIterator {
    pub fn new(
        partitions: Vec<Arc<Partition>>,
        entity_ids: Vec<EntityId>,
        ts_spans: Vec<TsSpan>,
        specs: Vec<AggSpec>,
    ) -> Self {
        let only_first = !specs.is_empty() && specs.iter().all(|s| s.agg.is_first_family());
        let only_last = !specs.is_empty() && specs.iter().all(|s| s.agg.is_last_family());
        let only_first_last = !specs.is_empty() && specs.iter().all(|s| s.agg.is_first_last());
        Self {
            partitions,
            entity_ids,
            ts_spans,
            specs,
            cur_entity_idx: 0,
            only_first,
            only_last,
            only_first_last,
        }
    }

    /// Aggregate the next entity. None when the entity list is done.
    pub fn next(&mut self, ctx: &OpContext) -> Result<Option<AggRow>> {
        if self.cur_entity_idx >= self.entity_ids.len() {
            return Ok(None);
        }
        let entity_id = self.entity_ids[self.cur_entity_idx];
        self.cur_entity_idx += 1;

        let mut acc = EntityAcc::new(&self.specs);
        if self.only_first {
            self.scan_first(ctx, entity_id, &mut acc)?;
        } else if self.only_last {
            self.scan_last(ctx, entity_id, &mut acc)?;
        } else if self.only_first_last {
            self.scan_first(ctx, entity_id, &mut acc)?;
            self.scan_last(ctx, entity_id, &mut acc)?;
        } else {
            self.scan_general(ctx, entity_id, &mut acc)?;
        }
        Ok(Some(self.finalize(entity_id, acc)))
    }

    fn wants_first(&self) -> bool {
        self.specs.iter().any(|s| s.agg.is_first_family())
    }

    fn wants_last(&self) -> bool {
        self.specs.iter().any(|s| s.agg.is_last_family())
    }

    // ========================================================================
    // Short-circuit paths
    // ========================================================================

    fn scan_first(&self, ctx: &OpContext, entity_id: EntityId, acc: &mut EntityAcc) -> Result<()> {
        for p in self.partitions.iter() {
            ctx.check()?;
            self.scan_partition_rows(p, entity_id, acc, true, false)?;
            if acc.all_first_found(&self.specs) {
                break;
            }
        }
        Ok(())
    }

    fn scan_last(&self, ctx: &OpContext, entity_id: EntityId, acc: &mut EntityAcc) -> Result<()> {
        for p in self.partitions.iter().rev() {
            ctx.check()?;
            self.scan_partition_rows(p, entity_id, acc, false, true)?;
            if acc.all_last_found(&self.specs) {
                break;
            }
        }
        Ok(())
    }

    // ========================================================================
    // General path
    // ========================================================================

    fn scan_general(&self, ctx: &OpContext, entity_id: EntityId, acc: &mut EntityAcc) -> Result<()> {
        let track_first = self.wants_first();
        let track_last = self.wants_last();
        for p in self.partitions.iter() {
            ctx.check()?;
            for item in p.get_all_block_items(entity_id, false) {
                let published = item.publish_count();
                if published == 0 {
                    continue;
                }
                if !self
                    .ts_spans
                    .iter()
                    .any(|s| s.overlaps(item.min_ts(), item.max_ts()))
                {
                    continue;
                }
                let segment = match p.segment_for_block(item.block_id) {
                    Some(s) => s,
                    None => continue,
                };

                // Whole-block pre-aggregate reuse: every row published,
                // every row inside one span, no tombstones, aggregates
                // intact, and no first/last tracking (which needs rows).
                let whole_block_qualifies = self
                    .ts_spans
                    .iter()
                    .any(|s| s.contains(item.min_ts()) && s.contains(item.max_ts()));
                if !track_first
                    && !track_last
                    && whole_block_qualifies
                    && item.agg_usable()
                    && !item.is_overflow()
                    && self.merge_block_aggs(&segment, &item, published, acc)?
                {
                    continue;
                }

                self.scan_block_runs(&segment, &item, published, acc, track_first, track_last)?;
            }
        }
        Ok(())
    }

    /// Try to fold the stored block aggregates of every spec column.
    /// Returns false (merging nothing) if any projected type mismatches
    /// the stored type, which forces the raw path for the whole block.
    fn merge_block_aggs(
        &self,
        segment: &Segment,
        item: &BlockItem,
        published: u32,
        acc: &mut EntityAcc,
    ) -> Result<bool> {
        let mut pending = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            match segment.read_block_agg(&spec.col, item.block_id)? {
                Some((agg, type_matches)) if type_matches && agg.count as u32 <= published => {
                    pending.push(agg);
                }
                _ => return Ok(false),
            }
        }
        for (i, (spec, agg)) in self.specs.iter().zip(pending).enumerate() {
            if spec.col.ty.is_var_len() {
                // min/max slots hold heap offsets; materialize them
                let min = segment.deref_var_offset(LittleEndian::read_u64(&agg.min))?;
                let max = segment.deref_var_offset(LittleEndian::read_u64(&agg.max))?;
                let state = &mut acc.states[i];
                state.count += agg.count as u64;
                if let Some(v) = min {
                    let mut run = crate::agg::RunAgg::default();
                    run.min = Some(v);
                    run.max = max.clone();
                    state.merge_run(run);
                }
            } else {
                acc.states[i].merge_block_agg(&agg, item.is_overflow());
            }
        }
        Ok(true)
    }

    /// Raw path over one block: aggregate qualifying runs and track
    /// first/last candidates.
    fn scan_block_runs(
        &self,
        segment: &Segment,
        item: &BlockItem,
        published: u32,
        acc: &mut EntityAcc,
        track_first: bool,
        track_last: bool,
    ) -> Result<()> {
        let n = published as usize;
        let ts = segment.read_timestamps(item.block_id, 0, n)?;
        let qualifies = |row: usize| -> bool {
            !item.is_deleted(row as u32) && ts_in_spans(ts[row], &self.ts_spans)
        };

        let mut row = 0;
        while row < n {
            if !qualifies(row) {
                row += 1;
                continue;
            }
            let mut end = row + 1;
            while end < n && qualifies(end) {
                end += 1;
            }
            let len = end - row;

            // materialize each projected column once for the run
            let mut runs: Vec<ColumnBatch> = Vec::with_capacity(self.specs.len());
            for spec in &self.specs {
                let run = segment.read_column_run(&spec.col, item.block_id, row as u32, len)?;
                runs.push(ColumnBatch {
                    ty: spec.col.ty,
                    cells: run.cells,
                    bitmap: run.bitmap,
                    var: run.var,
                    row_count: len,
                });
            }

            for (i, spec) in self.specs.iter().enumerate() {
                if spec.agg.is_first_last() {
                    continue;
                }
                let run = &runs[i];
                if spec.col.ty.is_var_len() {
                    let values = (0..len).map(|r| run.var_value(r));
                    acc.states[i].merge_run(var_run_agg(values));
                } else {
                    let calc = AggCalc::new(&run.cells, &run.bitmap, 0, spec.col.ty, len);
                    acc.states[i].merge_run(calc.compute());
                }
            }

            if track_first || track_last {
                self.update_candidates(&ts[row..end], &runs, acc, track_first, track_last);
            }
            row = end;
        }
        Ok(())
    }

    /// Scan every block of the entity in one partition, updating only
    /// the first/last candidates (short-circuit paths).
    fn scan_partition_rows(
        &self,
        p: &Partition,
        entity_id: EntityId,
        acc: &mut EntityAcc,
        track_first: bool,
        track_last: bool,
    ) -> Result<()> {
        for item in p.get_all_block_items(entity_id, false) {
            let published = item.publish_count();
            if published == 0 {
                continue;
            }
            if !self
                .ts_spans
                .iter()
                .any(|s| s.overlaps(item.min_ts(), item.max_ts()))
            {
                continue;
            }
            let segment = match p.segment_for_block(item.block_id) {
                Some(s) => s,
                None => continue,
            };
            let n = published as usize;
            let ts = segment.read_timestamps(item.block_id, 0, n)?;

            let mut row = 0;
            while row < n {
                if item.is_deleted(row as u32) || !ts_in_spans(ts[row], &self.ts_spans) {
                    row += 1;
                    continue;
                }
                let mut end = row + 1;
                while end < n
                    && !item.is_deleted(end as u32)
                    && ts_in_spans(ts[end], &self.ts_spans)
                {
                    end += 1;
                }
                let len = end - row;
                let mut runs = Vec::with_capacity(self.specs.len());
                for spec in &self.specs {
                    let run = segment.read_column_run(&spec.col, item.block_id, row as u32, len)?;
                    runs.push(ColumnBatch {
                        ty: spec.col.ty,
                        cells: run.cells,
                        bitmap: run.bitmap,
                        var: run.var,
                        row_count: len,
                    });
                }
                self.update_candidates(&ts[row..end], &runs, acc, track_first, track_last);
                row = end;
            }
        }
        Ok(())
    }

    fn value_at(run: &ColumnBatch, row: usize) -> AggValue {
        if run.is_null(row) {
            return AggValue::Null;
        }
        if run.ty.is_var_len() {
            match run.var_value(row) {
                Some(v) => AggValue::Var(v.to_vec()),
                None => AggValue::Null,
            }
        } else {
            AggValue::Cell(run.cell(row).to_vec())
        }
    }

    /// Candidate update rules: first/last move only on a strictly
    /// smaller/larger timestamp with a non-null value; the row variants
    /// move regardless of null.
    fn update_candidates(
        &self,
        ts: &[Timestamp],
        runs: &[ColumnBatch],
        acc: &mut EntityAcc,
        track_first: bool,
        track_last: bool,
    ) {
        for (r, &t) in ts.iter().enumerate() {
            if track_first {
                for (i, spec) in self.specs.iter().enumerate() {
                    if matches!(spec.agg, AggType::First | AggType::FirstTs) {
                        let replace = acc.first[i].as_ref().map(|(ct, _)| t < *ct).unwrap_or(true);
                        if replace {
                            let v = Self::value_at(&runs[i], r);
                            if v != AggValue::Null {
                                acc.first[i] = Some((t, v));
                            }
                        }
                    }
                }
                let replace = acc.first_row.as_ref().map(|(ct, _)| t < *ct).unwrap_or(true);
                if replace {
                    let values = self
                        .specs
                        .iter()
                        .enumerate()
                        .map(|(i, _)| Self::value_at(&runs[i], r))
                        .collect();
                    acc.first_row = Some((t, values));
                }
            }
            if track_last {
                for (i, spec) in self.specs.iter().enumerate() {
                    if matches!(spec.agg, AggType::Last | AggType::LastTs) {
                        let replace = acc.last[i].as_ref().map(|(ct, _)| t > *ct).unwrap_or(true);
                        if replace {
                            let v = Self::value_at(&runs[i], r);
                            if v != AggValue::Null {
                                acc.last[i] = Some((t, v));
                            }
                        }
                    }
                }
                let replace = acc.last_row.as_ref().map(|(ct, _)| t > *ct).unwrap_or(true);
                if replace {
                    let values = self
                        .specs
                        .iter()
                        .enumerate()
                        .map(|(i, _)| Self::value_at(&runs[i], r))
                        .collect();
                    acc.last_row = Some((t, values));
                }
            }
        }
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    fn finalize(&self, entity_id: EntityId, acc: EntityAcc) -> AggRow {
        let values = self
            .specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let state = &acc.states[i];
                match spec.agg {
                    AggType::Min => Self::extreme_value(spec, state.min.clone(), state.count),
                    AggType::Max => Self::extreme_value(spec, state.max.clone(), state.count),
                    AggType::Count => AggValue::Count(state.count),
                    AggType::Sum => match state.sum {
                        None => AggValue::Null,
                        Some(SumValue::Float(v)) => AggValue::Float(v),
                        Some(SumValue::Int(v)) => {
                            let past_native = spec
                                .col
                                .ty
                                .int_range()
                                .map(|(lo, hi)| v < lo || v > hi)
                                .unwrap_or(false);
                            if state.overflow || past_native {
                                AggValue::Float(v as f64)
                            } else {
                                AggValue::Int(v)
                            }
                        }
                    },
                    AggType::First => acc.first[i]
                        .clone()
                        .map(|(_, v)| v)
                        .unwrap_or(AggValue::Null),
                    AggType::FirstTs => acc.first[i]
                        .as_ref()
                        .map(|(t, _)| AggValue::Ts(*t))
                        .unwrap_or(AggValue::Null),
                    AggType::Last => acc.last[i]
                        .clone()
                        .map(|(_, v)| v)
                        .unwrap_or(AggValue::Null),
                    AggType::LastTs => acc.last[i]
                        .as_ref()
                        .map(|(t, _)| AggValue::Ts(*t))
                        .unwrap_or(AggValue::Null),
                    AggType::FirstRow => acc
                        .first_row
                        .as_ref()
                        .map(|(_, vals)| vals[i].clone())
                        .unwrap_or(AggValue::Null),
                    AggType::FirstRowTs => acc
                        .first_row
                        .as_ref()
                        .map(|(t, _)| AggValue::Ts(*t))
                        .unwrap_or(AggValue::Null),
                    AggType::LastRow => acc
                        .last_row
                        .as_ref()
                        .map(|(_, vals)| vals[i].clone())
                        .unwrap_or(AggValue::Null),
                    AggType::LastRowTs => acc
                        .last_row
                        .as_ref()
                        .map(|(t, _)| AggValue::Ts(*t))
                        .unwrap_or(AggValue::Null),
                }
            })
            .collect();
        AggRow { entity_id, values }
    }

    fn extreme_value(spec: &AggSpec, v: Option<Vec<u8>>, count: u64) -> AggValue {
        match v {
            Some(bytes) if count > 0 => {
                if spec.col.ty.is_var_len() {
                    AggValue::Var(bytes)
                } else {
                    AggValue::Cell(bytes)
                }
            }
            _ => AggValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DedupRule, Schema};
    use crate::payload::test_support::{simple_payload, simple_schema};
    use crate::storage::partition::{Partition, PartitionOptions};
    use tempfile::tempdir;

    fn make_partition(
        dir: &std::path::Path,
        start_secs: i64,
        schema: &Schema,
        rows: &[(i64, Option<i32>)],
    ) -> Arc<Partition> {
        let p = Arc::new(
            Partition::open(
                &dir.join(start_secs.to_string()),
                start_secs,
                86400,
                PartitionOptions {
                    block_rows: 4,
                    blocks_per_segment: 8,
                },
            )
            .unwrap(),
        );
        if !rows.is_empty() {
            let payload = simple_payload(schema, b"e1", rows);
            p.write_payload(
                &OpContext::new(),
                1,
                &payload,
                0,
                rows.len(),
                schema,
                DedupRule::Override,
            )
            .unwrap();
        }
        p
    }

    fn specs_for(schema: &Schema, aggs: &[AggType]) -> Vec<AggSpec> {
        aggs.iter()
            .map(|&agg| AggSpec {
                col: schema.columns[1].clone(),
                agg,
            })
            .collect()
    }

    fn cell_i32(v: &AggValue) -> i32 {
        match v {
            AggValue::Cell(bytes) => byteorder::LittleEndian::read_i32(bytes),
            other => panic!("expected cell, got {other:?}"),
        }
    }

    #[test]
    fn test_min_max_sum_count_first_last() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let p = make_partition(
            dir.path(),
            0,
            &schema,
            &[(1000, Some(10)), (2000, Some(20)), (3000, Some(30))],
        );
        let mut it = AggIterator::new(
            vec![p],
            vec![1],
            vec![TsSpan::new(1000, 3000)],
            specs_for(
                &schema,
                &[
                    AggType::Min,
                    AggType::Max,
                    AggType::Sum,
                    AggType::Count,
                    AggType::First,
                    AggType::Last,
                ],
            ),
        );
        let row = it.next(&OpContext::new()).unwrap().unwrap();
        assert_eq!(cell_i32(&row.values[0]), 10);
        assert_eq!(cell_i32(&row.values[1]), 30);
        assert_eq!(row.values[2], AggValue::Int(60));
        assert_eq!(row.values[3], AggValue::Count(3));
        assert_eq!(cell_i32(&row.values[4]), 10);
        assert_eq!(cell_i32(&row.values[5]), 30);
        assert!(it.next(&OpContext::new()).unwrap().is_none());
    }

    #[test]
    fn test_tombstones_affect_aggregates() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let p = make_partition(
            dir.path(),
            0,
            &schema,
            &[(1000, Some(10)), (2000, Some(20)), (3000, Some(30))],
        );
        p.delete_data(1, &[TsSpan::new(1500, 2500)]).unwrap();

        let mut it = AggIterator::new(
            vec![p],
            vec![1],
            vec![TsSpan::new(1000, 3000)],
            specs_for(&schema, &[AggType::Count, AggType::Sum, AggType::Min, AggType::Max]),
        );
        let row = it.next(&OpContext::new()).unwrap().unwrap();
        assert_eq!(row.values[0], AggValue::Count(2));
        assert_eq!(row.values[1], AggValue::Int(40));
        assert_eq!(cell_i32(&row.values[2]), 10);
        assert_eq!(cell_i32(&row.values[3]), 30);
    }

    #[test]
    fn test_first_short_circuit_consults_one_partition() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let p0 = make_partition(dir.path(), 0, &schema, &[(1000, Some(10)), (2000, Some(20))]);
        let day = 86_400_000_000i64;
        let p1 = make_partition(
            dir.path(),
            86400,
            &schema,
            &[(day + 1000, Some(50))],
        );
        let mut it = AggIterator::new(
            vec![p0, p1],
            vec![1],
            vec![TsSpan::all()],
            specs_for(&schema, &[AggType::First, AggType::FirstTs]),
        );
        let row = it.next(&OpContext::new()).unwrap().unwrap();
        assert_eq!(cell_i32(&row.values[0]), 10);
        assert_eq!(row.values[1], AggValue::Ts(1000));
    }

    #[test]
    fn test_last_family_scans_backward() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let day = 86_400_000_000i64;
        let p0 = make_partition(dir.path(), 0, &schema, &[(1000, Some(10))]);
        let p1 = make_partition(dir.path(), 86400, &schema, &[(day + 500, Some(70))]);
        let mut it = AggIterator::new(
            vec![p0, p1],
            vec![1],
            vec![TsSpan::all()],
            specs_for(&schema, &[AggType::Last, AggType::LastRowTs]),
        );
        let row = it.next(&OpContext::new()).unwrap().unwrap();
        assert_eq!(cell_i32(&row.values[0]), 70);
        assert_eq!(row.values[1], AggValue::Ts(day + 500));
    }

    #[test]
    fn test_first_skips_nulls_but_first_row_does_not() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let p = make_partition(
            dir.path(),
            0,
            &schema,
            &[(1000, None), (2000, Some(20))],
        );
        let mut it = AggIterator::new(
            vec![p],
            vec![1],
            vec![TsSpan::all()],
            specs_for(
                &schema,
                &[AggType::First, AggType::FirstTs, AggType::FirstRow, AggType::FirstRowTs],
            ),
        );
        let row = it.next(&OpContext::new()).unwrap().unwrap();
        assert_eq!(cell_i32(&row.values[0]), 20);
        assert_eq!(row.values[1], AggValue::Ts(2000));
        assert_eq!(row.values[2], AggValue::Null); // value at t=1000 is null
        assert_eq!(row.values[3], AggValue::Ts(1000));
    }

    #[test]
    fn test_block_agg_fast_path_matches_raw() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        // full block of 4 rows, entirely inside the span
        let p = make_partition(
            dir.path(),
            0,
            &schema,
            &[(1000, Some(1)), (2000, Some(2)), (3000, Some(3)), (4000, Some(4))],
        );
        let items = p.get_all_block_items(1, false);
        assert!(items[0].agg_usable());

        let run_query = |spans: Vec<TsSpan>| {
            let mut it = AggIterator::new(
                vec![p.clone()],
                vec![1],
                spans,
                specs_for(&schema, &[AggType::Sum, AggType::Count]),
            );
            let row = it.next(&OpContext::new()).unwrap().unwrap();
            (row.values[0].clone(), row.values[1].clone())
        };

        // covers the block exactly at the boundaries: fast path
        assert_eq!(
            run_query(vec![TsSpan::new(1000, 4000)]),
            (AggValue::Int(10), AggValue::Count(4))
        );
        // partial span: raw path, same machinery
        assert_eq!(
            run_query(vec![TsSpan::new(2000, 3000)]),
            (AggValue::Int(5), AggValue::Count(2))
        );
    }

    #[test]
    fn test_empty_entity_yields_null_row() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let p = make_partition(dir.path(), 0, &schema, &[]);
        let mut it = AggIterator::new(
            vec![p],
            vec![42],
            vec![TsSpan::all()],
            specs_for(&schema, &[AggType::Min, AggType::Count, AggType::First]),
        );
        let row = it.next(&OpContext::new()).unwrap().unwrap();
        assert_eq!(row.entity_id, 42);
        assert_eq!(row.values[0], AggValue::Null);
        assert_eq!(row.values[1], AggValue::Count(0));
        assert_eq!(row.values[2], AggValue::Null);
    }
}

//! End-to-end tests through the public engine API.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::context::OpContext;
use crate::data::{
    AggType, ColumnSchema, ColumnType, DedupRule, HashSpan, Schema, TsSpan,
};
use crate::engine::{TsEngine, TsIterator};
use crate::iter::AggValue;
use crate::payload::{FieldValue, PayloadBuilder};
use crate::storage::EngineOptions;
use crate::tag::TagSchema;

const TABLE: u64 = 1;
const RANGE_GROUP: u64 = 100;

fn small_opts() -> EngineOptions {
    EngineOptions {
        block_rows: 4,
        blocks_per_segment: 8,
        partition_interval_secs: 86400,
        ..Default::default()
    }
}

fn value_schema(ty: ColumnType) -> Schema {
    Schema::new(vec![
        ColumnSchema::new(1, "k_timestamp", ColumnType::TimestampLsn),
        ColumnSchema::new(2, "v", ty),
    ])
}

struct Fixture {
    engine: Arc<TsEngine>,
    ctx: OpContext,
    _dir: TempDir,
}

impl Fixture {
    fn new(ty: ColumnType) -> Self {
        let dir = TempDir::new().unwrap();
        let engine = TsEngine::open(dir.path(), small_opts()).unwrap();
        let ctx = OpContext::new();
        engine
            .create_ts_table(
                &ctx,
                TABLE,
                value_schema(ty),
                TagSchema::primary_only(32),
                86400,
                &[RANGE_GROUP],
            )
            .unwrap();
        Self {
            _dir: dir,
            engine,
            ctx,
        }
    }

    fn schema(&self) -> Schema {
        value_schema(ColumnType::Int32)
    }

    fn insert_values(&self, tag: &[u8], rows: &[(i64, FieldValue)], schema: &Schema) {
        let mtr = self
            .engine
            .mtr_begin(TABLE, RANGE_GROUP, 1, 0)
            .unwrap();
        let mut b = PayloadBuilder::new(schema, tag);
        for (ts, v) in rows {
            let mut fields = vec![FieldValue::Timestamp(*ts)];
            fields.push(v.clone());
            b.add_row(fields);
        }
        self.engine
            .put_data(&self.ctx, TABLE, RANGE_GROUP, b.build().unwrap(), mtr, None)
            .unwrap();
        self.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();
    }

    fn insert(&self, tag: &[u8], rows: &[(i64, i32)]) {
        let schema = self.schema();
        let rows: Vec<(i64, FieldValue)> = rows
            .iter()
            .map(|(ts, v)| (*ts, FieldValue::Int32(*v)))
            .collect();
        self.insert_values(tag, &rows, &schema);
    }

    fn scan(&self, tag: &[u8], spans: &[TsSpan]) -> Vec<(i64, Option<i32>)> {
        let mut it = match self
            .engine
            .get_iterator(
                &self.ctx,
                TABLE,
                &[tag.to_vec()],
                spans,
                &[0, 1],
                &[],
                false,
                0,
            )
            .unwrap()
        {
            TsIterator::Raw(it) => it,
            _ => panic!("expected raw iterator"),
        };
        let mut out = Vec::new();
        loop {
            let r = it.next(&self.ctx, None).unwrap();
            if r.finished {
                break;
            }
            let batch = r.batch.unwrap();
            for row in 0..batch.row_count {
                let v = if batch.columns[1].is_null(row) {
                    None
                } else {
                    Some(LittleEndian::read_i32(batch.columns[1].cell(row)))
                };
                out.push((batch.timestamps[row], v));
            }
        }
        out
    }

    fn aggregate(&self, tag: &[u8], spans: &[TsSpan], aggs: &[AggType]) -> Vec<AggValue> {
        let projection: Vec<usize> = aggs.iter().map(|_| 1).collect();
        let mut chain = match self
            .engine
            .get_iterator(
                &self.ctx,
                TABLE,
                &[tag.to_vec()],
                spans,
                &projection,
                aggs,
                false,
                0,
            )
            .unwrap()
        {
            TsIterator::Agg(chain) => chain,
            _ => panic!("expected aggregate iterator"),
        };
        let row = chain.next(&self.ctx).unwrap().unwrap();
        assert!(chain.next(&self.ctx).unwrap().is_none());
        row.values
    }
}

fn as_i32(v: &AggValue) -> i32 {
    match v {
        AggValue::Cell(bytes) => LittleEndian::read_i32(bytes),
        other => panic!("expected cell, got {other:?}"),
    }
}

// ============================================================================
// Seed scenarios
// ============================================================================

#[test]
fn test_insert_scan_aggregate() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 10), (2000, 20), (3000, 30)]);

    let rows = f.scan(b"e1", &[TsSpan::new(1000, 3000)]);
    assert_eq!(
        rows,
        vec![(1000, Some(10)), (2000, Some(20)), (3000, Some(30))]
    );

    let aggs = f.aggregate(
        b"e1",
        &[TsSpan::new(1000, 3000)],
        &[
            AggType::Min,
            AggType::Max,
            AggType::Sum,
            AggType::Count,
            AggType::First,
            AggType::Last,
        ],
    );
    assert_eq!(as_i32(&aggs[0]), 10);
    assert_eq!(as_i32(&aggs[1]), 30);
    assert_eq!(aggs[2], AggValue::Int(60));
    assert_eq!(aggs[3], AggValue::Count(3));
    assert_eq!(as_i32(&aggs[4]), 10);
    assert_eq!(as_i32(&aggs[5]), 30);

    let stats = f.engine.stats();
    assert_eq!(stats.rows_written, 3);
    assert!(stats.batches_read >= 2);
}

#[test]
fn test_delete_then_scan_and_aggregate() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 10), (2000, 20), (3000, 30)]);

    let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
    let n = f
        .engine
        .delete_data(&f.ctx, TABLE, RANGE_GROUP, b"e1", &[TsSpan::new(1500, 2500)], mtr)
        .unwrap();
    f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();
    assert_eq!(n, 1);

    let rows = f.scan(b"e1", &[TsSpan::new(1000, 3000)]);
    assert_eq!(rows, vec![(1000, Some(10)), (3000, Some(30))]);

    let aggs = f.aggregate(
        b"e1",
        &[TsSpan::new(1000, 3000)],
        &[AggType::Count, AggType::Sum, AggType::Min, AggType::Max],
    );
    assert_eq!(aggs[0], AggValue::Count(2));
    assert_eq!(aggs[1], AggValue::Int(40));
    assert_eq!(as_i32(&aggs[2]), 10);
    assert_eq!(as_i32(&aggs[3]), 30);

    // tombstone idempotence: the repeat delete reports zero
    let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
    let n = f
        .engine
        .delete_data(&f.ctx, TABLE, RANGE_GROUP, b"e1", &[TsSpan::new(1500, 2500)], mtr)
        .unwrap();
    f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();
    assert_eq!(n, 0);
    assert_eq!(f.scan(b"e1", &[TsSpan::new(1000, 3000)]).len(), 2);
}

#[test]
fn test_dedup_override_last_write_wins() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 10)]);
    f.insert(b"e1", &[(1000, 99)]);

    let rows = f.scan(b"e1", &[TsSpan::all()]);
    assert_eq!(rows, vec![(1000, Some(99))]);

    let aggs = f.aggregate(b"e1", &[TsSpan::all()], &[AggType::Count]);
    assert_eq!(aggs[0], AggValue::Count(1));
}

#[test]
fn test_sum_overflow_promotes_to_double() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, i32::MAX), (2000, 1)]);

    let aggs = f.aggregate(b"e1", &[TsSpan::all()], &[AggType::Sum]);
    assert_eq!(aggs[0], AggValue::Float(i32::MAX as f64 + 1.0));
}

#[test]
fn test_first_short_circuit_across_partitions() {
    let f = Fixture::new(ColumnType::Int32);
    let day = 86_400_000_000i64;
    f.insert(b"e1", &[(1000, 7)]);
    f.insert(b"e1", &[(day + 1000, 8)]);
    f.insert(b"e1", &[(2 * day + 1000, 9)]);

    let aggs = f.aggregate(b"e1", &[TsSpan::all()], &[AggType::First, AggType::FirstTs]);
    assert_eq!(as_i32(&aggs[0]), 7);
    assert_eq!(aggs[1], AggValue::Ts(1000));

    let aggs = f.aggregate(b"e1", &[TsSpan::all()], &[AggType::Last, AggType::LastTs]);
    assert_eq!(as_i32(&aggs[0]), 9);
    assert_eq!(aggs[1], AggValue::Ts(2 * day + 1000));
}

#[test]
fn test_first_last_short_circuit_equals_general_path() {
    let f = Fixture::new(ColumnType::Int32);
    let day = 86_400_000_000i64;
    f.insert(b"e1", &[(1000, 7), (5000, 8)]);
    f.insert(b"e1", &[(day + 1000, 9)]);

    // pure first/last projection takes the partition-order early exit
    let fast = f.aggregate(
        b"e1",
        &[TsSpan::all()],
        &[AggType::First, AggType::FirstTs, AggType::Last, AggType::LastTs],
    );
    // mixing in COUNT forces the general block walk
    let general = f.aggregate(
        b"e1",
        &[TsSpan::all()],
        &[
            AggType::First,
            AggType::FirstTs,
            AggType::Last,
            AggType::LastTs,
            AggType::Count,
        ],
    );
    assert_eq!(fast[..4], general[..4]);
    assert_eq!(general[4], AggValue::Count(3));
}

#[test]
fn test_recovery_commit_boundary() {
    let dir = TempDir::new().unwrap();
    let ctx = OpContext::new();
    let schema = value_schema(ColumnType::Int32);
    {
        let engine = TsEngine::open(dir.path(), small_opts()).unwrap();
        engine
            .create_ts_table(
                &ctx,
                TABLE,
                schema.clone(),
                TagSchema::primary_only(32),
                86400,
                &[RANGE_GROUP],
            )
            .unwrap();

        // rows: committed and fsynced
        let mtr = engine.mtr_begin(TABLE, RANGE_GROUP, 1, 1).unwrap();
        let mut b = PayloadBuilder::new(&schema, b"e1");
        b.add_row(vec![FieldValue::Timestamp(1000), FieldValue::Int32(1)]);
        engine
            .put_data(&ctx, TABLE, RANGE_GROUP, b.build().unwrap(), mtr, None)
            .unwrap();
        engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();

        // rows2: committed and fsynced in its own transaction
        let mtr2 = engine.mtr_begin(TABLE, RANGE_GROUP, 1, 2).unwrap();
        let mut b = PayloadBuilder::new(&schema, b"e1");
        b.add_row(vec![FieldValue::Timestamp(2000), FieldValue::Int32(2)]);
        engine
            .put_data(&ctx, TABLE, RANGE_GROUP, b.build().unwrap(), mtr2, None)
            .unwrap();
        engine.mtr_commit(TABLE, RANGE_GROUP, mtr2).unwrap();

        // rows3: written but never committed before the "crash"
        let mtr3 = engine.mtr_begin(TABLE, RANGE_GROUP, 1, 3).unwrap();
        let mut b = PayloadBuilder::new(&schema, b"e1");
        b.add_row(vec![FieldValue::Timestamp(3000), FieldValue::Int32(3)]);
        engine
            .put_data(&ctx, TABLE, RANGE_GROUP, b.build().unwrap(), mtr3, None)
            .unwrap();
        engine.flush_buffer().unwrap();
        engine.close();
        // no checkpoint: the manifests and the WAL tail must carry it
    }

    let engine = TsEngine::open(dir.path(), small_opts()).unwrap();
    engine.recover().unwrap();

    let mut it = match engine
        .get_iterator(
            &ctx,
            TABLE,
            &[b"e1".to_vec()],
            &[TsSpan::all()],
            &[0, 1],
            &[],
            false,
            0,
        )
        .unwrap()
    {
        TsIterator::Raw(it) => it,
        _ => unreachable!(),
    };
    let mut seen = Vec::new();
    loop {
        let r = it.next(&ctx, None).unwrap();
        if r.finished {
            break;
        }
        let batch = r.batch.unwrap();
        for row in 0..batch.row_count {
            seen.push(batch.timestamps[row]);
        }
    }
    // committed rows survive, the uncommitted batch does not
    assert_eq!(seen, vec![1000, 2000]);
}

// ============================================================================
// Schema evolution
// ============================================================================

#[test]
fn test_schema_evolution_transparent_reads() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 5), (2000, 6)]);

    f.engine
        .add_column(TABLE, ColumnSchema::new(3, "extra", ColumnType::Float64))
        .unwrap();
    f.engine
        .alter_column_type(TABLE, 2, ColumnType::Int64)
        .unwrap();

    let mut it = match f
        .engine
        .get_iterator(
            &f.ctx,
            TABLE,
            &[b"e1".to_vec()],
            &[TsSpan::all()],
            &[0, 1, 2],
            &[],
            false,
            0,
        )
        .unwrap()
    {
        TsIterator::Raw(it) => it,
        _ => unreachable!(),
    };
    let batch = it.next(&f.ctx, None).unwrap().batch.unwrap();
    assert_eq!(batch.row_count, 2);
    // old Int32 cells read back as Int64 through conversion
    assert_eq!(LittleEndian::read_i64(batch.columns[1].cell(0)), 5);
    assert_eq!(LittleEndian::read_i64(batch.columns[1].cell(1)), 6);
    // the added column reads as null for pre-alter rows
    assert!(batch.columns[2].is_null(0));
    assert!(batch.columns[2].is_null(1));

    // writes under the new schema land next to the old data
    let latest = f.engine.table(TABLE).unwrap().schema_latest();
    let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
    let mut b = PayloadBuilder::new(&latest, b"e1");
    b.add_row(vec![
        FieldValue::Timestamp(3000),
        FieldValue::Int64(7),
        FieldValue::Float64(1.5),
    ]);
    f.engine
        .put_data(&f.ctx, TABLE, RANGE_GROUP, b.build().unwrap(), mtr, None)
        .unwrap();
    f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();

    // a fresh scan sees old (converted) and new rows side by side
    let mut it2 = match f
        .engine
        .get_iterator(
            &f.ctx,
            TABLE,
            &[b"e1".to_vec()],
            &[TsSpan::all()],
            &[0, 1, 2],
            &[],
            false,
            0,
        )
        .unwrap()
    {
        TsIterator::Raw(it2) => it2,
        _ => unreachable!(),
    };
    let mut seen = Vec::new();
    loop {
        let r = it2.next(&f.ctx, None).unwrap();
        if r.finished {
            break;
        }
        let batch = r.batch.unwrap();
        for row in 0..batch.row_count {
            seen.push((
                batch.timestamps[row],
                LittleEndian::read_i64(batch.columns[1].cell(row)),
            ));
        }
    }
    assert_eq!(seen, vec![(1000, 5), (2000, 6), (3000, 7)]);
}

// ============================================================================
// Var-length columns through the engine
// ============================================================================

#[test]
fn test_var_column_roundtrip_and_minmax() {
    let f = Fixture::new(ColumnType::VarChar(32));
    let schema = value_schema(ColumnType::VarChar(32));
    f.insert_values(
        b"e1",
        &[
            (1000, FieldValue::Str("pear".into())),
            (2000, FieldValue::Null),
            (3000, FieldValue::Str("apple".into())),
        ],
        &schema,
    );

    let aggs = f.aggregate(
        b"e1",
        &[TsSpan::all()],
        &[AggType::Min, AggType::Max, AggType::Count],
    );
    assert_eq!(aggs[0], AggValue::Var(b"apple".to_vec()));
    assert_eq!(aggs[1], AggValue::Var(b"pear".to_vec()));
    assert_eq!(aggs[2], AggValue::Count(2));
}

// ============================================================================
// Dedup reporting and ranged deletes
// ============================================================================

#[test]
fn test_discard_dedup_reports_counters() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 1)]);

    let schema = f.schema();
    let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
    let mut b = PayloadBuilder::new(&schema, b"e1");
    b.add_row(vec![FieldValue::Timestamp(1000), FieldValue::Int32(9)]);
    b.add_row(vec![FieldValue::Timestamp(2000), FieldValue::Int32(2)]);
    let res = f
        .engine
        .put_data(
            &f.ctx,
            TABLE,
            RANGE_GROUP,
            b.build().unwrap(),
            mtr,
            Some(DedupRule::Discard),
        )
        .unwrap();
    f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();

    assert_eq!(res.rows_written, 1);
    assert_eq!(res.discarded_rows, 1);
    assert_eq!(f.scan(b"e1", &[TsSpan::all()]), vec![(1000, Some(1)), (2000, Some(2))]);
}

#[test]
fn test_delete_range_and_entities() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 1)]);
    f.insert(b"e2", &[(2000, 2)]);

    let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
    let n = f
        .engine
        .delete_range_data(&f.ctx, TABLE, RANGE_GROUP, HashSpan::all(), &[TsSpan::all()], mtr)
        .unwrap();
    f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();
    assert_eq!(n, 2);

    let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
    f.engine
        .delete_entities(&f.ctx, TABLE, RANGE_GROUP, &[b"e1".to_vec()], mtr)
        .unwrap();
    f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();
    assert!(f.scan(b"e1", &[TsSpan::all()]).is_empty());
}

// ============================================================================
// Snapshot migration
// ============================================================================

#[test]
fn test_snapshot_between_range_groups() {
    let dir = TempDir::new().unwrap();
    let ctx = OpContext::new();
    let engine = TsEngine::open(dir.path(), small_opts()).unwrap();
    engine
        .create_ts_table(
            &ctx,
            TABLE,
            value_schema(ColumnType::Int32),
            TagSchema::primary_only(32),
            86400,
            &[100, 200],
        )
        .unwrap();

    let schema = value_schema(ColumnType::Int32);
    let mtr = engine.mtr_begin(TABLE, 100, 1, 0).unwrap();
    let mut b = PayloadBuilder::new(&schema, b"e1");
    b.add_row(vec![FieldValue::Timestamp(1000), FieldValue::Int32(10)]);
    b.add_row(vec![FieldValue::Timestamp(2000), FieldValue::Int32(20)]);
    engine
        .put_data(&ctx, TABLE, 100, b.build().unwrap(), mtr, None)
        .unwrap();
    engine.mtr_commit(TABLE, 100, mtr).unwrap();

    let snap_id = engine.create_snapshot(TABLE, 100, HashSpan::all()).unwrap();
    let dest_id = 777u64;
    while let Some(frame) = engine.get_snapshot_data(snap_id).unwrap() {
        engine.write_snapshot_data(dest_id, frame).unwrap();
    }
    engine.enable_snapshot(dest_id).unwrap();
    let rows = engine.apply_snapshot(&ctx, TABLE, 200, dest_id).unwrap();
    assert_eq!(rows, 2);

    engine.drop_snapshot(snap_id).unwrap();
    engine.drop_snapshot(dest_id).unwrap();
    assert!(engine.drop_snapshot(dest_id).is_err());

    // the migrated entity now resolves in range group 200
    let eg = engine.table(TABLE).unwrap().entity_group(200).unwrap();
    assert!(eg.tag_table().get_entity_id_group_id(b"e1").is_some());
}

// ============================================================================
// Randomized aggregate equivalence
// ============================================================================

#[test]
fn test_aggregates_match_raw_scan_on_random_workload() {
    let f = Fixture::new(ColumnType::Int32);
    let mut rng = StdRng::seed_from_u64(0x7e55e7a);

    let mut expected: std::collections::BTreeMap<i64, i32> = std::collections::BTreeMap::new();
    let mut next_ts = 0i64;
    for _ in 0..20 {
        let rows: Vec<(i64, i32)> = (0..rng.gen_range(1..20))
            .map(|_| {
                next_ts += rng.gen_range(1..5000i64);
                (next_ts, rng.gen_range(-100..100))
            })
            .collect();
        f.insert(b"e1", &rows);
        for (ts, v) in rows {
            expected.insert(ts, v);
        }
    }
    // a few random span deletes
    for _ in 0..3 {
        let a = rng.gen_range(0..400i64) * 1000;
        let span = TsSpan::new(a, a + 50_000);
        let mtr = f.engine.mtr_begin(TABLE, RANGE_GROUP, 1, 0).unwrap();
        f.engine
            .delete_data(&f.ctx, TABLE, RANGE_GROUP, b"e1", &[span], mtr)
            .unwrap();
        f.engine.mtr_commit(TABLE, RANGE_GROUP, mtr).unwrap();
        expected.retain(|ts, _| !span.contains(*ts));
    }

    let scanned = f.scan(b"e1", &[TsSpan::all()]);
    let scanned_pairs: Vec<(i64, i32)> = scanned.iter().map(|(t, v)| (*t, v.unwrap())).collect();
    let expected_pairs: Vec<(i64, i32)> = expected.iter().map(|(t, v)| (*t, *v)).collect();
    assert_eq!(scanned_pairs, expected_pairs);

    let aggs = f.aggregate(
        b"e1",
        &[TsSpan::all()],
        &[AggType::Min, AggType::Max, AggType::Sum, AggType::Count],
    );
    if expected.is_empty() {
        assert_eq!(aggs[3], AggValue::Count(0));
    } else {
        let min = expected.values().min().copied().unwrap();
        let max = expected.values().max().copied().unwrap();
        let sum: i64 = expected.values().map(|&v| v as i64).sum();
        assert_eq!(as_i32(&aggs[0]), min);
        assert_eq!(as_i32(&aggs[1]), max);
        assert_eq!(aggs[2], AggValue::Int(sum));
        assert_eq!(aggs[3], AggValue::Count(expected.len() as u64));
    }
}

// ============================================================================
// Engine lifecycle
// ============================================================================

#[test]
fn test_second_engine_refused_by_lock() {
    let dir = TempDir::new().unwrap();
    let _engine = TsEngine::open(dir.path(), small_opts()).unwrap();
    assert!(TsEngine::open(dir.path(), small_opts()).is_err());
}

#[test]
fn test_drop_table_removes_everything() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(1000, 1)]);
    f.engine.drop_ts_table(&f.ctx, TABLE).unwrap();
    assert!(f.engine.table(TABLE).is_err());
    assert!(f
        .engine
        .put_data(&f.ctx, TABLE, RANGE_GROUP, vec![], 0, None)
        .is_err());
}

#[test]
fn test_out_of_order_ingest_flags_disorder() {
    let f = Fixture::new(ColumnType::Int32);
    f.insert(b"e1", &[(5000, 5)]);
    f.insert(b"e1", &[(1000, 1)]); // lands behind the first batch

    let mut it = match f
        .engine
        .get_iterator(
            &f.ctx,
            TABLE,
            &[b"e1".to_vec()],
            &[TsSpan::all()],
            &[0, 1],
            &[],
            false,
            0,
        )
        .unwrap()
    {
        TsIterator::Raw(it) => it,
        _ => unreachable!(),
    };
    assert!(it.is_disordered());

    let mut ts = Vec::new();
    loop {
        let r = it.next(&f.ctx, None).unwrap();
        if r.finished {
            break;
        }
        let batch = r.batch.unwrap();
        ts.extend_from_slice(&batch.timestamps);
    }
    ts.sort_unstable();
    assert_eq!(ts, vec![1000, 5000]);

    // aggregates are order-insensitive
    let aggs = f.aggregate(b"e1", &[TsSpan::all()], &[AggType::First, AggType::Last]);
    assert_eq!(as_i32(&aggs[0]), 1);
    assert_eq!(as_i32(&aggs[1]), 5);
}

#[test]
fn test_update_setting_changes_defaults() {
    let f = Fixture::new(ColumnType::Int32);
    let mut opts = f.engine.options();
    opts.default_dedup = DedupRule::Keep;
    f.engine.update_setting(opts);

    f.insert(b"e1", &[(1000, 1)]);
    f.insert(b"e1", &[(1000, 2)]); // KEEP: first write wins now
    assert_eq!(f.scan(b"e1", &[TsSpan::all()]), vec![(1000, Some(1))]);
}

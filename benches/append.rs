use criterion::{criterion_group, criterion_main, Criterion};
use packdb::{BucketId, ColumnValue, Config, Driver, Row};
use tempfile::TempDir;

fn bench_append(c: &mut Criterion) {
  let dir = TempDir::new().unwrap();
  let driver = Driver::open(Config::test_config(dir.path()), None).unwrap();
  let id = BucketId::new("bench", "b1", "sb", "events").unwrap();

  let rows: Vec<Row> = (0..16)
    .map(|i| {
      Row::new(vec![
        ColumnValue::Scalar(i),
        ColumnValue::Blob(vec![b'x'; 32]),
      ])
    })
    .collect();

  c.bench_function("append_16_rows", |b| {
    b.iter(|| driver.append_rows(&id, &rows).unwrap())
  });

  c.bench_function("append_and_flush", |b| {
    b.iter(|| {
      driver.append_rows(&id, &rows).unwrap();
      driver.flush().unwrap();
    })
  });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);

mod common;

use common::{read_header, test_id, TestEnv};
use packdb::{Buffer, ShardWal};

#[test]
fn test_single_write_and_read_back() {
  let env = TestEnv::new();
  let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
  let id = test_id();
  let shard = sw.shard_of(&id);

  {
    let mut engine = sw.lock_shard(shard);
    engine.append_write(&id, &[&[0u8; 20]]).unwrap();

    // The consistent view already includes the pending write.
    let mut buf = Buffer::new();
    engine.file_buffer(&id, &mut buf).unwrap();
    assert_eq!(buf.len(), 20);
    assert_eq!(engine.cur_file_size(&id).unwrap(), 20);

    assert_eq!(engine.flush().unwrap(), 0);
  }

  let path = id.active_path(&env.config.active_folder);
  assert_eq!(std::fs::metadata(&path).unwrap().len(), 28);
  assert_eq!(read_header(&path), 28);

  sw.close_all().unwrap();
}

#[test]
fn test_truncate() {
  let env = TestEnv::new();
  let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
  let id = test_id();
  let shard = sw.shard_of(&id);

  {
    let mut engine = sw.lock_shard(shard);
    engine.append_write(&id, &[&[0u8; 20]]).unwrap();
    engine.truncate(&id, 10).unwrap();

    let mut buf = Buffer::new();
    engine.file_buffer(&id, &mut buf).unwrap();
    assert_eq!(buf.len(), 10);
    assert_eq!(engine.cur_file_size(&id).unwrap(), 10);

    engine.flush().unwrap();
  }

  let path = id.active_path(&env.config.active_folder);
  assert_eq!(std::fs::metadata(&path).unwrap().len(), 18);
  assert_eq!(read_header(&path), 18);

  // Truncating past the logical size is refused.
  {
    let mut engine = sw.lock_shard(shard);
    assert!(engine.truncate(&id, 11).is_err());
  }

  sw.close_all().unwrap();
}

#[test]
fn test_adjacent_appends_concatenate() {
  let env = TestEnv::new();
  let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
  let id = test_id();
  let shard = sw.shard_of(&id);

  let chunks: [&[u8]; 3] = [b"aaaa", b"bb", b"cccccc"];
  {
    let mut engine = sw.lock_shard(shard);
    for chunk in chunks {
      engine.append_write(&id, &[chunk]).unwrap();
    }
    engine.flush().unwrap();
  }

  let path = id.active_path(&env.config.active_folder);
  let on_disk = std::fs::read(&path).unwrap();
  assert_eq!(&on_disk[8..], b"aaaabbcccccc");
  assert_eq!(read_header(&path), 8 + 12);

  // The merged writes stay readable through the engine as well.
  {
    let mut engine = sw.lock_shard(shard);
    let mut buf = Buffer::new();
    engine.file_buffer(&id, &mut buf).unwrap();
    assert_eq!(buf.bytes(), b"aaaabbcccccc");
  }

  sw.close_all().unwrap();
}

#[test]
fn test_appends_resume_after_reopen() {
  let env = TestEnv::new();
  let id = test_id();

  {
    let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
    let shard = sw.shard_of(&id);
    sw.lock_shard(shard).append_write(&id, &[b"first-"]).unwrap();
    sw.close_all().unwrap();
  }

  {
    let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
    let shard = sw.shard_of(&id);
    {
      let mut engine = sw.lock_shard(shard);
      // Offset resolution falls back to the on-disk header.
      engine.append_write(&id, &[b"second"]).unwrap();
      engine.flush().unwrap();
    }
    sw.close_all().unwrap();
  }

  let path = id.active_path(&env.config.active_folder);
  assert_eq!(&std::fs::read(&path).unwrap()[8..], b"first-second");
}

#[test]
fn test_multi_buffer_write_is_one_record() {
  let env = TestEnv::new();
  let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
  let id = test_id();
  let shard = sw.shard_of(&id);

  {
    let mut engine = sw.lock_shard(shard);
    engine.append_write(&id, &[b"ab", b"cd", b"ef"]).unwrap();
    assert_eq!(engine.cur_file_size(&id).unwrap(), 6);
    engine.flush().unwrap();
  }

  let path = id.active_path(&env.config.active_folder);
  assert_eq!(&std::fs::read(&path).unwrap()[8..], b"abcdef");
  sw.close_all().unwrap();
}

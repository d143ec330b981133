mod common;

use common::{test_id, TestEnv};
use packdb::{Driver, Replicator, ShardWal};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

fn archived_wal_files(env: &TestEnv) -> Vec<PathBuf> {
  let folder = env.config.wal_archive_folder.as_ref().unwrap();
  let mut files: Vec<PathBuf> = fs::read_dir(folder)
    .unwrap()
    .filter_map(|e| e.ok())
    .map(|e| e.path())
    .collect();
  files.sort();
  files
}

#[test]
fn test_cold_replay_into_alternate_root() {
  let env = TestEnv::new();
  let id = test_id();

  {
    let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
    let shard = sw.shard_of(&id);
    let mut engine = sw.lock_shard(shard);
    engine.archive(&id).unwrap();
    engine.append_write(&id, &[&[7u8; 20]]).unwrap();
    engine.truncate(&id, 10).unwrap();
    assert_eq!(engine.flush().unwrap(), 0);
    drop(engine);
    sw.close_all().unwrap();
  }

  let archived = archived_wal_files(&env);
  assert_eq!(archived.len(), 1);

  let replication_active = env.config.replication_active_folder.clone().unwrap();
  let replication_archive = env.config.replication_archive_folder.clone().unwrap();

  let replicator = Replicator::with_file(
    archived[0].clone(),
    Some(replication_active.clone()),
    Some(replication_archive.clone()),
    None,
  );
  replicator.execute().unwrap();

  // The replayed active file: 10 payload bytes under an 8-byte header.
  let replayed = id.active_path(&replication_active);
  let bytes = fs::read(&replayed).unwrap();
  assert_eq!(bytes.len(), 18);
  assert_eq!(u64::from_be_bytes(bytes[..8].try_into().unwrap()), 18);
  assert_eq!(&bytes[8..], &[7u8; 10]);

  // The consumed WAL archive was unlinked.
  assert!(!archived[0].exists());
}

#[test]
fn test_replay_is_idempotent_with_normal_apply() {
  let env = TestEnv::new();
  let id = test_id();

  {
    let mut sw = ShardWal::open(env.config.clone(), None).unwrap();
    let shard = sw.shard_of(&id);
    let mut engine = sw.lock_shard(shard);
    engine.append_write(&id, &[&[3u8; 16]]).unwrap();
    engine.truncate(&id, 4).unwrap();
    assert_eq!(engine.flush().unwrap(), 0);
    drop(engine);
    sw.close_all().unwrap();
  }

  // Applying the archived WAL a second time through cold replay must
  // produce the same bytes the normal apply produced.
  let normal = fs::read(id.active_path(&env.config.active_folder)).unwrap();

  let archived = archived_wal_files(&env);
  assert_eq!(archived.len(), 1);
  let replication_active = env.config.replication_active_folder.clone().unwrap();
  let replicator = Replicator::with_file(
    archived[0].clone(),
    Some(replication_active.clone()),
    env.config.replication_archive_folder.clone(),
    None,
  );
  replicator.execute().unwrap();

  let replayed = fs::read(id.active_path(&replication_active)).unwrap();
  assert_eq!(normal, replayed);
}

#[test]
fn test_sync_command_expansion_and_output() {
  let env = TestEnv::new();
  let mut config = env.config.clone();
  config.rsync_command = Some("echo act=%act arc=%arc walact=%walact walarc=%walarc tag=%tag".into());

  let mut driver = Driver::open(config.clone(), None).unwrap();
  let id = test_id();
  driver.append_rows(&id, &[]).unwrap();

  let mut params = HashMap::new();
  params.insert("tag".to_string(), vec!["a".to_string(), "b".to_string()]);

  let output = driver.exec_sync_command(&params).unwrap();
  let text = String::from_utf8(output).unwrap();
  assert!(text.contains(&format!("act={}", config.active_folder.display())));
  assert!(text.contains(&format!(
    "arc={}",
    config.archive_folder.as_ref().unwrap().display()
  )));
  assert!(text.contains("tag=a,b"));

  // The engine quiesced but stays usable.
  driver.append_rows(&id, &[]).unwrap();
  driver.close().unwrap();
}

#[test]
fn test_sync_command_failure_surfaces_output() {
  let env = TestEnv::new();
  let mut config = env.config.clone();
  config.rsync_command = Some("echo boom >&2; exit 3".into());

  let mut driver = Driver::open(config, None).unwrap();
  let err = driver.exec_sync_command(&HashMap::new()).unwrap_err();
  let msg = err.to_string();
  assert!(msg.contains("boom"), "stderr missing from error: {}", msg);
  driver.close().unwrap();
}

#[test]
fn test_sync_command_refused_while_replicator_runs() {
  let env = TestEnv::new();
  let mut config = env.config.clone();
  config.rsync_command = Some("echo never".into());

  let mut driver = Driver::open(config, None).unwrap();
  let mut replicator = driver.replicator().unwrap();
  replicator.start();

  let res = driver.exec_sync_command(&HashMap::new());
  assert!(res.is_err(), "sync command must be refused while replicating");

  // Closing the driver closes the event stream, letting the replicator
  // loop end; then the stop join cannot hang.
  driver.close().unwrap();
  replicator.stop();
}

//! End-to-end orchestration tests: a mock poller hands out revisions, a
//! mock slave streams build progress, and the master is expected to turn
//! that into finished buildsets.

use std::collections::HashMap;

use bellows_core::config::Settings;
use bellows_core::context::Context;
use bellows_core::db::buildset::BuildSetRepo;
use bellows_core::db::repository::RepositoryRepo;
use bellows_core::db::slave::SlaveRepo;
use bellows_core::db::{create_pool, run_migrations};
use bellows_core::models::{BuildSet, BuildSetStatus, BuildStatus, Repository, RepositoryId};
use bellows_core::notifications::Exchanges;
use bellows_core::slave::Slave;
use bellows_server::scheduler;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn read_frame(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Option<Value> {
    let mut len_line = String::new();
    let n = reader.read_line(&mut len_line).await.ok()?;
    if n == 0 {
        return None;
    }
    let len: usize = len_line.trim().parse().ok()?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

async fn write_frame(writer: &mut tokio::net::tcp::OwnedWriteHalf, value: &Value) {
    let data = serde_json::to_vec(value).unwrap();
    let mut frame = format!("{}\n", data.len()).into_bytes();
    frame.extend_from_slice(&data);
    let _ = writer.write_all(&frame).await;
    let _ = writer.flush().await;
}

/// A slave daemon double: every build request gets the scripted frames.
async fn mock_slave(frames_per_build: Vec<Vec<Value>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut remaining = frames_per_build.into_iter();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let frames = remaining.next().unwrap_or_default();
            tokio::spawn(handle_slave_connection(socket, frames));
        }
    });

    port
}

async fn handle_slave_connection(socket: TcpStream, frames: Vec<Value>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(request) = read_frame(&mut reader).await {
        match request.get("action").and_then(Value::as_str) {
            Some("healthcheck") => {
                write_frame(&mut write_half, &json!({"code": 0, "body": {"ok": true}})).await;
            }
            Some("build") => {
                for body in &frames {
                    write_frame(&mut write_half, &json!({"code": 0, "body": body})).await;
                }
                write_frame(&mut write_half, &json!({"code": 0, "body": null})).await;
            }
            _ => {
                write_frame(
                    &mut write_half,
                    &json!({"code": 1, "body": {"error": "unexpected action"}}),
                )
                .await;
            }
        }
    }
}

/// A poller daemon double answering every poll with the given revisions.
async fn mock_poller(revisions: Vec<Value>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let revisions = revisions.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut reader = BufReader::new(read_half);
                while let Some(request) = read_frame(&mut reader).await {
                    assert_eq!(request["action"], "poll");
                    write_frame(
                        &mut write_half,
                        &json!({"code": 0, "body": {"revisions": revisions}}),
                    )
                    .await;
                }
            });
        }
    });

    port
}

async fn test_context(poller_port: u16) -> Context {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    let settings = Settings {
        poller_host: "127.0.0.1".to_string(),
        poller_port,
        ..Settings::default()
    };
    let (exchanges, _, _) = Exchanges::in_memory();
    Context::with_exchanges(pool, settings, exchanges)
}

async fn seed_repository(ctx: &Context, slave_port: u16) -> Repository {
    let repo = Repository {
        id: RepositoryId::new(),
        name: "repo".to_string(),
        url: "git@somewhere/repo.git".to_string(),
        vcs_type: "git".to_string(),
        parallel_builds: 0,
        envvars: HashMap::new(),
        branches: Vec::new(),
        latest_buildset: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    RepositoryRepo::create(&ctx.pool, &repo).await.unwrap();

    let slave = Slave::new("slave-1", "127.0.0.1", slave_port, "token");
    SlaveRepo::create(&ctx.pool, &slave).await.unwrap();
    RepositoryRepo::add_slave(&ctx.pool, &repo.id, &slave.id)
        .await
        .unwrap();

    repo
}

fn build_frames(status: &str) -> Vec<Value> {
    vec![
        json!({"info_type": "build_info", "status": "running",
               "started": null, "finished": null, "steps": []}),
        json!({"info_type": "build_info", "status": status,
               "started": null, "finished": null, "total_time": 0}),
    ]
}

async fn wait_terminal(ctx: &Context, repo: &Repository) -> BuildSet {
    for _ in 0..200 {
        let ids = BuildSetRepo::list_ids_for_repository(&ctx.pool, &repo.id)
            .await
            .unwrap();
        if let Some(id) = ids.first() {
            let buildset = BuildSet::get(&ctx.pool, id).await.unwrap();
            let done = !buildset.builds.is_empty()
                && buildset.builds.iter().all(|b| b.status.is_terminal())
                && buildset.finished.is_some();
            if done {
                return buildset;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("no buildset reached a terminal state");
}

#[tokio::test]
async fn test_poll_to_finished_buildset() {
    let slave_port = mock_slave(vec![build_frames("success"), build_frames("success")]).await;
    let poller_port = mock_poller(vec![json!({
        "branch": "master",
        "commit": "deadbeef",
        "commit_date": Utc::now().to_rfc3339(),
        "author": "someone",
        "title": "a change",
        "body": "longer text",
        "config": "builders:\n  - name: unit\n  - name: lint\n",
    })])
    .await;

    let ctx = test_context(poller_port).await;
    let repo = seed_repository(&ctx, slave_port).await;

    scheduler::poll_repository(&ctx, repo.clone()).await.unwrap();

    let buildset = wait_terminal(&ctx, &repo).await;
    // Let the trailing bookkeeping (latest buildset pointer) land.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(buildset.number, 1);
    assert_eq!(buildset.builds.len(), 2);
    assert_eq!(buildset.status, BuildSetStatus::Success);
    assert!(buildset
        .builds
        .iter()
        .all(|b| b.status == BuildStatus::Success));

    // The repository's latest buildset pointer follows the run.
    let stored_repo = Repository::get(&ctx.pool, &repo.id).await.unwrap();
    assert_eq!(stored_repo.latest_buildset, Some(buildset.id));
}

#[tokio::test]
async fn test_poll_with_failing_build_marks_buildset_failed() {
    let slave_port = mock_slave(vec![build_frames("fail"), build_frames("success")]).await;
    let poller_port = mock_poller(vec![json!({
        "branch": "master",
        "commit": "deadbeef",
        "commit_date": Utc::now().to_rfc3339(),
        "author": "someone",
        "title": "a change",
        "body": "longer text",
        "config": "builders:\n  - name: unit\n  - name: lint\n",
    })])
    .await;

    let ctx = test_context(poller_port).await;
    let repo = seed_repository(&ctx, slave_port).await;

    scheduler::poll_repository(&ctx, repo.clone()).await.unwrap();

    let buildset = wait_terminal(&ctx, &repo).await;
    assert_eq!(buildset.status, BuildSetStatus::Fail);
}

#[tokio::test]
async fn test_poll_without_config_leaves_no_config_buildset() {
    let poller_port = mock_poller(vec![json!({
        "branch": "master",
        "commit": "deadbeef",
        "commit_date": Utc::now().to_rfc3339(),
        "author": "someone",
        "title": "a change",
        "body": "longer text",
    })])
    .await;

    let ctx = test_context(poller_port).await;
    let repo = seed_repository(&ctx, 1).await;

    scheduler::poll_repository(&ctx, repo.clone()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ids = BuildSetRepo::list_ids_for_repository(&ctx.pool, &repo.id)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    let buildset = BuildSet::get(&ctx.pool, &ids[0]).await.unwrap();
    assert_eq!(buildset.status, BuildSetStatus::NoConfig);
    assert!(buildset.builds.is_empty());
}

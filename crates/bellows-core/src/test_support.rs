//! Shared helpers for core tests.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::context::Context;
use crate::db::{
    create_pool,
    repository::{RepositoryRepo, RevisionRepo},
    run_migrations,
    slave::SlaveRepo,
};
use crate::models::{
    BranchConfig, Builder, BuildSet, Repository, RepositoryId, Revision, RevisionId,
};
use crate::notifications::{Exchanges, MemoryExchange};
use crate::slave::Slave;

pub(crate) async fn test_context() -> (Context, MemoryExchange, MemoryExchange) {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    let (exchanges, notifications, integrations) = Exchanges::in_memory();
    let ctx = Context::with_exchanges(pool, Settings::default(), exchanges);
    (ctx, notifications, integrations)
}

pub(crate) async fn seed_repository(ctx: &Context, parallel_builds: i64) -> Repository {
    seed_repository_with_branches(ctx, parallel_builds, Vec::new()).await
}

pub(crate) async fn seed_repository_with_branches(
    ctx: &Context,
    parallel_builds: i64,
    branches: Vec<BranchConfig>,
) -> Repository {
    let repo = Repository {
        id: RepositoryId::new(),
        name: "repo".to_string(),
        url: "git@somewhere/repo.git".to_string(),
        vcs_type: "git".to_string(),
        parallel_builds,
        envvars: HashMap::new(),
        branches,
        latest_buildset: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    RepositoryRepo::create(&ctx.pool, &repo).await.unwrap();
    repo
}

pub(crate) async fn seed_slave(
    ctx: &Context,
    repo: &Repository,
    host: &str,
    port: u16,
) -> Slave {
    // Slave names are unique; derive one from the endpoint.
    let slave = Slave::new(&format!("slave-{}-{}", host, port), host, port, "asdf");
    SlaveRepo::create(&ctx.pool, &slave).await.unwrap();
    RepositoryRepo::add_slave(&ctx.pool, &repo.id, &slave.id)
        .await
        .unwrap();
    slave
}

pub(crate) async fn seed_revision(
    ctx: &Context,
    repo: &Repository,
    branch: &str,
    config: Option<&str>,
) -> Revision {
    let revision = Revision {
        id: RevisionId::new(),
        repository_id: repo.id.clone(),
        branch: branch.to_string(),
        commit: "bgcdf3123".to_string(),
        commit_date: Utc::now(),
        author: "someone".to_string(),
        title: "something".to_string(),
        body: String::new(),
        config: config.map(str::to_string),
        builders_fallback: None,
        builders_include: Vec::new(),
        builders_exclude: Vec::new(),
        external: None,
    };
    RevisionRepo::create(&ctx.pool, &revision).await.unwrap();
    revision
}

/// A buildset with one pending build per builder name.
pub(crate) async fn seed_buildset(
    ctx: &Context,
    repo: &Repository,
    revision: &Revision,
    builder_names: &[&str],
) -> BuildSet {
    let mut buildset = BuildSet::create(ctx, repo, revision).await.unwrap();
    for (i, name) in builder_names.iter().enumerate() {
        let builder = Builder::get_or_create(&ctx.pool, &repo.id, name, i as i64)
            .await
            .unwrap();
        let build = crate::models::Build::new(
            repo.id.clone(),
            buildset.id.clone(),
            &builder,
            &revision.branch,
            &revision.commit,
            i as i64 + 1,
            Some(revision.branch.clone()),
            None,
        );
        buildset.add_build(ctx, build).await.unwrap();
    }
    buildset
}

/// A scripted slave daemon: accepts connections and answers each `build`
/// request with the given stream frames. Other actions get a canned
/// response. Returns the listen port.
pub(crate) async fn mock_slave_server(frames_per_build: Vec<Vec<serde_json::Value>>) -> u16 {
    mock_slave_server_with_delay(frames_per_build, 0).await
}

/// Like [`mock_slave_server`], sleeping `delay_ms` before answering each
/// build request so tests can observe concurrent sessions.
pub(crate) async fn mock_slave_server_with_delay(
    frames_per_build: Vec<Vec<serde_json::Value>>,
    delay_ms: u64,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut remaining = frames_per_build.into_iter();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let frames = remaining.next().unwrap_or_default();
            tokio::spawn(handle_mock_connection(socket, frames, delay_ms));
        }
    });

    port
}

async fn handle_mock_connection(
    socket: tokio::net::TcpStream,
    frames: Vec<serde_json::Value>,
    delay_ms: u64,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);

    loop {
        let request = match read_frame(&mut reader).await {
            Some(request) => request,
            None => break,
        };

        match request.get("action").and_then(serde_json::Value::as_str) {
            Some("healthcheck") => {
                write_frame(&mut write_half, &json!({"code": 0, "body": {"ok": true}})).await;
            }
            Some("build") => {
                if delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                for body in &frames {
                    write_frame(&mut write_half, &json!({"code": 0, "body": body})).await;
                }
                // Empty body signals end-of-stream.
                write_frame(&mut write_half, &json!({"code": 0, "body": null})).await;
            }
            Some("cancel_build") => {
                write_frame(&mut write_half, &json!({"code": 0, "body": {"cancelled": true}}))
                    .await;
            }
            Some("list_builders") => {
                write_frame(
                    &mut write_half,
                    &json!({"code": 0, "body": {"builders": ["builder-1", "builder-2"]}}),
                )
                .await;
            }
            _ => {
                write_frame(&mut write_half, &json!({"code": 1, "body": {"error": "bad action"}}))
                    .await;
            }
        }
    }
}

async fn read_frame(
    reader: &mut tokio::io::BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Option<serde_json::Value> {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

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

async fn write_frame(writer: &mut tokio::net::tcp::OwnedWriteHalf, value: &serde_json::Value) {
    let data = serde_json::to_vec(value).unwrap();
    let mut frame = format!("{}\n", data.len()).into_bytes();
    frame.extend_from_slice(&data);
    let _ = writer.write_all(&frame).await;
    let _ = writer.flush().await;
}

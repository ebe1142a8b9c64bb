use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use runscope::{Event, EventData, ProjectId, TailOptions};
use runscope_client::{ViewerConnection, ViewerResponse};
use runscope_server::RunscopeServer;

const PROJECT: &str = "proj";

async fn start_server(root: &Path) -> ViewerConnection {
    let options = TailOptions {
        chunk_bytes: 100,
        max_batch: 50,
        poll: Duration::from_millis(25),
    };
    let server = RunscopeServer::bind("127.0.0.1:0".parse().unwrap(), root, options)
        .await
        .unwrap();
    let address = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut connection = ViewerConnection::new(address);
    connection.connect().await.unwrap();
    connection
}

async fn next(connection: &mut ViewerConnection) -> ViewerResponse {
    timeout(Duration::from_secs(10), connection.receive())
        .await
        .expect("timed out waiting for the server")
        .unwrap()
}

async fn next_for(connection: &mut ViewerConnection, id: Uuid) -> ViewerResponse {
    timeout(Duration::from_secs(10), connection.receive_for(id))
        .await
        .expect("timed out waiting for the server")
        .unwrap()
}

fn line(elapsed: u64) -> String {
    Event::new(
        EventData::DelaySample {
            pid: 7,
            delay_millis: elapsed % 13,
        },
        elapsed,
    )
    .to_line()
    .unwrap()
}

fn run_path(root: &Path, timestamp: u64) -> PathBuf {
    root.join(PROJECT).join(format!("{}.jsonl", timestamp))
}

fn append(path: &Path, text: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
}

fn lines(range: std::ops::Range<u64>) -> String {
    range.map(line).collect()
}

async fn collect_samples(
    connection: &mut ViewerConnection,
    subscription: Uuid,
    into: &mut Vec<u64>,
    until: usize,
) {
    while into.len() < until {
        match next(connection).await {
            ViewerResponse::Samples {
                subscription_id,
                events,
            } => {
                assert_eq!(subscription_id, subscription);
                into.extend(events.iter().map(|e| e.elapsed));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_tail_follows_appends_in_order() {
    let root = tempfile::tempdir().unwrap();
    let path = run_path(root.path(), 1000);
    append(&path, &lines(0..3));
    let mut connection = start_server(root.path()).await;

    let subscription = connection
        .project_samples(ProjectId::new(PROJECT), 1000)
        .await
        .unwrap();
    let mut seen = Vec::new();
    collect_samples(&mut connection, subscription, &mut seen, 3).await;

    // Cut a line in half across two writes
    let more = lines(3..8);
    let (head, rest) = more.split_at(more.len() / 2 + 3);
    append(&path, head);
    tokio::time::sleep(Duration::from_millis(60)).await;
    append(&path, rest);
    collect_samples(&mut connection, subscription, &mut seen, 8).await;

    append(&path, &lines(8..120));
    collect_samples(&mut connection, subscription, &mut seen, 120).await;

    assert_eq!(seen, (0..120).collect::<Vec<_>>());
}

#[test_log::test(tokio::test)]
async fn test_project_list_pushes_new_projects() {
    let root = tempfile::tempdir().unwrap();
    let mut connection = start_server(root.path()).await;

    let subscription = connection.list_projects().await.unwrap();
    match next_for(&mut connection, subscription).await {
        ViewerResponse::ProjectList { projects, .. } => assert!(projects.is_empty()),
        other => panic!("unexpected response {:?}", other),
    }

    append(&run_path(root.path(), 5), &lines(0..1));
    loop {
        match next_for(&mut connection, subscription).await {
            ViewerResponse::ProjectList { projects, .. } if !projects.is_empty() => {
                assert_eq!(projects.len(), 1);
                assert_eq!(projects[0].id, ProjectId::new(PROJECT));
                assert_eq!(projects[0].latest_run, Some(5));
                break;
            }
            ViewerResponse::ProjectList { .. } => continue,
            other => panic!("unexpected response {:?}", other),
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_tag_edits_reach_project_subscribers() {
    let root = tempfile::tempdir().unwrap();
    append(&run_path(root.path(), 77), &lines(0..2));
    let mut connection = start_server(root.path()).await;
    let project = ProjectId::new(PROJECT);

    let info = connection.project_info(project.clone()).await.unwrap();
    match next_for(&mut connection, info).await {
        ViewerResponse::ProjectInfo { project, .. } => {
            assert_eq!(project.runs.len(), 1);
            assert!(project.runs[0].meta.tags.is_empty());
        }
        other => panic!("unexpected response {:?}", other),
    }

    for _ in 0..2 {
        let request = connection
            .add_tag(project.clone(), 77, "flaky")
            .await
            .unwrap();
        match next_for(&mut connection, request).await {
            ViewerResponse::MetaSaved { meta, .. } => assert_eq!(meta.tags, vec!["flaky"]),
            other => panic!("unexpected response {:?}", other),
        }
    }

    let request = connection
        .remove_tag(project.clone(), 77, "absent")
        .await
        .unwrap();
    match next_for(&mut connection, request).await {
        ViewerResponse::MetaSaved { meta, .. } => assert_eq!(meta.tags, vec!["flaky"]),
        other => panic!("unexpected response {:?}", other),
    }

    let request = connection
        .set_remote_id(project.clone(), 77, Some("build-42".to_string()))
        .await
        .unwrap();
    match next_for(&mut connection, request).await {
        ViewerResponse::MetaSaved { meta, .. } => {
            assert_eq!(meta.remote_id.as_deref(), Some("build-42"))
        }
        other => panic!("unexpected response {:?}", other),
    }

    // The project subscription sees the edits without re-reading the log
    loop {
        match next_for(&mut connection, info).await {
            ViewerResponse::ProjectInfo { project, .. }
                if project.runs[0].meta.remote_id.is_some() =>
            {
                assert_eq!(project.runs[0].meta.tags, vec!["flaky"]);
                break;
            }
            ViewerResponse::ProjectInfo { .. } => continue,
            other => panic!("unexpected response {:?}", other),
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_unsubscribe_stops_samples() {
    let root = tempfile::tempdir().unwrap();
    let path = run_path(root.path(), 9);
    append(&path, &lines(0..2));
    let mut connection = start_server(root.path()).await;

    let subscription = connection
        .project_samples(ProjectId::new(PROJECT), 9)
        .await
        .unwrap();
    let mut seen = Vec::new();
    collect_samples(&mut connection, subscription, &mut seen, 2).await;

    connection.unsubscribe(subscription).await.unwrap();
    assert_eq!(
        next_for(&mut connection, subscription).await,
        ViewerResponse::Unsubscribed {
            subscription_id: subscription
        }
    );

    append(&path, &lines(2..10));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Anything the server sends now must not belong to the released tail
    let marker = connection.list_projects().await.unwrap();
    loop {
        let response = next(&mut connection).await;
        assert!(
            !matches!(response, ViewerResponse::Samples { .. }),
            "samples after unsubscribe: {:?}",
            response
        );
        if response.id() == Some(marker) {
            break;
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_missing_run_is_reported_on_the_subscription() {
    let root = tempfile::tempdir().unwrap();
    let mut connection = start_server(root.path()).await;

    let subscription = connection
        .project_samples(ProjectId::new("nowhere"), 1)
        .await
        .unwrap();
    match next_for(&mut connection, subscription).await {
        ViewerResponse::Error { id, .. } => assert_eq!(id, Some(subscription)),
        other => panic!("unexpected response {:?}", other),
    }
    // The connection survives the failure
    let list = connection.list_projects().await.unwrap();
    assert!(matches!(
        next_for(&mut connection, list).await,
        ViewerResponse::ProjectList { .. }
    ));
}

#[test_log::test(tokio::test)]
async fn test_deleting_last_run_removes_project_without_error() {
    let root = tempfile::tempdir().unwrap();
    let path = run_path(root.path(), 31);
    append(&path, &lines(0..2));
    let mut connection = start_server(root.path()).await;
    let project = ProjectId::new(PROJECT);

    let info = connection.project_info(project.clone()).await.unwrap();
    match next_for(&mut connection, info).await {
        ViewerResponse::ProjectInfo { project, .. } => assert_eq!(project.runs.len(), 1),
        other => panic!("unexpected response {:?}", other),
    }

    std::fs::remove_file(&path).unwrap();
    loop {
        match next_for(&mut connection, info).await {
            ViewerResponse::ProjectRemoved {
                project: removed, ..
            } => {
                assert_eq!(removed, project);
                break;
            }
            // Writes still settling before the delete
            ViewerResponse::ProjectInfo { .. } => continue,
            other => panic!("unexpected response {:?}", other),
        }
    }
}

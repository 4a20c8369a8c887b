//! End-to-end tests running the worker pool against shell stand-ins for the
//! dataset tool.

mod common;

use common::TestEnv;
use dataset_registry::config::ToolSettings;
use dataset_registry::execution::CliToolAdapter;
use dataset_registry::registry_store::{DatasetStatus, FailureKind, JobKind, JobState, RegistryStore};
use std::path::Path;

fn tool_settings(scratch: &Path, clone_command: &str, verify_command: &str) -> ToolSettings {
    ToolSettings {
        clone_command: clone_command.to_string(),
        revision_command: "echo 9f8e7d".to_string(),
        describe_command: "echo v2.1".to_string(),
        annex_uuid_command: "echo 2f3c1a44-annex".to_string(),
        branches_command: r"printf 'origin/HEAD -> origin/main\norigin/main\n'".to_string(),
        tags_command: "printf 'v2.0\nv2.1\n'".to_string(),
        verify_command: verify_command.to_string(),
        timeout_secs: 10,
        scratch_dir: scratch.to_path_buf(),
    }
}

const CLONE_OK: &str = r#"sh -c 'mkdir -p "$1" && printf 0123456789 > "$1/annex.bin"' clone {workdir}"#;

fn scratch_entries(path: &Path) -> usize {
    std::fs::read_dir(path).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_register_through_tool_records_metadata_and_cleans_scratch() {
    let env = TestEnv::new();
    let scratch = env.dir.path().join("scratch");
    let dataset = env
        .registry()
        .register_dataset("https://example.org/ds.git", None)
        .unwrap();

    let pool = env.worker_pool(CliToolAdapter::new(tool_settings(&scratch, CLONE_OK, "true")));
    assert!(pool.process_next(0).await.unwrap());

    let stored = env.store.get_dataset(&dataset.id).unwrap().unwrap();
    assert_eq!(stored.status, DatasetStatus::Healthy);
    assert_eq!(stored.last_revision.as_deref(), Some("9f8e7d"));
    assert_eq!(stored.head_describe.as_deref(), Some("v2.1"));
    assert_eq!(stored.annex_uuid.as_deref(), Some("2f3c1a44-annex"));
    assert_eq!(stored.branches, vec!["origin/main".to_string()]);
    assert_eq!(stored.tags, vec!["v2.0".to_string(), "v2.1".to_string()]);
    assert_eq!(stored.size_bytes, Some(10));
    assert_eq!(scratch_entries(&scratch), 0);
}

#[tokio::test]
async fn test_failed_verify_degrades_and_cleans_scratch() {
    let env = TestEnv::new();
    let scratch = env.dir.path().join("scratch");
    let dataset = env
        .registry()
        .register_dataset("https://example.org/ds.git", None)
        .unwrap();
    let register = env.store.active_job_for_dataset(&dataset.id).unwrap().unwrap();
    env.registry().cancel_job(register.id).unwrap();
    let verify = env
        .store
        .create_job(&dataset.id, JobKind::Verify, 0, 3)
        .unwrap();

    let pool = env.worker_pool(CliToolAdapter::new(tool_settings(
        &scratch,
        CLONE_OK,
        "sh -c 'echo missing blob 1234 >&2; exit 1'",
    )));
    assert!(pool.process_next(0).await.unwrap());

    // The job itself succeeded; the dataset is flagged.
    assert_eq!(
        env.store.get_job(verify).unwrap().unwrap().state,
        JobState::Succeeded
    );
    let stored = env.store.get_dataset(&dataset.id).unwrap().unwrap();
    assert_eq!(stored.status, DatasetStatus::Degraded);
    assert_eq!(scratch_entries(&scratch), 0);
}

#[tokio::test]
async fn test_missing_repository_fails_permanently_and_cleans_scratch() {
    let env = TestEnv::new();
    let scratch = env.dir.path().join("scratch");
    let dataset = env
        .registry()
        .register_dataset("https://example.org/gone.git", None)
        .unwrap();
    let job = env.store.active_job_for_dataset(&dataset.id).unwrap().unwrap();

    let clone_missing = r#"sh -c 'mkdir -p "$1"; echo "remote: Repository not found." >&2; exit 128' clone {workdir}"#;
    let pool = env.worker_pool(CliToolAdapter::new(tool_settings(
        &scratch,
        clone_missing,
        "true",
    )));
    assert!(pool.process_next(0).await.unwrap());

    let failed = env.store.get_job(job.id).unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error_kind, Some(FailureKind::Permanent));
    assert_eq!(
        env.store.get_dataset(&dataset.id).unwrap().unwrap().status,
        DatasetStatus::Unreachable
    );
    assert_eq!(scratch_entries(&scratch), 0);
}

//! Integration tests for the synd-queue CLI

use assert_cmd::Command;
use libsyndicast::{
    CredentialVault, Database, Platform, Post, PostItem, PostItemStatus, SocialAccount,
};
use predicates::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use tempfile::TempDir;

const MASTER_KEY: &str = "queue-cli-master-key";

/// Write a config pointing at a fresh database inside the temp dir
async fn setup_test_env() -> (TempDir, String, Database) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("syndicast.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[vault]
master_key = "{}"
"#,
        db_path.display().to_string().replace('\\', "/"),
        MASTER_KEY
    );
    fs::write(&config_path, config_content).unwrap();

    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    (temp_dir, config_path.to_str().unwrap().to_string(), db)
}

fn synd_queue(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("synd-queue").unwrap();
    cmd.env_remove("SYNDICAST_DB_PATH")
        .env_remove("SYNDICAST_MASTER_KEY")
        .env_remove("SYNDICAST_CONFIG")
        .arg("--config")
        .arg(config_path);
    cmd
}

/// A post with one published and one pending item
async fn seed_post(db: &Database) -> (Post, PostItem) {
    let account = SocialAccount::new("brand-1", Platform::Instagram, "ig-1", "blob".to_string());
    db.create_account(&account).await.unwrap();

    let post = Post::new("brand-1");
    db.create_post(&post).await.unwrap();

    let published = PostItem::new(&post, &account, "already out");
    db.create_post_item(&published).await.unwrap();
    db.mark_item_published(&published.id, "ig-post-1", 1_700_000_000, &Default::default())
        .await
        .unwrap();

    let pending = PostItem::new(&post, &account, "still pending");
    db.create_post_item(&pending).await.unwrap();
    assert_eq!(pending.status, PostItemStatus::Pending);

    (post, pending)
}

#[tokio::test]
async fn test_publish_enqueues_only_unpublished_items() {
    let (_dir, config_path, db) = setup_test_env().await;
    let (post, pending) = seed_post(&db).await;

    synd_queue(&config_path)
        .args(["publish", &post.id])
        .assert()
        .success()
        .stdout(predicate::str::contains(&pending.id))
        .stdout(predicate::str::contains("instagram"));

    let output = synd_queue(&config_path)
        .args(["stats", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["publish"]["waiting"], 1);
    assert_eq!(stats["metrics"]["waiting"], 0);
}

#[tokio::test]
async fn test_publish_with_delay_is_not_waiting() {
    let (_dir, config_path, db) = setup_test_env().await;
    let (post, _) = seed_post(&db).await;

    synd_queue(&config_path)
        .args(["publish", &post.id, "--delay", "1h"])
        .assert()
        .success();

    let output = synd_queue(&config_path)
        .args(["stats", "--format", "json"])
        .output()
        .unwrap();
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["publish"]["waiting"], 0);
    assert_eq!(stats["publish"]["delayed"], 1);
}

#[tokio::test]
async fn test_publish_unknown_post_exits_with_invalid_input() {
    let (_dir, config_path, _db) = setup_test_env().await;

    synd_queue(&config_path)
        .args(["publish", "no-such-post"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("post not found"));
}

#[tokio::test]
async fn test_list_shows_enqueued_jobs() {
    let (_dir, config_path, db) = setup_test_env().await;
    let (post, pending) = seed_post(&db).await;

    synd_queue(&config_path)
        .args(["publish", &post.id])
        .assert()
        .success();

    synd_queue(&config_path)
        .args(["list", "publish", "--state", "waiting"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&pending.id))
        .stdout(predicate::str::contains("attempt 0/3"));
}

#[tokio::test]
async fn test_retry_reports_every_queue() {
    let (_dir, config_path, _db) = setup_test_env().await;

    synd_queue(&config_path)
        .arg("retry")
        .assert()
        .success()
        .stdout(predicate::str::contains("publish\t0"))
        .stdout(predicate::str::contains("metrics\t0"))
        .stdout(predicate::str::contains("inbox-poll\t0"));
}

#[tokio::test]
async fn test_seal_token_output_opens_with_the_vault() {
    let (_dir, config_path, _db) = setup_test_env().await;

    let output = synd_queue(&config_path)
        .args(["seal-token", "--stdin"])
        .write_stdin("platform-access-token\n")
        .output()
        .unwrap();
    assert!(output.status.success());

    let blob = String::from_utf8(output.stdout).unwrap();
    let vault = CredentialVault::new(SecretString::from(MASTER_KEY.to_string())).unwrap();
    let token = vault.decrypt(blob.trim()).unwrap();
    assert_eq!(token.expose_secret(), "platform-access-token");
}

#[tokio::test]
async fn test_seal_token_rejects_empty_input() {
    let (_dir, config_path, _db) = setup_test_env().await;

    synd_queue(&config_path)
        .args(["seal-token", "--stdin"])
        .write_stdin("   \n")
        .assert()
        .failure()
        .code(3);
}

#[tokio::test]
async fn test_metrics_for_unknown_account_fails() {
    let (_dir, config_path, _db) = setup_test_env().await;

    synd_queue(&config_path)
        .args(["metrics", "--account", "missing"])
        .assert()
        .failure()
        .code(3);
}

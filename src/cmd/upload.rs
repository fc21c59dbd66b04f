use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::Table;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cmd::cli::UploadFilesArgs;
use crate::cmd::config::Settings;
use crate::dropbox::content_hash::content_hash_file;
use crate::dropbox::types::{FileMetadata, UploadArg, UploadRequest, WriteMode};
use crate::dropbox::{load_credentials, Client};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Prepended verbatim to each file's path.
    pub prefix: String,
    pub mode: WriteMode,
    pub autorename: bool,
    pub mute: bool,
    pub strict_conflict: bool,
    pub content_hash: bool,
    pub concurrency: NonZeroUsize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            mode: WriteMode::Overwrite,
            autorename: false,
            mute: false,
            strict_conflict: false,
            content_hash: false,
            concurrency: NonZeroUsize::MIN,
        }
    }
}

/// Result of uploading one file.
#[derive(Debug)]
pub enum UploadOutcome {
    Uploaded { file: PathBuf, metadata: FileMetadata },
    Failed { file: PathBuf, error: anyhow::Error },
}

impl UploadOutcome {
    pub fn file(&self) -> &Path {
        match self {
            UploadOutcome::Uploaded { file, .. } | UploadOutcome::Failed { file, .. } => file,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }
}

/// Every outcome of a batch, in completion order.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub outcomes: Vec<UploadOutcome>,
}

impl UploadReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Remote path of `file`: the prefix followed by the path as given.
///
/// Separators become `/`, and `.` components and any root are dropped, so
/// `./dir/a.txt` and `/dir/a.txt` both map to `<prefix>dir/a.txt`. Paths
/// with `..` have no place under the prefix and are rejected.
pub fn destination_path(prefix: &str, file: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in file.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                bail!("{} refers to a parent directory", file.display())
            }
        }
    }
    if parts.is_empty() {
        bail!("{} has no file name", file.display());
    }
    Ok(format!("{}{}", prefix, parts.join("/")))
}

/// Map every file to its remote path. Files that cannot be mapped, or that
/// land on a path already taken by an earlier file, carry an error instead.
fn plan_destinations(files: &[PathBuf], prefix: &str) -> Vec<(PathBuf, Result<String>)> {
    let mut taken: HashMap<String, &Path> = HashMap::new();
    files
        .iter()
        .map(|file| {
            let destination = destination_path(prefix, file).and_then(|path| {
                if let Some(first) = taken.get(&path) {
                    bail!(
                        "{} would overwrite {} at {}",
                        file.display(),
                        first.display(),
                        path
                    );
                }
                taken.insert(path.clone(), file);
                Ok(path)
            });
            (file.clone(), destination)
        })
        .collect()
}

fn upload_arg(
    path: String,
    options: &UploadOptions,
    client_modified: Option<DateTime<Utc>>,
    content_hash: Option<String>,
) -> UploadArg {
    UploadArg {
        path,
        mode: options.mode.clone(),
        autorename: options.autorename,
        mute: options.mute,
        strict_conflict: options.strict_conflict,
        client_modified,
        content_hash,
    }
}

/// Open `file` and build its upload request. The body streams from disk.
async fn prepare_upload(file: &Path, path: String, options: &UploadOptions) -> Result<UploadRequest> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open file {}", file.display()))?;
    let metadata = handle
        .metadata()
        .await
        .with_context(|| format!("failed to read metadata of {}", file.display()))?;
    if metadata.is_dir() {
        bail!("{} is a directory", file.display());
    }
    let client_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    let hash = if options.content_hash {
        let hash = content_hash_file(file)
            .await
            .with_context(|| format!("failed to hash file {}", file.display()))?;
        Some(hash)
    } else {
        None
    };

    tracing::debug!(file = %file.display(), size = metadata.len(), %path, "upload prepared");
    Ok(UploadRequest {
        body: reqwest::Body::from(handle),
        arg: upload_arg(path, options, client_modified, hash),
    })
}

async fn upload_one(
    client: &Client,
    file: &Path,
    path: String,
    options: &UploadOptions,
) -> Result<FileMetadata> {
    let request = prepare_upload(file, path, options).await?;
    let path = request.arg.path.clone();
    client
        .files_upload(request)
        .await
        .with_context(|| format!("failed to upload file {}", path))
}

/// Upload every file, at most `options.concurrency` at a time.
///
/// A failing file never stops the batch. Files that cannot be mapped to a
/// unique remote path fail before anything is sent. `on_outcome` sees each
/// result as soon as it is known; the returned report holds all of them.
pub async fn upload_files<F>(
    client: &Client,
    files: &[PathBuf],
    options: &UploadOptions,
    mut on_outcome: F,
) -> UploadReport
where
    F: FnMut(&UploadOutcome),
{
    let mut report = UploadReport::default();
    let mut planned = Vec::with_capacity(files.len());
    for (file, destination) in plan_destinations(files, &options.prefix) {
        match destination {
            Ok(path) => planned.push((file, path)),
            Err(error) => {
                let outcome = UploadOutcome::Failed { file, error };
                on_outcome(&outcome);
                report.outcomes.push(outcome);
            }
        }
    }

    let mut outcomes = futures::stream::iter(planned)
        .map(|(file, path)| async move {
            tracing::debug!(file = %file.display(), "upload started");
            match upload_one(client, &file, path, options).await {
                Ok(metadata) => UploadOutcome::Uploaded { file, metadata },
                Err(error) => UploadOutcome::Failed { file, error },
            }
        })
        .buffer_unordered(options.concurrency.get());

    while let Some(outcome) = outcomes.next().await {
        on_outcome(&outcome);
        report.outcomes.push(outcome);
    }
    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "upload batch finished"
    );
    report
}

fn print_summary(report: &UploadReport) {
    let mut table = Table::new();
    table.set_header(vec!["File", "Result", "Detail"]);
    for outcome in &report.outcomes {
        match outcome {
            UploadOutcome::Uploaded { file, metadata } => table.add_row(vec![
                file.display().to_string(),
                "uploaded".to_string(),
                metadata.path_display.clone(),
            ]),
            UploadOutcome::Failed { file, error } => table.add_row(vec![
                file.display().to_string(),
                "failed".to_string(),
                format!("{:#}", error),
            ]),
        };
    }
    println!("{table}");
    println!(
        "✅ {} uploaded, ❌ {} failed",
        report.succeeded(),
        report.failed()
    );
}

/// Run the `upload-files` command.
pub async fn execute_upload(args: UploadFilesArgs, settings: &Settings) -> Result<()> {
    let credentials = load_credentials(&settings.config_path)
        .context("failed to create new dropbox client")?;
    let client = Client::builder()
        .auth_endpoint(&settings.auth_endpoint)
        .content_endpoint(&settings.content_endpoint)
        .credentials(credentials)
        .build()?;

    let options = UploadOptions {
        prefix: args
            .dropbox_path
            .unwrap_or_else(|| settings.dropbox_path.clone()),
        mode: args.mode.into(),
        autorename: args.autorename,
        mute: args.mute,
        strict_conflict: args.strict_conflict,
        content_hash: args.content_hash,
        concurrency: args.concurrency.unwrap_or(settings.concurrency),
    };

    println!(
        "📤 Uploading {} file(s) to {}",
        args.files.len(),
        options.prefix
    );

    let pb = ProgressBar::new(args.files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let report = upload_files(&client, &args.files, &options, |outcome| {
        pb.suspend(|| match outcome {
            UploadOutcome::Uploaded { metadata, .. } => {
                println!("File uploaded => {}", metadata.path_display)
            }
            UploadOutcome::Failed { file, error } => {
                println!("Failed to upload {}: {:#}", file.display(), error)
            }
        });
        pb.inc(1);
    })
    .await;
    pb.finish_and_clear();

    print_summary(&report);

    if args.strict && report.failed() > 0 {
        bail!(
            "{} of {} uploads failed",
            report.failed(),
            report.outcomes.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropbox::Credentials;
    use httpmock::prelude::*;
    use std::collections::HashSet;

    fn client(server: &MockServer) -> Client {
        Client::builder()
            .content_endpoint(server.base_url())
            .credentials(Credentials {
                access_token: "access".into(),
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_destination_path() {
        assert_eq!(
            destination_path("/backup/", Path::new("a.txt")).unwrap(),
            "/backup/a.txt"
        );
        assert_eq!(
            destination_path("/backup/", Path::new("some/dir/b.txt")).unwrap(),
            "/backup/some/dir/b.txt"
        );
        assert_eq!(destination_path("/", Path::new("./c")).unwrap(), "/c");
        assert_eq!(destination_path("/", Path::new("/abs/d.txt")).unwrap(), "/abs/d.txt");
        assert_eq!(destination_path("/x-", Path::new("e")).unwrap(), "/x-e");
        assert!(destination_path("/", Path::new("..")).is_err());
        assert!(destination_path("/", Path::new("../f.txt")).is_err());
        assert!(destination_path("/", Path::new(".")).is_err());
    }

    #[test]
    fn test_same_name_in_different_directories_stays_distinct() {
        let files = vec![PathBuf::from("x/a.txt"), PathBuf::from("y/a.txt")];
        let planned: Vec<String> = plan_destinations(&files, "/backup/")
            .into_iter()
            .map(|(_, destination)| destination.unwrap())
            .collect();
        assert_eq!(planned, vec!["/backup/x/a.txt", "/backup/y/a.txt"]);
    }

    #[test]
    fn test_duplicate_destination_is_rejected() {
        let files = vec![PathBuf::from("x/a.txt"), PathBuf::from("./x/a.txt")];
        let planned = plan_destinations(&files, "/backup/");
        assert_eq!(planned[0].1.as_ref().unwrap(), "/backup/x/a.txt");
        let err = planned[1].1.as_ref().unwrap_err();
        assert!(err.to_string().contains("would overwrite x/a.txt"));
    }

    #[test]
    fn test_upload_arg_from_options() {
        let options = UploadOptions {
            prefix: "/x/".into(),
            mode: WriteMode::Add,
            mute: true,
            autorename: true,
            ..Default::default()
        };
        let arg = upload_arg("/x/a".into(), &options, None, Some("h".into()));
        assert_eq!(arg.path, "/x/a");
        assert_eq!(arg.mode, WriteMode::Add);
        assert!(arg.mute);
        assert!(arg.autorename);
        assert!(!arg.strict_conflict);
        assert_eq!(arg.content_hash.as_deref(), Some("h"));
    }

    #[tokio::test]
    async fn test_partial_failure_reports_every_file() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2/files/upload")
                    .header("Authorization", "Bearer access")
                    .header_exists("Dropbox-API-Arg");
                then.status(200).json_body(serde_json::json!({
                    "name": "a.txt",
                    "path_display": "/backup/a.txt",
                    "size": 3
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let c = dir.path().join("c.txt");
        std::fs::write(&a, "aaa").unwrap();
        std::fs::write(&c, "ccc").unwrap();
        let files = vec![a.clone(), dir.path().join("b.txt"), c.clone()];

        let options = UploadOptions {
            prefix: "/backup/".into(),
            concurrency: NonZeroUsize::new(4).unwrap(),
            ..Default::default()
        };
        let mut seen = Vec::new();
        let report = upload_files(&client(&server), &files, &options, |o| {
            seen.push(o.file().to_path_buf())
        })
        .await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(seen.len(), 3);

        let all: HashSet<PathBuf> = seen.into_iter().collect();
        assert_eq!(all, files.iter().cloned().collect::<HashSet<_>>());

        let failed = report
            .outcomes
            .iter()
            .find(|o| !o.is_success())
            .unwrap();
        assert!(failed.file().ends_with("b.txt"));
        let UploadOutcome::Failed { error, .. } = failed else {
            unreachable!()
        };
        assert!(format!("{error:#}").contains("failed to open file"));
    }

    #[tokio::test]
    async fn test_remote_errors_do_not_abort_batch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/2/files/upload");
                then.status(401).body(r#"{"error_summary": "invalid_access_token/"}"#);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..5)
            .map(|i| {
                let path = dir.path().join(format!("f{i}.txt"));
                std::fs::write(&path, format!("{i}")).unwrap();
                path
            })
            .collect();

        let options = UploadOptions {
            concurrency: NonZeroUsize::new(2).unwrap(),
            ..Default::default()
        };
        let report = upload_files(&client(&server), &files, &options, |_| {}).await;

        assert_eq!(report.failed(), 5);
        for outcome in &report.outcomes {
            let UploadOutcome::Failed { error, .. } = outcome else {
                panic!("expected failure");
            };
            let message = format!("{error:#}");
            assert!(message.contains("failed to upload file /"));
            assert!(message.contains(".txt"));
            assert!(message.contains("invalid_access_token"));
        }
    }

    #[tokio::test]
    async fn test_prepare_upload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("h.txt");
        std::fs::write(&file, "hashed").unwrap();

        let options = UploadOptions {
            content_hash: true,
            ..Default::default()
        };
        let request = prepare_upload(&file, "/backup/h.txt".into(), &options)
            .await
            .unwrap();
        assert_eq!(request.arg.path, "/backup/h.txt");
        assert_eq!(request.arg.mode, WriteMode::Overwrite);
        assert_eq!(
            request.arg.content_hash,
            Some(crate::dropbox::content_hash::content_hash(b"hashed"))
        );
        assert!(request.arg.client_modified.is_some());

        let without_hash = prepare_upload(&file, "/h.txt".into(), &UploadOptions::default())
            .await
            .unwrap();
        assert!(without_hash.arg.content_hash.is_none());

        let err = prepare_upload(dir.path(), "/d".into(), &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is a directory"));
    }

    #[tokio::test]
    async fn test_file_contents_are_streamed_to_the_api() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2/files/upload")
                    .header("Content-Type", "application/octet-stream")
                    .body("streamed contents");
                then.status(200)
                    .json_body(serde_json::json!({ "path_display": "/s.txt" }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("s.txt");
        std::fs::write(&file, "streamed contents").unwrap();

        let report = upload_files(&client(&server), &[file], &UploadOptions::default(), |_| {}).await;
        assert_eq!(report.succeeded(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_duplicate_input_uploads_once() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/2/files/upload");
                then.status(200)
                    .json_body(serde_json::json!({ "path_display": "/backup/a.txt" }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "aaa").unwrap();
        let files = vec![a.clone(), a];

        let options = UploadOptions {
            prefix: "/backup/".into(),
            ..Default::default()
        };
        let report = upload_files(&client(&server), &files, &options, |_| {}).await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let server = MockServer::start_async().await;
        let report = upload_files(&client(&server), &[], &UploadOptions::default(), |_| {}).await;
        assert!(report.outcomes.is_empty());
    }
}

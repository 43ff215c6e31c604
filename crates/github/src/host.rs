use anyhow::Result;
use async_trait::async_trait;
use buildrelay_core::models::RepoName;
use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Git object store and pull request tracker of a hosting provider.
///
/// Implementations must be safe to share between concurrently running jobs.
#[async_trait]
pub trait GitHost: Send + Sync {
    async fn branch(&self, repo: &RepoName, branch: &str) -> Result<Branch>;

    /// Decoded contents of the file at `path` as of `git_ref`.
    async fn file_content(&self, repo: &RepoName, path: &str, git_ref: &str) -> Result<Vec<u8>>;

    async fn commit(&self, repo: &RepoName, sha: &str) -> Result<Commit>;

    async fn create_blob(&self, repo: &RepoName, content: &[u8]) -> Result<String>;

    async fn create_tree(
        &self,
        repo: &RepoName,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String>;

    async fn create_commit(
        &self,
        repo: &RepoName,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> Result<Commit>;

    /// Creates `refs/<git_ref>`. Fails with [`ApiError::Conflict`] if it already exists.
    async fn create_ref(&self, repo: &RepoName, git_ref: &str, sha: &str)
    -> Result<GitRef, ApiError>;

    /// Fast-forwards `refs/<git_ref>`. Fails with [`ApiError::Conflict`] if that is not possible.
    async fn update_ref(&self, repo: &RepoName, git_ref: &str, sha: &str)
    -> Result<GitRef, ApiError>;

    async fn compare(&self, repo: &RepoName, base: &str, head: &str) -> Result<Comparison>;

    /// Open pull requests whose head is `head` (a branch of `repo`).
    async fn pull_requests(&self, repo: &RepoName, head: &str) -> Result<Vec<PullRequest>>;

    /// Fails with [`ApiError::Conflict`] if a pull request for `head` already exists.
    async fn create_pull_request(
        &self,
        repo: &RepoName,
        request: &NewPullRequest,
    ) -> Result<PullRequest, ApiError>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
    pub tree_sha: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sha: String,
}

impl TreeEntry {
    /// A regular (non-executable) file.
    pub fn file(path: impl Into<String>, blob_sha: impl Into<String>) -> Self {
        Self { path: path.into(), mode: "100644", kind: "blob", sha: blob_sha.into() }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GitRef {
    /// Fully qualified, e.g. `refs/heads/master`.
    pub name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Comparison {
    pub files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    /// Branch to merge from.
    pub head: String,
    /// Branch to merge into.
    pub base: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub head_ref: String,
    pub html_url: Option<String>,
}

pub mod error;
pub mod host;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use buildrelay_core::{config::GitHubConfig, env, models::RepoName};
pub use error::ApiError;
pub use host::{
    Branch, ChangedFile, Commit, Comparison, GitHost, GitRef, NewPullRequest, PullRequest,
    TreeEntry,
};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

/// [`GitHost`] backed by the GitHub REST API.
#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
}

impl GitHub {
    /// Authenticates with the configured token, or `GITHUB_TOKEN`.
    /// A missing token is an error; anonymous access is never used.
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let token = resolve_token(config, std::env::var(env::GITHUB_TOKEN).ok())?;
        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .context("Failed to create GitHub client")?;
        let profile = client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("Logged in as {}", profile.login);
        Ok(Arc::new(Self { client }))
    }
}

/// The configured token wins over the environment. Blank tokens count as missing.
fn resolve_token(config: &GitHubConfig, env_token: Option<String>) -> Result<String> {
    let Some(token) = config.token.clone().or(env_token) else {
        bail!("No GitHub token configured and {} is unset", env::GITHUB_TOKEN);
    };
    if token.trim().is_empty() {
        bail!("GitHub token is empty");
    }
    Ok(token)
}

fn repo_route(repo: &RepoName, path: &str) -> String {
    format!("/repos/{}/{}/{}", repo.owner, repo.repo, path)
}

/// Percent-encodes every segment of a slash-separated path, keeping the slashes.
fn encode_path(path: &str) -> String {
    path.split('/').map(|segment| urlencoding::encode(segment)).collect::<Vec<_>>().join("/")
}

#[derive(Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Deserialize)]
struct BranchResponse {
    name: String,
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    sha: String,
    commit: BranchCommitDetail,
}

#[derive(Deserialize)]
struct BranchCommitDetail {
    tree: ShaObject,
}

#[derive(Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Serialize)]
struct ContentParams<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
}

#[derive(Deserialize)]
struct RepoCommitResponse {
    sha: String,
    html_url: Option<String>,
    commit: RepoCommitDetail,
}

#[derive(Deserialize)]
struct RepoCommitDetail {
    message: String,
}

#[derive(Serialize)]
struct CreateBlob {
    content: String,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTree<'a> {
    base_tree: &'a str,
    tree: &'a [TreeEntry],
}

#[derive(Serialize)]
struct CreateCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
}

#[derive(Serialize)]
struct CreateRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Serialize)]
struct UpdateRef<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Deserialize)]
struct RefResponse {
    #[serde(rename = "ref")]
    name: String,
    object: ShaObject,
}

impl From<RefResponse> for GitRef {
    fn from(value: RefResponse) -> Self { Self { name: value.name, sha: value.object.sha } }
}

#[derive(Deserialize)]
struct CompareResponse {
    #[serde(default)]
    files: Vec<ChangedFile>,
}

#[derive(Serialize)]
struct ListPulls<'a> {
    state: &'static str,
    head: &'a str,
}

#[derive(Deserialize)]
struct PullResponse {
    number: u64,
    title: String,
    html_url: Option<String>,
    head: PullHead,
}

#[derive(Deserialize)]
struct PullHead {
    #[serde(rename = "ref")]
    ref_field: String,
}

impl From<PullResponse> for PullRequest {
    fn from(value: PullResponse) -> Self {
        Self {
            number: value.number,
            title: value.title,
            head_ref: value.head.ref_field,
            html_url: value.html_url,
        }
    }
}

/// Decodes file contents as returned by the contents API: base64 wrapped at 60 columns.
fn decode_content(content: &str) -> Result<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact).context("Failed to decode file content")
}

#[async_trait]
impl GitHost for GitHub {
    async fn branch(&self, repo: &RepoName, branch: &str) -> Result<Branch> {
        let response: BranchResponse = self
            .client
            .get(repo_route(repo, &format!("branches/{}", urlencoding::encode(branch))), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch branch {branch} of {repo}"))?;
        Ok(Branch {
            name: response.name,
            commit_sha: response.commit.sha,
            tree_sha: response.commit.commit.tree.sha,
        })
    }

    async fn file_content(&self, repo: &RepoName, path: &str, git_ref: &str) -> Result<Vec<u8>> {
        let route = repo_route(repo, &format!("contents/{}", encode_path(path)));
        let response: ContentResponse = self
            .client
            .get(route, Some(&ContentParams { git_ref }))
            .await
            .with_context(|| format!("Failed to fetch {path} from {repo}@{git_ref}"))?;
        match (response.encoding.as_deref(), response.content) {
            (Some("base64"), Some(content)) => decode_content(&content),
            (encoding, _) => bail!(
                "Unsupported content encoding {} for {path} in {repo}",
                encoding.unwrap_or("[none]")
            ),
        }
    }

    async fn commit(&self, repo: &RepoName, sha: &str) -> Result<Commit> {
        let response: RepoCommitResponse = self
            .client
            .get(repo_route(repo, &format!("commits/{sha}")), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch commit {sha} of {repo}"))?;
        Ok(Commit {
            sha: response.sha,
            message: response.commit.message,
            html_url: response.html_url,
        })
    }

    async fn create_blob(&self, repo: &RepoName, content: &[u8]) -> Result<String> {
        let body = CreateBlob { content: STANDARD.encode(content), encoding: "base64" };
        let response: ShaObject = self
            .client
            .post(repo_route(repo, "git/blobs"), Some(&body))
            .await
            .with_context(|| format!("Failed to create blob in {repo}"))?;
        tracing::debug!(sha = %response.sha, "created blob");
        Ok(response.sha)
    }

    async fn create_tree(
        &self,
        repo: &RepoName,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        let body = CreateTree { base_tree, tree: entries };
        let response: ShaObject = self
            .client
            .post(repo_route(repo, "git/trees"), Some(&body))
            .await
            .with_context(|| format!("Failed to create tree in {repo}"))?;
        tracing::debug!(sha = %response.sha, "created tree");
        Ok(response.sha)
    }

    async fn create_commit(
        &self,
        repo: &RepoName,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> Result<Commit> {
        let body = CreateCommit { message, tree, parents: [parent] };
        let commit: Commit = self
            .client
            .post(repo_route(repo, "git/commits"), Some(&body))
            .await
            .with_context(|| format!("Failed to create commit in {repo}"))?;
        tracing::debug!(sha = %commit.sha, "created commit");
        Ok(commit)
    }

    async fn create_ref(
        &self,
        repo: &RepoName,
        git_ref: &str,
        sha: &str,
    ) -> Result<GitRef, ApiError> {
        let body = CreateRef { name: format!("refs/{git_ref}"), sha: sha.to_string() };
        let response: RefResponse = self
            .client
            .post(repo_route(repo, "git/refs"), Some(&body))
            .await
            .map_err(|e| ApiError::from_octocrab(e, "Failed to create ref"))?;
        tracing::debug!(git_ref = %response.name, "created ref");
        Ok(response.into())
    }

    async fn update_ref(
        &self,
        repo: &RepoName,
        git_ref: &str,
        sha: &str,
    ) -> Result<GitRef, ApiError> {
        let body = UpdateRef { sha, force: false };
        let response: RefResponse = self
            .client
            .patch(repo_route(repo, &format!("git/refs/{}", encode_path(git_ref))), Some(&body))
            .await
            .map_err(|e| ApiError::from_octocrab(e, "Failed to update ref"))?;
        tracing::debug!(git_ref = %response.name, "updated ref");
        Ok(response.into())
    }

    async fn compare(&self, repo: &RepoName, base: &str, head: &str) -> Result<Comparison> {
        let response: CompareResponse = self
            .client
            .get(repo_route(repo, &format!("compare/{base}...{head}")), None::<&()>)
            .await
            .with_context(|| format!("Failed to compare {base}...{head} in {repo}"))?;
        Ok(Comparison { files: response.files })
    }

    async fn pull_requests(&self, repo: &RepoName, head: &str) -> Result<Vec<PullRequest>> {
        let head = format!("{}:{}", repo.owner, head);
        let response: Vec<PullResponse> = self
            .client
            .get(repo_route(repo, "pulls"), Some(&ListPulls { state: "open", head: &head }))
            .await
            .with_context(|| format!("Failed to list pull requests for {head}"))?;
        Ok(response.into_iter().map(PullRequest::from).collect())
    }

    async fn create_pull_request(
        &self,
        repo: &RepoName,
        request: &NewPullRequest,
    ) -> Result<PullRequest, ApiError> {
        let response: PullResponse = self
            .client
            .post(repo_route(repo, "pulls"), Some(request))
            .await
            .map_err(|e| ApiError::from_octocrab(e, "Failed to create pull request"))?;
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_content() {
        let cases: &[(&str, &[u8])] = &[
            ("aW1hZ2U6IGFwcDo8JT0gdGFnICU+Cg==", b"image: app:<%= tag %>\n"),
            ("aW1hZ2U6IGFw\ncDo8JT0gdGFn\nICU+Cg==\n", b"image: app:<%= tag %>\n"),
            ("", b""),
        ];
        for &(input, expected) in cases {
            assert_eq!(decode_content(input).unwrap(), expected, "{input:?}");
        }
        assert!(decode_content("not base64!").is_err());
    }

    #[test]
    fn test_repo_route() {
        let repo = RepoName::new("org", "config");
        assert_eq!(repo_route(&repo, "git/refs"), "/repos/org/config/git/refs");
    }

    #[test]
    fn test_resolve_token() {
        let cases: &[(Option<&str>, Option<&str>, Result<&str, &str>)] = &[
            (Some("ghp_config"), None, Ok("ghp_config")),
            (None, Some("ghp_env"), Ok("ghp_env")),
            (Some("ghp_config"), Some("ghp_env"), Ok("ghp_config")),
            (None, None, Err("No GitHub token configured and GITHUB_TOKEN is unset")),
            (Some("  "), None, Err("GitHub token is empty")),
            (None, Some(""), Err("GitHub token is empty")),
        ];
        for &(configured, env_token, expected) in cases {
            let config = GitHubConfig { token: configured.map(str::to_string) };
            let result = resolve_token(&config, env_token.map(str::to_string));
            match expected {
                Ok(token) => assert_eq!(result.unwrap(), token),
                Err(message) => assert_eq!(result.unwrap_err().to_string(), message),
            }
        }
    }

    #[test]
    fn test_encode_path() {
        let cases: &[(&str, &str)] = &[
            ("k8s/app.yaml", "k8s/app.yaml"),
            ("heads/gitops-abc123-deploy-app", "heads/gitops-abc123-deploy-app"),
            ("deploy/my app.yaml", "deploy/my%20app.yaml"),
            ("k8s/#1?.yaml", "k8s/%231%3F.yaml"),
        ];
        for &(path, expected) in cases {
            assert_eq!(encode_path(path), expected, "{path}");
        }
    }

    #[test]
    fn test_request_bodies() {
        let tree = [TreeEntry::file("k8s/app.yaml", "b10b")];
        let body = serde_json::to_value(CreateTree { base_tree: "7ree", tree: &tree }).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "base_tree": "7ree",
                "tree": [{"path": "k8s/app.yaml", "mode": "100644", "type": "blob", "sha": "b10b"}]
            })
        );

        let body = serde_json::to_value(CreateRef {
            name: "refs/heads/gitops-abc123-app".to_string(),
            sha: "c0ffee".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"ref": "refs/heads/gitops-abc123-app", "sha": "c0ffee"}));
    }

    #[test]
    fn test_parse_responses() {
        let branch: BranchResponse = serde_json::from_value(serde_json::json!({
            "name": "master",
            "commit": {"sha": "c0ffee", "commit": {"message": "m", "tree": {"sha": "7ree"}}}
        }))
        .unwrap();
        assert_eq!(branch.commit.commit.tree.sha, "7ree");

        let pull: PullRequest = serde_json::from_value::<PullResponse>(serde_json::json!({
            "number": 42,
            "title": "Update tag to abc123",
            "html_url": "https://github.com/org/config/pull/42",
            "head": {"ref": "gitops-abc123-app", "sha": "c0ffee"}
        }))
        .unwrap()
        .into();
        assert_eq!(pull.number, 42);
        assert_eq!(pull.head_ref, "gitops-abc123-app");

        let compare: CompareResponse =
            serde_json::from_value(serde_json::json!({"status": "identical"})).unwrap();
        assert!(compare.files.is_empty());
    }
}

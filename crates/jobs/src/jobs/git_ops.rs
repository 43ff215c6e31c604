use std::{fmt, sync::Arc};

use anyhow::{Context, Result, bail};
use buildrelay_core::{
    config::{GitOpsJobConfig, GitOpsMode},
    models::{BuildEvent, DEFAULT_BRANCH, RepoName},
};
use buildrelay_github::{
    ApiError, Branch, Commit, GitHost, NewPullRequest, PullRequest, TreeEntry,
};
use tracing::Instrument;

use crate::template;

/// Keeps a deployment file in a config repository pointed at the latest build of a source
/// repository.
///
/// Every mutating step is safe to repeat: the branch name is derived from the build, an
/// unchanged rendering is skipped, and "already exists" responses resolve to a skip.
pub struct GitOps {
    config: GitOpsJobConfig,
    source_repo: RepoName,
    config_repo: RepoName,
    github: Arc<dyn GitHost>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Skipped(SkipReason),
    PullRequestCreated(PullRequest),
    CommitLanded(Commit),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SkipReason {
    /// The build is for another repository or branch.
    NoMatch,
    /// The rendered file is identical to the one on the default branch.
    NoChanges,
    /// The pull request exists, or the default branch already carries the rendered file.
    AlreadyExists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoMatch => "build does not match",
            Self::NoChanges => "no changes",
            Self::AlreadyExists => "already exists",
        })
    }
}

impl GitOps {
    pub fn new(config: GitOpsJobConfig, github: Arc<dyn GitHost>) -> Result<Self> {
        let source_repo = config.source_repo.parse().context("Invalid sourceRepo")?;
        let config_repo = config.config_repo.parse().context("Invalid configRepo")?;
        Ok(Self { config, source_repo, config_repo, github })
    }

    pub fn name(&self) -> &str { &self.config.name }

    /// Whether the build is a default branch build of the source repository, reported by
    /// either trigger mechanism.
    pub fn matches(&self, event: &BuildEvent) -> bool {
        event.is_default_branch()
            && event.repo_name().is_some_and(|id| self.source_repo.matches_source_id(id))
    }

    pub async fn run(&self, event: &BuildEvent) -> Result<Outcome> {
        let span = tracing::info_span!(
            "git_ops",
            name = %self.config.name,
            build = event.id().unwrap_or_default()
        );
        async {
            let outcome = self.reconcile(event).await?;
            match &outcome {
                Outcome::Skipped(reason) => tracing::info!("Skipping: {reason}"),
                Outcome::PullRequestCreated(pr) => tracing::info!(
                    number = pr.number,
                    url = pr.html_url.as_deref().unwrap_or_default(),
                    "Created pull request"
                ),
                Outcome::CommitLanded(commit) => {
                    tracing::info!(sha = %commit.sha, "Committed to {DEFAULT_BRANCH}")
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self, event: &BuildEvent) -> Result<Outcome> {
        if !self.matches(event) {
            return Ok(Outcome::Skipped(SkipReason::NoMatch));
        }
        let Some(sha) = event.commit_sha() else {
            bail!("Build of {} has no COMMIT_SHA", self.source_repo);
        };

        let change = self.prepare(sha).await?;
        if self.is_unchanged(&change).await? {
            return Ok(Outcome::Skipped(SkipReason::NoChanges));
        }

        match self.config.mode {
            GitOpsMode::PullRequest => self.open_pull_request(sha, &change).await,
            GitOpsMode::Commit => self.land_commit(sha, change).await,
        }
    }

    /// Whether the prepared commit leaves the tree of its parent as it is.
    async fn is_unchanged(&self, change: &Change) -> Result<bool> {
        let comparison = self
            .github
            .compare(&self.config_repo, &change.base.commit_sha, &change.commit.sha)
            .await?;
        tracing::debug!(files = comparison.files.len(), "Compared rendered commit");
        Ok(comparison.files.is_empty())
    }

    /// Renders the template and records the result as a commit on top of the default branch,
    /// not yet reachable from any ref.
    async fn prepare(&self, sha: &str) -> Result<Change> {
        let repo = &self.config_repo;
        let base = self.github.branch(repo, DEFAULT_BRANCH).await?;

        let source = self
            .github
            .file_content(repo, &self.config.template_path, &base.commit_sha)
            .await?;
        let source = String::from_utf8(source)
            .with_context(|| format!("Template {} is not valid UTF-8", self.config.template_path))?;
        let rendered = template::render(&self.config.template_path, &source, sha)?;

        let blob = self.github.create_blob(repo, rendered.as_bytes()).await?;
        let tree = self
            .github
            .create_tree(repo, &base.tree_sha, &[TreeEntry::file(&self.config.output_path, blob)])
            .await?;

        let source_commit = self.github.commit(&self.source_repo, sha).await?;
        let description = Description::new(&self.source_repo, sha, &source_commit.message);
        let commit = self
            .github
            .create_commit(repo, &description.commit_message(), &tree, &base.commit_sha)
            .await?;
        Ok(Change { base, commit, description })
    }

    async fn open_pull_request(&self, sha: &str, change: &Change) -> Result<Outcome> {
        let repo = &self.config_repo;
        let branch = branch_name(&self.config.name, sha);
        match self.github.create_ref(repo, &format!("heads/{branch}"), &change.commit.sha).await {
            Ok(git_ref) => tracing::debug!(git_ref = %git_ref.name, "Created branch"),
            // An earlier delivery of this build got as far as the branch
            Err(e @ ApiError::Conflict { .. }) => {
                tracing::info!("Branch {branch} exists, reusing it: {e}")
            }
            Err(ApiError::Other(e)) => return Err(e),
        }

        let request = NewPullRequest {
            title: change.description.title.clone(),
            body: change.description.body.clone(),
            head: branch.clone(),
            base: DEFAULT_BRANCH.to_string(),
        };
        match self.github.create_pull_request(repo, &request).await {
            Ok(pr) => Ok(Outcome::PullRequestCreated(pr)),
            Err(e @ ApiError::Conflict { .. }) => {
                match self.github.pull_requests(repo, &branch).await {
                    Ok(existing) => {
                        for pr in existing {
                            tracing::info!(number = pr.number, "Pull request exists: {e}");
                        }
                    }
                    Err(lookup) => {
                        tracing::warn!("Failed to look up existing pull request: {lookup:#}")
                    }
                }
                Ok(Outcome::Skipped(SkipReason::AlreadyExists))
            }
            Err(ApiError::Other(e)) => Err(e),
        }
    }

    /// Fast-forwards the default branch to the prepared commit. When the branch moved in the
    /// meantime, the change is prepared again on its new head, once.
    async fn land_commit(&self, sha: &str, change: Change) -> Result<Outcome> {
        if self.fast_forward(&change).await? {
            return Ok(Outcome::CommitLanded(change.commit));
        }

        let change = self.prepare(sha).await?;
        if self.is_unchanged(&change).await? {
            // The new head already carries the rendered file
            return Ok(Outcome::Skipped(SkipReason::AlreadyExists));
        }
        if self.fast_forward(&change).await? {
            return Ok(Outcome::CommitLanded(change.commit));
        }
        bail!("{DEFAULT_BRANCH} of {} kept moving, tag {sha} was not committed", self.config_repo)
    }

    /// `false` when the default branch is no longer the parent of the prepared commit.
    async fn fast_forward(&self, change: &Change) -> Result<bool> {
        let git_ref = format!("heads/{DEFAULT_BRANCH}");
        match self.github.update_ref(&self.config_repo, &git_ref, &change.commit.sha).await {
            Ok(_) => Ok(true),
            Err(e @ ApiError::Conflict { .. }) => {
                tracing::info!("{DEFAULT_BRANCH} was not updated: {e}");
                Ok(false)
            }
            Err(ApiError::Other(e)) => Err(e),
        }
    }
}

/// Values derived once per run, each from the previous.
struct Change {
    base: Branch,
    commit: Commit,
    description: Description,
}

/// Title and body shared by the commit and the pull request.
#[derive(Debug, Eq, PartialEq)]
struct Description {
    title: String,
    body: String,
}

impl Description {
    fn new(source_repo: &RepoName, sha: &str, source_message: &str) -> Self {
        Self {
            title: format!("Update tag to {sha}"),
            body: format!("{}\n\n{}\n", quote(source_message), source_repo.commit_url(sha)),
        }
    }

    fn commit_message(&self) -> String { format!("{}\n\n{}\n", self.title, self.body) }
}

fn quote(message: &str) -> String {
    message
        .lines()
        .map(|line| if line.is_empty() { ">".to_string() } else { format!("> {line}") })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Branch a pull request for `sha` is opened from. Stable across redeliveries.
pub fn branch_name(job_name: &str, sha: &str) -> String {
    format!("gitops-{}-{}", sha, job_name.replace('/', "-"))
}

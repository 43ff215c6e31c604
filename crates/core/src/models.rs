use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The only branch builds are acted on for, in both the source and the config repository.
///
/// Other branches and other hosting providers are not supported.
pub const DEFAULT_BRANCH: &str = "master";
pub const GITHUB_URL: &str = "https://github.com";

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_FAILURE: &str = "FAILURE";

/// A message from the Cloud Build notification topic.
///
/// Every field is optional; absent or `null` values resolve to empty defaults. Fields this
/// type does not model are kept in `extra` so the event re-serializes to the original payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_url: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    source: BuildSource,
    #[serde(default, deserialize_with = "nullable")]
    substitutions: BTreeMap<String, String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildSource {
    /// Only set by the legacy (mirrored repository) trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_source: Option<RepoSource>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepoSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_name: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl BuildEvent {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to parse build event")
    }

    pub fn id(&self) -> Option<&str> { self.id.as_deref() }

    pub fn project_id(&self) -> Option<&str> { self.project_id.as_deref() }

    /// Build status as reported by the provider (`QUEUED`, `WORKING`, `SUCCESS`, ...).
    /// Unknown values are passed through; an absent status is empty.
    pub fn status(&self) -> &str { self.status.as_deref().unwrap_or_default() }

    pub fn branch(&self) -> Option<&str> { self.substitution("BRANCH_NAME") }

    /// Identity of the triggering repository.
    ///
    /// The app-based trigger sets `substitutions.REPO_NAME` to the bare repository name.
    /// The legacy trigger identifies a mirrored repository as `github_<owner>_<repo>`,
    /// lower-cased, in `source.repoSource.repoName` (and usually `REPO_NAME` as well).
    pub fn repo_name(&self) -> Option<&str> {
        self.substitution("REPO_NAME").or_else(|| {
            self.source.repo_source.as_ref().and_then(|source| source.repo_name.as_deref())
        })
    }

    pub fn commit_sha(&self) -> Option<&str> { self.substitution("COMMIT_SHA") }

    pub fn log_url(&self) -> Option<&str> { self.log_url.as_deref() }

    pub fn tags(&self) -> &[String] { &self.tags }

    pub fn is_default_branch(&self) -> bool { self.branch() == Some(DEFAULT_BRANCH) }

    pub fn is_success(&self) -> bool { self.status() == STATUS_SUCCESS }

    /// Whether the build was triggered from a repository, by either trigger mechanism.
    pub fn has_repo_source(&self) -> bool {
        self.source.repo_source.is_some() || self.substitution("REPO_NAME").is_some()
    }

    /// Display form of the triggering repository: `owner/repo` for legacy identities,
    /// the bare name for app-based ones.
    pub fn github_repo(&self) -> Option<String> {
        self.repo_name().map(|name| match name.strip_prefix("github_") {
            Some(rest) => rest.replace('_', "/"),
            None => name.to_string(),
        })
    }

    fn substitution(&self, key: &str) -> Option<&str> {
        self.substitutions.get(key).map(String::as_str)
    }
}

/// An `owner/repo` pair.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoName {
    pub owner: String,
    pub repo: String,
}

impl RepoName {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self { owner: owner.into(), repo: repo.into() }
    }

    /// Identity the legacy trigger reports for this repository.
    /// Mirrored repository names are lower-cased (`Foo/Bar` becomes `github_foo_bar`).
    pub fn legacy_source_id(&self) -> String {
        format!("github_{}_{}", self.owner, self.repo).to_lowercase()
    }

    /// Identity the app-based trigger reports: the repository name only.
    pub fn app_source_id(&self) -> &str { &self.repo }

    pub fn matches_source_id(&self, id: &str) -> bool {
        id == self.legacy_source_id() || id == self.app_source_id()
    }

    pub fn commit_url(&self, sha: &str) -> String {
        format!("{GITHUB_URL}/{}/{}/commit/{}", self.owner, self.repo, sha)
    }
}

impl FromStr for RepoName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Ok(Self::new(owner, repo))
            }
            _ => bail!("Expected owner/repo, got {s:?}"),
        }
    }
}

impl TryFrom<String> for RepoName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> { value.parse() }
}

impl From<RepoName> for String {
    fn from(value: RepoName) -> Self { value.to_string() }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

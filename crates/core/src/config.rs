use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::RepoName;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub log_format: LogFormat,
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn has_git_ops_jobs(&self) -> bool {
        self.jobs.iter().any(|job| matches!(job, JobConfig::GitOps(_)))
    }

    fn validate(&self) -> Result<()> {
        for job in &self.jobs {
            if let JobConfig::GitOps(job) = job {
                job.source_repo
                    .parse::<RepoName>()
                    .with_context(|| format!("Job {}: invalid sourceRepo", job.name))?;
                job.config_repo
                    .parse::<RepoName>()
                    .with_context(|| format!("Job {}: invalid configRepo", job.name))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One Cloud Logging compatible JSON object per line.
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PubSubConfig {
    pub project_id: String,
    pub topic: String,
    pub subscription: String,
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    /// Bearer token for the hosted service. Ignored when talking to the emulator.
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_max_outstanding() -> usize { 8 }

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Falls back to `GITHUB_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SlackConfig {
    /// Falls back to `SLACK_WEBHOOK_URL`.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobConfig {
    GitOps(GitOpsJobConfig),
    Slack(SlackJobConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsJobConfig {
    pub name: String,
    /// `owner/repo` of the repository whose builds trigger this job.
    pub source_repo: String,
    /// `owner/repo` of the repository the rendered file is written to.
    pub config_repo: String,
    pub template_path: String,
    pub output_path: String,
    #[serde(default)]
    pub mode: GitOpsMode,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitOpsMode {
    #[default]
    PullRequest,
    Commit,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SlackJobConfig {
    /// Statuses to notify on. Defaults to every in-flight and terminal status.
    #[serde(default)]
    pub only: Option<Vec<String>>,
    /// Status to user/group mention, e.g. `FAILURE: "!subteam^SAZ94GDB8"`.
    #[serde(default)]
    pub mention: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
pubsub:
  project_id: my-project
  topic: cloud-builds
  subscription: buildrelay
jobs:
  - type: git_ops
    name: deploy/app
    sourceRepo: Org/App
    configRepo: org/config
    templatePath: k8s/app.yaml.erb
    outputPath: k8s/app.yaml
  - type: git_ops
    name: direct
    sourceRepo: org/app
    configRepo: org/config
    templatePath: t.erb
    outputPath: out
    mode: commit
  - type: slack
    only: [SUCCESS, FAILURE]
    mention:
      FAILURE: "!subteam^SAZ94GDB8"
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::from_reader(CONFIG.as_bytes()).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.pubsub.max_outstanding, 8);
        assert!(config.pubsub.access_token.is_none());
        assert_eq!(config.jobs.len(), 3);
        assert!(config.has_git_ops_jobs());

        let JobConfig::GitOps(job) = &config.jobs[0] else { panic!("expected git_ops job") };
        assert_eq!(job.name, "deploy/app");
        assert_eq!(job.source_repo, "Org/App");
        assert_eq!(job.mode, GitOpsMode::PullRequest);

        let JobConfig::GitOps(job) = &config.jobs[1] else { panic!("expected git_ops job") };
        assert_eq!(job.mode, GitOpsMode::Commit);

        let JobConfig::Slack(job) = &config.jobs[2] else { panic!("expected slack job") };
        assert_eq!(job.only.as_deref(), Some(&["SUCCESS".to_string(), "FAILURE".to_string()][..]));
        assert_eq!(job.mention.get("FAILURE").map(String::as_str), Some("!subteam^SAZ94GDB8"));
    }

    #[test]
    fn rejects_malformed_repo() {
        let config = CONFIG.replace("sourceRepo: Org/App", "sourceRepo: just-a-name");
        let err = Config::from_reader(config.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid sourceRepo"));
    }

    #[test]
    fn slack_only_config_has_no_git_ops() {
        let config = Config::from_reader(
            "pubsub: {project_id: p, topic: t, subscription: s}\njobs: [{type: slack}]\n".as_bytes(),
        )
        .unwrap();
        assert!(!config.has_git_ops_jobs());
    }
}

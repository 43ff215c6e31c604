mod jobs;
pub mod template;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use buildrelay_core::{
    config::{Config, JobConfig},
    env,
    models::BuildEvent,
};
use buildrelay_github::GitHost;
use buildrelay_pubsub::{Message, MessageHandler};
pub use jobs::{
    git_ops::{GitOps, Outcome, SkipReason, branch_name},
    slack::Slack,
};

/// A configured reaction to build events.
pub enum Job {
    GitOps(GitOps),
    Slack(Slack),
}

impl Job {
    pub fn name(&self) -> &str {
        match self {
            Job::GitOps(job) => job.name(),
            Job::Slack(_) => "slack",
        }
    }

    pub async fn run(&self, event: &BuildEvent) -> Result<()> {
        match self {
            Job::GitOps(job) => job.run(event).await.map(|_| ()),
            Job::Slack(job) => job.run(event).await,
        }
    }
}

/// Dispatches every delivered build event to all configured jobs.
pub struct Worker {
    jobs: Vec<Job>,
}

impl Worker {
    pub fn new(jobs: Vec<Job>) -> Self { Self { jobs } }

    /// Builds the jobs listed in the configuration, in order.
    ///
    /// `github` is required when any `git_ops` job is configured.
    pub fn from_config(
        config: &Config,
        github: Option<Arc<dyn GitHost>>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let mut jobs = Vec::with_capacity(config.jobs.len());
        for job in &config.jobs {
            match job {
                JobConfig::GitOps(job) => {
                    let github = github.clone().context("git_ops jobs require a GitHub client")?;
                    let name = job.name.clone();
                    jobs.push(Job::GitOps(
                        GitOps::new(job.clone(), github)
                            .with_context(|| format!("Invalid git_ops job {name}"))?,
                    ));
                }
                JobConfig::Slack(job) => {
                    let webhook_url = match &config.slack.webhook_url {
                        Some(url) => url.clone(),
                        None => std::env::var(env::SLACK_WEBHOOK_URL).with_context(|| {
                            let var = env::SLACK_WEBHOOK_URL;
                            format!("slack jobs require slack.webhook_url or {var}")
                        })?,
                    };
                    jobs.push(Job::Slack(Slack::new(job, webhook_url, http.clone())));
                }
            }
        }
        Ok(Self::new(jobs))
    }

    pub fn jobs(&self) -> &[Job] { &self.jobs }

    /// Runs every job, even after one fails. The first failure is returned once all have run.
    pub async fn process(&self, event: &BuildEvent) -> Result<()> {
        let mut first_error = None;
        for job in &self.jobs {
            let Err(e) = job.run(event).await else { continue };
            let e = e.context(format!("Job {} failed", job.name()));
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                tracing::error!("{e:#}");
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageHandler for Worker {
    async fn process_message(&self, message: &Message) -> Result<()> {
        let event = BuildEvent::from_slice(&message.data)?;
        tracing::info!(
            build = event.id().unwrap_or_default(),
            status = event.status(),
            repo = event.repo_name().unwrap_or_default(),
            branch = event.branch().unwrap_or_default(),
            "Received build event"
        );
        self.process(&event).await
    }
}

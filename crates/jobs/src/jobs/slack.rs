use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use buildrelay_core::{
    config::SlackJobConfig,
    models::{BuildEvent, GITHUB_URL, STATUS_FAILURE, STATUS_SUCCESS},
};
use serde_json::{Value, json};

const DEFAULT_STATUSES: [&str; 4] = ["QUEUED", "WORKING", STATUS_SUCCESS, STATUS_FAILURE];

/// Posts build status changes to a Slack incoming webhook.
pub struct Slack {
    only: Vec<String>,
    mention: BTreeMap<String, String>,
    webhook_url: String,
    http: reqwest::Client,
}

impl Slack {
    pub fn new(config: &SlackJobConfig, webhook_url: String, http: reqwest::Client) -> Self {
        let only = config
            .only
            .clone()
            .unwrap_or_else(|| DEFAULT_STATUSES.iter().map(|s| s.to_string()).collect());
        Self { only, mention: config.mention.clone(), webhook_url, http }
    }

    /// Only repository builds are reported; manual and storage-sourced builds are not.
    pub fn should_notify(&self, event: &BuildEvent) -> bool {
        event.has_repo_source() && self.only.iter().any(|status| status == event.status())
    }

    pub async fn run(&self, event: &BuildEvent) -> Result<()> {
        if !self.should_notify(event) {
            tracing::info!(status = event.status(), "Skipping notification");
            return Ok(());
        }
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&self.message(event))
            .send()
            .await
            .context("Failed to post to Slack")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Slack returned {status}: {body}");
        }
        tracing::info!(status = event.status(), "Sent to Slack");
        Ok(())
    }

    /// Block Kit payload: a header, repository and tag fields, and links to the build and
    /// the commit.
    fn message(&self, event: &BuildEvent) -> Value {
        let status = event.status();
        let repo = event.github_repo().unwrap_or_default();

        let mut fields = vec![
            json!({"type": "mrkdwn", "text": format!("*Repository:*\n{repo}")}),
            json!({"type": "mrkdwn", "text": format!("*Tags:*\n{}", event.tags().join(", "))}),
        ];
        // "@U024BE7LH" for a user, "!subteam^SAZ94GDB8" for a group
        if let Some(target) = self.mention.get(status) {
            fields.push(json!({"type": "mrkdwn", "text": format!("<{target}>")}));
        }

        let commit_url =
            format!("{GITHUB_URL}/{repo}/commit/{}", event.commit_sha().unwrap_or_default());
        let style = match status {
            STATUS_SUCCESS => Some("primary"),
            STATUS_FAILURE => Some("danger"),
            _ => None,
        };
        json!({
            "blocks": [
                {
                    "type": "header",
                    "text": {"type": "plain_text", "text": format!("Build {status}")}
                },
                {"type": "section", "fields": fields},
                {
                    "type": "actions",
                    "elements": [
                        button("View build", event.log_url(), style),
                        button("View commit", Some(&commit_url), style),
                    ]
                }
            ]
        })
    }
}

fn button(text: &str, url: Option<&str>, style: Option<&str>) -> Value {
    let mut button = json!({"type": "button", "text": {"type": "plain_text", "text": text}});
    if let Some(url) = url {
        button["url"] = url.into();
    }
    if let Some(style) = style {
        button["style"] = style.into();
    }
    button
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slack(only: Option<&[&str]>, mention: &[(&str, &str)]) -> Slack {
        let config = SlackJobConfig {
            only: only.map(|only| only.iter().map(|s| s.to_string()).collect()),
            mention: mention.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };
        Slack::new(&config, "https://hooks.slack.invalid/T000/B000".to_string(), reqwest::Client::new())
    }

    fn event(status: &str) -> BuildEvent {
        serde_json::from_value(json!({
            "status": status,
            "source": {"repoSource": {"repoName": "github_org_myrepo"}},
            "substitutions": {
                "BRANCH_NAME": "master",
                "COMMIT_SHA": "abc123",
                "REPO_NAME": "github_org_myrepo"
            },
            "logUrl": "https://console.cloud.google.com/cloud-build/builds/8d1b7d0e",
            "tags": ["deploy", "app"]
        }))
        .unwrap()
    }

    #[test]
    fn test_should_notify() {
        let default = slack(None, &[]);
        let terminal = slack(Some(&["SUCCESS", "FAILURE"]), &[]);
        let cases: &[(&str, bool, bool)] = &[
            ("QUEUED", true, false),
            ("WORKING", true, false),
            ("SUCCESS", true, true),
            ("FAILURE", true, true),
            ("CANCELLED", false, false),
            ("", false, false),
        ];
        for &(status, by_default, by_terminal) in cases {
            assert_eq!(default.should_notify(&event(status)), by_default, "{status}");
            assert_eq!(terminal.should_notify(&event(status)), by_terminal, "{status}");
        }

        let manual: BuildEvent =
            serde_json::from_value(json!({"status": "SUCCESS", "source": {"storageSource": {}}}))
                .unwrap();
        assert!(!default.should_notify(&manual));
    }

    #[test]
    fn test_message() {
        let slack = slack(None, &[("FAILURE", "!subteam^SAZ94GDB8")]);
        let message = slack.message(&event("SUCCESS"));
        assert_eq!(
            message,
            json!({
                "blocks": [
                    {"type": "header", "text": {"type": "plain_text", "text": "Build SUCCESS"}},
                    {"type": "section", "fields": [
                        {"type": "mrkdwn", "text": "*Repository:*\norg/myrepo"},
                        {"type": "mrkdwn", "text": "*Tags:*\ndeploy, app"}
                    ]},
                    {"type": "actions", "elements": [
                        {
                            "type": "button",
                            "text": {"type": "plain_text", "text": "View build"},
                            "url": "https://console.cloud.google.com/cloud-build/builds/8d1b7d0e",
                            "style": "primary"
                        },
                        {
                            "type": "button",
                            "text": {"type": "plain_text", "text": "View commit"},
                            "url": "https://github.com/org/myrepo/commit/abc123",
                            "style": "primary"
                        }
                    ]}
                ]
            })
        );
    }

    #[test]
    fn test_message_mention_and_style() {
        let slack = slack(None, &[("FAILURE", "!subteam^SAZ94GDB8")]);

        let failure = slack.message(&event("FAILURE"));
        let fields = failure["blocks"][1]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2]["text"], "<!subteam^SAZ94GDB8>");
        assert_eq!(failure["blocks"][2]["elements"][0]["style"], "danger");

        let working = slack.message(&event("WORKING"));
        assert_eq!(working["blocks"][1]["fields"].as_array().unwrap().len(), 2);
        for button in working["blocks"][2]["elements"].as_array().unwrap() {
            assert!(button.get("style").is_none());
        }
    }
}

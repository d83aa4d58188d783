use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Serialize;

use crate::pipeline::build::Build;
use crate::pipeline::stage::RunStatus;

use super::StageSummary;

static SLACK_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("slack http client")
});

#[derive(Debug, Serialize)]
pub struct Message {
    pub channel: String,
    pub username: String,
    pub text: String,
    pub icon_emoji: String,
    pub mrkdwn: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// One attachment per stage, coloured by outcome.
#[derive(Debug, Serialize)]
pub struct Attachment {
    pub color: String,
    pub title: String,
    pub text: String,
}

pub fn build_message(
    pipeline_name: &str,
    build: &Build,
    stages: &[StageSummary],
    metadata: &BTreeMap<String, String>,
) -> Message {
    let headline = match build.status {
        RunStatus::Success => ":tada: *BUILD SUCCESS*",
        _ => ":cry: *BUILD FAILED*",
    };
    let text = format!(
        "*GANTRY* _Status_\n{} - Build #{}\n{}",
        pipeline_name, build.number, headline
    );

    let attachments = stages.iter().map(stage_attachment).collect();

    Message {
        channel: metadata.get("channel").cloned().unwrap_or_default(),
        username: metadata.get("username").cloned().unwrap_or_else(|| "gantry".into()),
        text,
        icon_emoji: ":ship:".into(),
        mrkdwn: true,
        attachments,
    }
}

fn stage_attachment(stage: &StageSummary) -> Attachment {
    let (color, text) = match stage.status {
        RunStatus::Success => ("good", ":white_check_mark: SUCCESS"),
        RunStatus::Fail => ("danger", ":x: FAILED"),
        _ => ("warning", ":warning: PENDING"),
    };
    Attachment {
        color: color.into(),
        title: stage.name.clone(),
        text: text.into(),
    }
}

/// POST the build summary to the configured incoming-webhook URL.
pub async fn post(
    pipeline_name: &str,
    build: &Build,
    stages: &[StageSummary],
    metadata: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let url = metadata
        .get("url")
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow::anyhow!("slack notifier has no url"))?;

    let message = build_message(pipeline_name, build, stages, metadata);
    let response = SLACK_CLIENT.post(url).json(&message).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("slack returned {status}: {body}");
    }

    tracing::info!(pipeline = %pipeline_name, build = build.number, "slack notification sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(status: RunStatus) -> Build {
        Build {
            id: "b".into(),
            number: 12,
            status,
            commit: "abc".into(),
            branch: "main".into(),
            author: "alice".into(),
            event: "push".into(),
            clone_url: String::new(),
            created_ns: 0,
            started_ns: 0,
            finished_ns: 0,
            current_stage: 2,
        }
    }

    fn summaries() -> Vec<StageSummary> {
        vec![
            StageSummary {
                name: "test".into(),
                status: RunStatus::Success,
            },
            StageSummary {
                name: "publish".into(),
                status: RunStatus::Fail,
            },
            StageSummary {
                name: "rollout".into(),
                status: RunStatus::Pending,
            },
        ]
    }

    #[test]
    fn success_headline() {
        let msg = build_message("acme/web", &build(RunStatus::Success), &[], &BTreeMap::new());
        assert!(msg.text.contains("BUILD SUCCESS"));
        assert!(msg.text.contains("acme/web - Build #12"));
    }

    #[test]
    fn failure_headline() {
        let msg = build_message("acme/web", &build(RunStatus::Fail), &[], &BTreeMap::new());
        assert!(msg.text.contains("BUILD FAILED"));
    }

    #[test]
    fn one_attachment_per_stage_coloured_by_outcome() {
        let msg = build_message(
            "acme/web",
            &build(RunStatus::Fail),
            &summaries(),
            &BTreeMap::new(),
        );
        assert_eq!(msg.attachments.len(), 3);
        assert_eq!(msg.attachments[0].color, "good");
        assert_eq!(msg.attachments[0].title, "test");
        assert_eq!(msg.attachments[1].color, "danger");
        assert_eq!(msg.attachments[2].color, "warning");
    }

    #[test]
    fn metadata_fills_channel_and_username() {
        let metadata = BTreeMap::from([
            ("channel".to_owned(), "#builds".to_owned()),
            ("username".to_owned(), "ci-bot".to_owned()),
        ]);
        let msg = build_message("acme/web", &build(RunStatus::Success), &[], &metadata);
        assert_eq!(msg.channel, "#builds");
        assert_eq!(msg.username, "ci-bot");
    }
}

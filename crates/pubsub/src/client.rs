use std::{collections::BTreeMap, future::Future};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use buildrelay_core::{config::PubSubConfig, env};
use reqwest::{Method, StatusCode};
use serde::{
    Deserialize, Serialize,
    de::{DeserializeOwned, IgnoredAny},
};

use crate::{LEASE_SECONDS, Message, MessageSource, ReceivedMessage};

const PUBSUB_URL: &str = "https://pubsub.googleapis.com/v1";

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("{kind} {name} does not exist")]
    NotFound { kind: &'static str, name: String },
    #[error("Pub/Sub returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Client for the Pub/Sub v1 REST API, or a local emulator speaking the same protocol.
#[derive(Clone)]
pub struct PubSubClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    access_token: Option<String>,
    emulator: bool,
}

impl PubSubClient {
    /// Targets the emulator at `PUBSUB_EMULATOR_HOST` when set, the hosted service otherwise.
    pub fn new(config: &PubSubConfig) -> Result<Self> {
        let emulator_host =
            std::env::var(env::PUBSUB_EMULATOR_HOST).ok().filter(|host| !host.is_empty());
        Self::with_emulator_host(config, emulator_host.as_deref())
    }

    fn with_emulator_host(config: &PubSubConfig, emulator_host: Option<&str>) -> Result<Self> {
        let (base_url, access_token) = match emulator_host {
            Some(host) => {
                tracing::info!("Using Pub/Sub emulator at {host}");
                (format!("http://{host}/v1"), None)
            }
            None => {
                let Some(token) = config.access_token.clone() else {
                    let emulator = env::PUBSUB_EMULATOR_HOST;
                    bail!("pubsub.access_token is required unless {emulator} is set");
                };
                (PUBSUB_URL.to_string(), Some(token))
            }
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("buildrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url,
            project_id: config.project_id.clone(),
            access_token,
            emulator: emulator_host.is_some(),
        })
    }

    pub fn is_emulator(&self) -> bool { self.emulator }

    fn topic_name(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, topic)
    }

    fn subscription_name(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, subscription)
    }

    async fn request<B, T>(
        &self,
        method: Method,
        name: &str,
        body: Option<&B>,
    ) -> Result<T, PubSubError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.request(method, format!("{}/{}", self.base_url, name));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PubSubError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    /// Checks that the topic exists. Under the emulator, a missing topic is created.
    pub async fn topic(&self, topic: &str) -> Result<(), PubSubError> {
        let name = self.topic_name(topic);
        let get = self.request::<(), Resource>(Method::GET, &name, None).await;
        let body = serde_json::json!({});
        let created = get_or_create("Topic", &name, self.emulator, get, || async {
            self.request::<_, Resource>(Method::PUT, &name, Some(&body)).await
        })
        .await?;
        if created {
            tracing::info!("Created topic {name}");
        }
        Ok(())
    }

    /// Checks that the subscription exists. Under the emulator, a missing subscription is
    /// created on `topic`.
    pub async fn subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<PubSubSubscription, PubSubError> {
        let name = self.subscription_name(subscription);
        let get = self.request::<(), Resource>(Method::GET, &name, None).await;
        let body = CreateSubscription {
            topic: self.topic_name(topic),
            ack_deadline_seconds: LEASE_SECONDS,
        };
        let created = get_or_create("Subscription", &name, self.emulator, get, || async {
            self.request::<_, Resource>(Method::PUT, &name, Some(&body)).await
        })
        .await?;
        if created {
            tracing::info!("Created subscription {name}");
        }
        Ok(PubSubSubscription { client: self.clone(), name })
    }

    /// Publishes one message and returns its id.
    pub async fn publish(
        &self,
        topic: &str,
        data: &[u8],
        attributes: BTreeMap<String, String>,
    ) -> Result<String, PubSubError> {
        let body = PublishRequest {
            messages: vec![OutgoingMessage { data: STANDARD.encode(data), attributes }],
        };
        let name = format!("{}:publish", self.topic_name(topic));
        let response: PublishResponse = self.request(Method::POST, &name, Some(&body)).await?;
        Ok(response.message_ids.into_iter().next().unwrap_or_default())
    }
}

/// Resolves a lookup that may have found nothing. Only emulator resources are created; a
/// missing resource on the hosted service is a configuration error.
async fn get_or_create<F, Fut>(
    kind: &'static str,
    name: &str,
    emulator: bool,
    get: Result<Resource, PubSubError>,
    create: F,
) -> Result<bool, PubSubError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Resource, PubSubError>>,
{
    match get {
        Ok(_) => Ok(false),
        Err(PubSubError::Status { status: StatusCode::NOT_FOUND, .. }) if emulator => {
            match create().await {
                Ok(_) => Ok(true),
                // Created concurrently by another process
                Err(PubSubError::Status { status: StatusCode::CONFLICT, .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(PubSubError::Status { status: StatusCode::NOT_FOUND, .. }) => {
            Err(PubSubError::NotFound { kind, name: name.to_string() })
        }
        Err(e) => Err(e),
    }
}

/// A subscription checked to exist; pulls and acknowledges over REST.
#[derive(Clone)]
pub struct PubSubSubscription {
    client: PubSubClient,
    name: String,
}

impl PubSubSubscription {
    pub fn name(&self) -> &str { &self.name }
}

#[async_trait]
impl MessageSource for PubSubSubscription {
    async fn pull(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let body = PullRequest { max_messages: max };
        let response: PullResponse = self
            .client
            .request(Method::POST, &format!("{}:pull", self.name), Some(&body))
            .await
            .with_context(|| format!("Failed to pull from {}", self.name))?;
        let (messages, rejected) = decode_batch(response.received_messages);
        // Redelivery would fail the same way
        if !rejected.is_empty()
            && let Err(e) = self.acknowledge(&rejected).await
        {
            tracing::warn!("{e:#}");
        }
        Ok(messages)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<()> {
        let body = AcknowledgeRequest { ack_ids };
        self.client
            .request::<_, serde_json::Value>(
                Method::POST,
                &format!("{}:acknowledge", self.name),
                Some(&body),
            )
            .await
            .with_context(|| format!("Failed to acknowledge on {}", self.name))?;
        Ok(())
    }

    async fn modify_ack_deadline(&self, ack_ids: &[String], seconds: u32) -> Result<()> {
        let body = ModifyAckDeadlineRequest { ack_ids, ack_deadline_seconds: seconds };
        self.client
            .request::<_, serde_json::Value>(
                Method::POST,
                &format!("{}:modifyAckDeadline", self.name),
                Some(&body),
            )
            .await
            .with_context(|| format!("Failed to extend ack deadline on {}", self.name))?;
        Ok(())
    }
}

/// Splits a pulled batch into decoded messages and the ack ids of messages whose data is
/// not valid base64. The latter are logged with their raw data.
fn decode_batch(received: Vec<WireReceivedMessage>) -> (Vec<ReceivedMessage>, Vec<String>) {
    let mut messages = Vec::with_capacity(received.len());
    let mut rejected = Vec::new();
    for WireReceivedMessage { ack_id, message } in received {
        let WireMessage { message_id, data, attributes, publish_time } = message;
        match STANDARD.decode(&data) {
            Ok(data) => messages.push(ReceivedMessage {
                ack_id,
                message: Message { id: message_id, data, attributes, publish_time },
            }),
            Err(e) => {
                tracing::warn!(
                    message_id = %message_id,
                    data = %data,
                    "Dropping message with undecodable data: {e}"
                );
                rejected.push(ack_id);
            }
        }
    }
    (messages, rejected)
}

/// Topic or subscription metadata; only its presence matters.
type Resource = IgnoredAny;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscription {
    topic: String,
    ack_deadline_seconds: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    publish_time: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u32,
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<OutgoingMessage>,
}

#[derive(Serialize)]
struct OutgoingMessage {
    data: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;

    fn config(access_token: Option<&str>) -> PubSubConfig {
        PubSubConfig {
            project_id: "my-project".to_string(),
            topic: "cloud-builds".to_string(),
            subscription: "buildrelay".to_string(),
            max_outstanding: 8,
            access_token: access_token.map(str::to_string),
        }
    }

    fn status(status: StatusCode) -> PubSubError {
        PubSubError::Status { status, body: String::new() }
    }

    fn resource() -> Resource { IgnoredAny }

    #[test]
    fn test_endpoints() {
        let client = PubSubClient::with_emulator_host(&config(None), Some("localhost:8085")).unwrap();
        assert!(client.is_emulator());
        assert_eq!(client.base_url, "http://localhost:8085/v1");
        assert!(client.access_token.is_none());
        assert_eq!(client.topic_name("cloud-builds"), "projects/my-project/topics/cloud-builds");
        assert_eq!(
            client.subscription_name("buildrelay"),
            "projects/my-project/subscriptions/buildrelay"
        );

        let client = PubSubClient::with_emulator_host(&config(Some("t0ken")), None).unwrap();
        assert!(!client.is_emulator());
        assert_eq!(client.base_url, PUBSUB_URL);
        assert_eq!(client.access_token.as_deref(), Some("t0ken"));

        assert!(PubSubClient::with_emulator_host(&config(None), None).is_err());
    }

    #[tokio::test]
    async fn test_emulator_creates_missing_resource() {
        let created = AtomicBool::new(false);
        let result = get_or_create("Topic", "t", true, Err(status(StatusCode::NOT_FOUND)), || async {
            created.store(true, Ordering::SeqCst);
            Ok::<_, PubSubError>(resource())
        })
        .await;
        assert!(result.unwrap());
        assert!(created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_existing_resource_is_not_created() {
        for emulator in [true, false] {
            let created = AtomicBool::new(false);
            let result = get_or_create("Topic", "t", emulator, Ok(resource()), || async {
                created.store(true, Ordering::SeqCst);
                Ok::<_, PubSubError>(resource())
            })
            .await;
            assert!(!result.unwrap());
            assert!(!created.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn test_hosted_missing_resource_fails_fast() {
        let created = AtomicBool::new(false);
        let result = get_or_create(
            "Subscription",
            "projects/p/subscriptions/s",
            false,
            Err(status(StatusCode::NOT_FOUND)),
            || async {
                created.store(true, Ordering::SeqCst);
                Ok::<_, PubSubError>(resource())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, PubSubError::NotFound { kind: "Subscription", .. }));
        assert_eq!(err.to_string(), "Subscription projects/p/subscriptions/s does not exist");
        assert!(!created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let cases = [(true, StatusCode::FORBIDDEN), (false, StatusCode::UNAUTHORIZED)];
        for (emulator, code) in cases {
            let result = get_or_create("Topic", "t", emulator, Err(status(code)), || async {
                Ok::<_, PubSubError>(resource())
            })
            .await;
            assert!(matches!(result, Err(PubSubError::Status { status, .. }) if status == code));
        }
        let result = get_or_create("Topic", "t", true, Err(status(StatusCode::NOT_FOUND)), || async {
            Err::<Resource, _>(status(StatusCode::CONFLICT))
        })
        .await;
        assert!(!result.unwrap());
    }

    #[test]
    fn test_decode_pull_response() {
        let response: PullResponse = serde_json::from_value(json!({
            "receivedMessages": [{
                "ackId": "ack-1",
                "message": {
                    "data": STANDARD.encode(br#"{"status":"SUCCESS"}"#),
                    "attributes": {"buildId": "8d1b7d0e", "status": "SUCCESS"},
                    "messageId": "4242",
                    "publishTime": "2024-05-01T12:00:00.000Z"
                }
            }]
        }))
        .unwrap();
        let (messages, rejected) = decode_batch(response.received_messages);
        assert!(rejected.is_empty());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ack_id, "ack-1");
        assert_eq!(messages[0].message.id, "4242");
        assert_eq!(messages[0].message.data, br#"{"status":"SUCCESS"}"#);
        assert_eq!(messages[0].message.attributes["buildId"], "8d1b7d0e");

        let empty: PullResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.received_messages.is_empty());
    }

    #[test]
    fn test_undecodable_message_does_not_fail_batch() {
        let response: PullResponse = serde_json::from_value(json!({
            "receivedMessages": [
                {"ackId": "good", "message": {"messageId": "1", "data": STANDARD.encode("{}")}},
                {"ackId": "bad", "message": {"messageId": "2", "data": "%%%"}},
                {"ackId": "also-good", "message": {"messageId": "3", "data": STANDARD.encode("[]")}}
            ]
        }))
        .unwrap();
        let (messages, rejected) = decode_batch(response.received_messages);
        assert_eq!(rejected, ["bad"]);
        let decoded: Vec<_> =
            messages.iter().map(|m| (m.ack_id.as_str(), m.message.data.as_slice())).collect();
        assert_eq!(decoded, [("good", b"{}".as_slice()), ("also-good", b"[]".as_slice())]);
    }

    #[test]
    fn test_request_bodies() {
        let ids = ["a".to_string(), "b".to_string()];
        assert_eq!(
            serde_json::to_value(AcknowledgeRequest { ack_ids: &ids }).unwrap(),
            json!({"ackIds": ["a", "b"]})
        );
        assert_eq!(
            serde_json::to_value(ModifyAckDeadlineRequest { ack_ids: &ids, ack_deadline_seconds: 30 })
                .unwrap(),
            json!({"ackIds": ["a", "b"], "ackDeadlineSeconds": 30})
        );
        assert_eq!(
            serde_json::to_value(CreateSubscription {
                topic: "projects/p/topics/t".to_string(),
                ack_deadline_seconds: LEASE_SECONDS,
            })
            .unwrap(),
            json!({"topic": "projects/p/topics/t", "ackDeadlineSeconds": LEASE_SECONDS})
        );
        assert_eq!(
            serde_json::to_value(PullRequest { max_messages: 8 }).unwrap(),
            json!({"maxMessages": 8})
        );
        assert_eq!(
            serde_json::to_value(OutgoingMessage { data: "e30=".to_string(), attributes: BTreeMap::new() })
                .unwrap(),
            json!({"data": "e30="})
        );
    }
}

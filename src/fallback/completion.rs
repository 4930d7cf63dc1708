use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::realtime::JARVIS_INSTRUCTIONS;
use crate::{Error, Result};

/// Shown (and spoken) when a turn fails.
pub const FALLBACK_MESSAGE: &str = "An error occurred while processing your request.";

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Reply to one [`Completion::request`].
#[derive(Debug)]
pub struct CompletionReply {
    pub turn: u64,
    pub result: Result<String>,
}

/// Non-realtime request/response text completion.
pub trait Completion {
    /// Start a request; the reply arrives later tagged with `turn`.
    fn request(&mut self, turn: u64, prompt: String);
}

/// Where text completions come from.
#[derive(Debug, Clone)]
pub enum CompletionBackend {
    /// `POST {prompt}` to a service answering `{response}`.
    Endpoint { url: String },
    /// Chat completions called directly with the assistant persona.
    OpenAi { api_key: String, model: String },
}

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// [`Completion`] over reqwest.
pub struct CompletionClient {
    http: reqwest::Client,
    backend: CompletionBackend,
    replies: mpsc::Sender<CompletionReply>,
}

impl CompletionClient {
    pub fn new(backend: CompletionBackend, replies: mpsc::Sender<CompletionReply>) -> Self {
        Self {
            http: reqwest::Client::new(),
            backend,
            replies,
        }
    }
}

impl Completion for CompletionClient {
    fn request(&mut self, turn: u64, prompt: String) {
        let http = self.http.clone();
        let backend = self.backend.clone();
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let result = complete(&http, &backend, &prompt).await;
            if let Err(ref e) = result {
                log::error!("[completion] turn {} failed: {}", turn, e);
            }
            let _ = replies.send(CompletionReply { turn, result }).await;
        });
    }
}

async fn complete(http: &reqwest::Client, backend: &CompletionBackend, prompt: &str) -> Result<String> {
    match backend {
        CompletionBackend::Endpoint { url } => {
            let resp = http.post(url).json(&PromptRequest { prompt }).send().await?;
            let status = resp.status();
            let body: PromptResponse = resp.json().await?;
            if !status.is_success() {
                return Err(Error::Transport(format!(
                    "completion endpoint returned {}: {}",
                    status,
                    body.error.unwrap_or_default()
                )));
            }
            body.response
                .ok_or_else(|| Error::Protocol("completion reply has no response".into()))
        }
        CompletionBackend::OpenAi { api_key, model } => {
            let resp = http
                .post(OPENAI_CHAT_URL)
                .bearer_auth(api_key)
                .json(&json!({
                    "model": model,
                    "messages": [
                        { "role": "system", "content": JARVIS_INSTRUCTIONS },
                        { "role": "user", "content": prompt },
                    ],
                }))
                .send()
                .await?
                .error_for_status()?;
            let body: ChatResponse = resp.json().await?;
            body.choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| Error::Protocol("chat completion has no content".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP request with `status` and `body`; returns the request text.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/openai", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = String::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
                if let Some(head_end) = request.find("\r\n\r\n") {
                    let length = request[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (url, handle)
    }

    #[tokio::test]
    async fn endpoint_reply_is_delivered_with_turn() {
        let (url, server) = serve_once("200 OK", r#"{"response":"Good evening."}"#).await;
        let (tx, mut rx) = mpsc::channel(4);
        let mut client = CompletionClient::new(CompletionBackend::Endpoint { url }, tx);
        client.request(7, "hello".into());

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.turn, 7);
        assert_eq!(reply.result.unwrap(), "Good evening.");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/openai"));
        assert!(request.ends_with(r#"{"prompt":"hello"}"#));
    }

    #[tokio::test]
    async fn endpoint_error_status_fails_the_turn() {
        let (url, _server) = serve_once(
            "500 Internal Server Error",
            r#"{"error":"An error occurred while processing your request."}"#,
        )
        .await;
        let (tx, mut rx) = mpsc::channel(4);
        let mut client = CompletionClient::new(CompletionBackend::Endpoint { url }, tx);
        client.request(1, "hello".into());
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply.result, Err(Error::Transport(_))));
    }
}

//! Websocket connection helpers shared by the realtime client and the
//! streaming recognizers.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use crate::{Error, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) const RECONNECT_BASE_MS: u64 = 800;
pub(crate) const RECONNECT_MAX_MS: u64 = 30_000;

pub(crate) fn reconnect_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << exp;
    (RECONNECT_BASE_MS.saturating_mul(factor)).min(RECONNECT_MAX_MS)
}

pub(crate) fn is_permanent_connect_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 401 || code == 403
        }
        _ => {
            let text = err.to_string();
            text.contains("401") || text.contains("403")
        }
    }
}

pub(crate) fn build_ws_request(
    url: &str,
    headers: &[(String, String)],
) -> Result<tungstenite::http::Request<()>> {
    let uri: tungstenite::http::Uri = url
        .parse()
        .map_err(|e| Error::Config(format!("invalid websocket url '{}': {}", url, e)))?;
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| Error::Config(format!("websocket url '{}' has no host", url)))?;

    let mut request = tungstenite::http::Request::builder()
        .uri(uri)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        );

    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    request
        .body(())
        .map_err(|e| Error::Config(format!("failed to build request: {}", e)))
}

/// Open a websocket, retrying transient failures with exponential backoff.
///
/// Each attempt is bounded by `timeout`. Authentication failures are not
/// retried.
pub(crate) async fn connect_with_retry(
    tag: &str,
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
    attempts: u32,
) -> Result<WsStream> {
    let attempts = attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let request = build_ws_request(url, headers)?;
        let failure = match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok((stream, _))) => {
                log::info!("[{}] websocket connected", tag);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                if is_permanent_connect_error(&e) {
                    return Err(Error::Transport(format!("authentication failed: {}", e)));
                }
                e.to_string()
            }
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };
        if attempt >= attempts {
            return Err(Error::Transport(format!(
                "connection failed after {} attempts: {}",
                attempt, failure
            )));
        }
        let delay_ms = reconnect_delay_ms(attempt);
        log::warn!(
            "[{}] connection failed (attempt {}), retrying in {}ms: {}",
            tag,
            attempt,
            delay_ms,
            failure
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(reconnect_delay_ms(1), 800);
        assert_eq!(reconnect_delay_ms(2), 1600);
        assert_eq!(reconnect_delay_ms(3), 3200);
        assert_eq!(reconnect_delay_ms(7), RECONNECT_MAX_MS);
        assert_eq!(reconnect_delay_ms(40), RECONNECT_MAX_MS);
    }

    #[test]
    fn request_carries_host_and_custom_headers() {
        let req = build_ws_request(
            "wss://api.openai.com/v1/realtime?model=m",
            &[("Authorization".into(), "Bearer k".into())],
        )
        .unwrap();
        assert_eq!(req.headers()["Host"], "api.openai.com");
        assert_eq!(req.headers()["Authorization"], "Bearer k");
        assert_eq!(req.uri().query(), Some("model=m"));

        let local = build_ws_request("ws://127.0.0.1:9001/x", &[]).unwrap();
        assert_eq!(local.headers()["Host"], "127.0.0.1:9001");
    }

    #[test]
    fn request_rejects_url_without_host() {
        assert!(matches!(
            build_ws_request("/relative", &[]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_gives_up_after_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = format!("ws://127.0.0.1:{}/", port);
        let err = connect_with_retry("test", &url, &[], Duration::from_secs(2), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}

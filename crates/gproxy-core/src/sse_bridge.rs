//! Response SSE Bridge: relays a provider's streamed body to the client with
//! heartbeats, a terminal sentinel, and a mid-stream error event framed the
//! same way regardless of which provider dialect produced the stream.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

pub const SSE_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";
pub const SSE_CACHE_CONTROL: &str = "no-cache, no-transform";
pub const SSE_CONNECTION: &str = "keep-alive";

#[derive(Debug, Clone, Copy)]
pub struct SseBridgeConfig {
    /// 0 disables heartbeats.
    pub heartbeat: Duration,
}

impl Default for SseBridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
        }
    }
}

/// Frames one upstream event as `event: <name>\ndata: <payload>\n\n`, or
/// `data: <payload>\n\n` when unnamed.
pub fn frame_event(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn heartbeat_frame(unix_ms: u128) -> Bytes {
    Bytes::from(format!(": heartbeat {unix_ms}\n\n"))
}

pub fn terminal_sentinel_frames() -> [Bytes; 2] {
    [
        frame_event(Some("response.done"), r#"{"type":"response.done"}"#),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ]
}

pub fn error_event_frame(error_kind: &str, message: &str) -> Bytes {
    let payload = serde_json::json!({
        "type": "response.error",
        "error": { "kind": error_kind, "message": message },
    })
    .to_string();
    frame_event(Some("response.error"), &payload)
}

/// Relays `upstream` to a bounded channel, interleaving heartbeats and
/// always ending in the terminal sentinel (preceded by an error event frame
/// on a mid-stream failure). Dropping the returned receiver tears the
/// upstream relay task down on the next heartbeat tick or upstream chunk.
pub fn bridge(
    config: SseBridgeConfig,
    mut upstream: mpsc::Receiver<Bytes>,
    upstream_failed: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let heartbeat_enabled = !config.heartbeat.is_zero();
        let mut ticker = heartbeat_enabled.then(|| {
            let mut t = tokio::time::interval(config.heartbeat);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });

        loop {
            let tick = async {
                match &mut ticker {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                maybe_chunk = upstream.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                _ = tick => {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis();
                    if tx.send(heartbeat_frame(now)).await.is_err() {
                        return;
                    }
                }
            }
        }

        if upstream_failed.load(std::sync::atomic::Ordering::SeqCst)
            && tx
                .send(error_event_frame("upstream_error", "upstream stream ended with an error"))
                .await
                .is_err()
        {
            return;
        }

        for frame in terminal_sentinel_frames() {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_event_includes_event_name() {
        let frame = frame_event(Some("response.done"), "{}");
        assert_eq!(frame, Bytes::from_static(b"event: response.done\ndata: {}\n\n"));
    }

    #[test]
    fn frame_event_without_name_omits_event_line() {
        let frame = frame_event(None, "{}");
        assert_eq!(frame, Bytes::from_static(b"data: {}\n\n"));
    }

    #[test]
    fn terminal_sentinel_ends_with_done_marker() {
        let frames = terminal_sentinel_frames();
        assert!(frames[1].as_ref().ends_with(b"[DONE]\n\n"));
    }

    #[tokio::test]
    async fn bridge_relays_chunks_then_emits_sentinel() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        tx.send(Bytes::from_static(b"event: x\ndata: y\n\n"))
            .await
            .unwrap();
        drop(tx);

        let failed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut out = bridge(
            SseBridgeConfig {
                heartbeat: Duration::ZERO,
            },
            rx,
            failed,
        );

        let first = out.recv().await.unwrap();
        assert_eq!(first, Bytes::from_static(b"event: x\ndata: y\n\n"));
        let sentinel_event = out.recv().await.unwrap();
        assert!(sentinel_event.as_ref().starts_with(b"event: response.done"));
        let done = out.recv().await.unwrap();
        assert!(done.as_ref().ends_with(b"[DONE]\n\n"));
    }

    #[tokio::test]
    async fn bridge_emits_error_event_before_sentinel_on_upstream_failure() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        drop(tx);

        let failed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let mut out = bridge(
            SseBridgeConfig {
                heartbeat: Duration::ZERO,
            },
            rx,
            failed,
        );

        let error_frame = out.recv().await.unwrap();
        assert!(error_frame.as_ref().starts_with(b"event: response.error"));
        let sentinel_event = out.recv().await.unwrap();
        assert!(sentinel_event.as_ref().starts_with(b"event: response.done"));
    }
}

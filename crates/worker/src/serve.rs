//! Request loop

use crate::responder::Responder;
use anyhow::{Context, Result};
use modelpool_proto::{CompletionMetadata, GenerateRequest, WorkerEvent};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Pause before each streamed word
    pub chunk_delay: Duration,
}

/// Answer requests until the input closes. Returns the number of
/// requests answered.
pub async fn serve<R, W>(
    reader: R,
    mut writer: W,
    responder: &Responder,
    options: &ServeOptions,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut served = 0;

    while let Some(line) = lines.next_line().await.context("reading request")? {
        if line.trim().is_empty() {
            continue;
        }

        let request: GenerateRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                write_event(
                    &mut writer,
                    &WorkerEvent::Error {
                        request_id: None,
                        message: format!("Parse error: {}", e),
                    },
                )
                .await?;
                continue;
            }
        };

        let started = Instant::now();
        let reply = responder.reply(&request);
        debug!(
            "Answering {:?} with {} tokens",
            request.request_id,
            reply.token_count()
        );

        for word in reply.text.split_inclusive(' ') {
            if !options.chunk_delay.is_zero() {
                tokio::time::sleep(options.chunk_delay).await;
            }
            write_event(
                &mut writer,
                &WorkerEvent::Stream {
                    request_id: request.request_id.clone(),
                    content: word.to_string(),
                },
            )
            .await?;
        }

        let metadata = CompletionMetadata {
            token_count: Some(reply.token_count()),
            response_time_ms: Some(started.elapsed().as_millis() as u64),
            emotional_tone: Some(reply.emotional_tone.clone()),
            confidence: Some(reply.confidence),
        };
        write_event(
            &mut writer,
            &WorkerEvent::Complete {
                request_id: request.request_id,
                content: Some(reply.text),
                metadata,
            },
        )
        .await?;
        served += 1;
    }

    info!("Input closed after {} requests", served);
    Ok(served)
}

async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &WorkerEvent) -> Result<()> {
    let line = event.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await.context("writing event")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelpool_proto::parse_event;
    use tokio::io::BufReader;

    async fn run(input: &str) -> (u64, Vec<WorkerEvent>) {
        let mut output = Vec::new();
        let served = serve(
            BufReader::new(input.as_bytes()),
            &mut output,
            &Responder::new("u1"),
            &ServeOptions::default(),
        )
        .await
        .unwrap();

        let events = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| parse_event(line).unwrap())
            .collect();
        (served, events)
    }

    #[tokio::test]
    async fn test_streams_words_then_completes() {
        let (served, events) = run("{\"requestId\":\"r1\",\"message\":\"hello\"}\n").await;
        assert_eq!(served, 1);

        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Stream { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();

        match events.last().unwrap() {
            WorkerEvent::Complete {
                request_id,
                content,
                metadata,
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(content.as_deref(), Some(streamed.as_str()));
                assert_eq!(metadata.token_count, Some(streamed.split_whitespace().count() as u32));
                assert_eq!(metadata.emotional_tone.as_deref(), Some("warm"));
            }
            other => panic!("expected complete, got {:?}", other),
        }
        assert!(events.iter().all(|e| e.request_id() == Some("r1")));
    }

    #[tokio::test]
    async fn test_malformed_line_reports_error_and_continues() {
        let input = "not json\n\n{\"message\":\"still here\"}\n";
        let (served, events) = run(input).await;

        assert_eq!(served, 1);
        assert!(matches!(events.first(), Some(WorkerEvent::Error { .. })));
        assert!(matches!(events.last(), Some(WorkerEvent::Complete { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_delay() {
        let options = ServeOptions {
            chunk_delay: Duration::from_millis(250),
        };
        let mut output = Vec::new();
        let started = tokio::time::Instant::now();
        serve(
            BufReader::new("{\"message\":\"hi\"}\n".as_bytes()),
            &mut output,
            &Responder::new("u1"),
            &options,
        )
        .await
        .unwrap();

        // "I hear you. You said: hi." is six words
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }
}

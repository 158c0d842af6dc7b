//! Follower for the relay's `text/event-stream` responses.
//!
//! The framing is line-based: `data:` lines accumulate until a blank line
//! dispatches them under the current event name, `event:` lines rename the
//! next dispatch, and `:` lines are keep-alive comments. The default event
//! name is `message` and is restored after every dispatch.

use std::time::Duration;

use url::Url;

use super::WormholeError;

const DEFAULT_EVENT: &str = "message";
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// One event stream from the relay. Reconnects with capped exponential
/// backoff when the stream dies; deactivate it by dropping it.
pub(crate) struct EventSource {
    http: reqwest::Client,
    url: Url,
    response: reqwest::Response,
    buffer: Vec<u8>,
    parser: EventParser,
}

impl EventSource {
    pub async fn connect(http: reqwest::Client, url: Url) -> Result<EventSource, WormholeError> {
        let response = open(&http, &url).await?;
        Ok(EventSource {
            http,
            url,
            response,
            buffer: Vec::new(),
            parser: EventParser::default(),
        })
    }

    /// The next `(event name, data)` pair from the stream.
    pub async fn next_event(&mut self) -> Result<(String, String), WormholeError> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(event) = self.parser.feed(&line) {
                    return Ok(event);
                }
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(None) => {
                    tracing::debug!("event stream ended, reconnecting");
                    self.reconnect().await;
                },
                Err(err) => {
                    tracing::debug!("event stream failed ({err}), reconnecting");
                    self.reconnect().await;
                },
            }
        }
    }

    /// A partial event from the dead stream is discarded; the relay replays
    /// the channel history on the fresh connection anyway.
    async fn reconnect(&mut self) {
        self.buffer.clear();
        self.parser = EventParser::default();
        let mut delay = INITIAL_BACKOFF;
        loop {
            tokio::time::sleep(delay).await;
            match open(&self.http, &self.url).await {
                Ok(response) => {
                    self.response = response;
                    return;
                },
                Err(err) => {
                    tracing::debug!("event stream reconnect failed ({err}), retrying");
                    delay = (delay * 2).min(MAX_BACKOFF);
                },
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

async fn open(http: &reqwest::Client, url: &Url) -> Result<reqwest::Response, reqwest::Error> {
    http.get(url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()
}

#[derive(Default)]
struct EventParser {
    event: Option<String>,
    data: Vec<String>,
}

impl EventParser {
    fn feed(&mut self, line: &str) -> Option<(String, String)> {
        if line.is_empty() {
            if self.data.is_empty() {
                // Some servers emit a blank line directly after `event:` or
                // `id:` header fields; keep the pending event name so the
                // data block that follows still dispatches under it.
                return None;
            }
            let name = self
                .event
                .take()
                .unwrap_or_else(|| DEFAULT_EVENT.to_owned());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some((name, data));
        }
        if let Some(comment) = line.strip_prefix(": ") {
            tracing::trace!("event stream comment: {comment}");
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        let Some((field, rest)) = line.split_once(':') else {
            tracing::debug!("malformed event stream line: {line:?}");
            return None;
        };
        let value = rest.strip_prefix(' ').unwrap_or(rest);
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event = Some(value.to_owned()),
            other => tracing::debug!("ignoring unknown event stream field {other:?}"),
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(lines: &[&str]) -> Vec<(String, String)> {
        let mut parser = EventParser::default();
        lines
            .iter()
            .filter_map(|line| parser.feed(line))
            .collect()
    }

    #[test]
    fn test_default_event_name() {
        let events = collect(&["data: {\"phase\": \"pake\"}", ""]);
        assert_eq!(
            events,
            vec![("message".to_owned(), "{\"phase\": \"pake\"}".to_owned())]
        );
    }

    #[test]
    fn test_named_event_and_reset() {
        let events = collect(&["event: welcome", "data: {}", "", "data: second", ""]);
        assert_eq!(
            events,
            vec![
                ("welcome".to_owned(), "{}".to_owned()),
                ("message".to_owned(), "second".to_owned()),
            ]
        );
    }

    #[test]
    fn test_multiline_data() {
        let events = collect(&["data: line one", "data: line two", ""]);
        assert_eq!(
            events,
            vec![("message".to_owned(), "line one\nline two".to_owned())]
        );
    }

    #[test]
    fn test_blank_line_after_event_header_keeps_name() {
        // legacy servers terminate the `event:` header with its own blank
        // line before the data block
        let events = collect(&["event: welcome", "", "data: {}", ""]);
        assert_eq!(events, vec![("welcome".to_owned(), "{}".to_owned())]);
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let events = collect(&[": keep-alive", "id: 7", "retry: 500", "data: x", ""]);
        assert_eq!(events, vec![("message".to_owned(), "x".to_owned())]);
    }
}

use serde::Deserialize;

use super::transport::Fragment;

const DONE_MARKER: &str = "[DONE]";

/// Incremental `text/event-stream` decoder.
///
/// Bytes can be pushed in arbitrary pieces; a fragment is produced only once its
/// event is complete (terminated by a blank line, or by end of stream).
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        self.line_buffer.extend_from_slice(chunk);

        while let Some(newline_index) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.line_buffer.drain(..=newline_index).collect::<Vec<_>>();
            line.pop();
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }
            self.process_line(&line, &mut fragments);
        }

        fragments
    }

    /// Flushes a trailing line and any event that never saw its blank line.
    pub fn finish(&mut self) -> Vec<Fragment> {
        let mut fragments = Vec::new();

        if !self.line_buffer.is_empty() {
            let mut line = std::mem::take(&mut self.line_buffer);
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }
            self.process_line(&line, &mut fragments);
        }
        self.dispatch(&mut fragments);

        fragments
    }

    fn process_line(&mut self, line: &[u8], fragments: &mut Vec<Fragment>) {
        if line.is_empty() {
            self.dispatch(fragments);
            return;
        }

        // A complete line never ends inside a UTF-8 sequence, so lossy decoding only
        // touches genuinely invalid bytes.
        let line = String::from_utf8_lossy(line);
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        if field == "data" {
            self.data_lines.push(value.to_string());
        }
    }

    fn dispatch(&mut self, fragments: &mut Vec<Fragment>) {
        if self.data_lines.is_empty() {
            return;
        }

        let data = std::mem::take(&mut self.data_lines).join("\n");
        if let Some(fragment) = decode_event_data(&data) {
            fragments.push(fragment);
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    content: Option<String>,
    error: Option<String>,
}

/// Maps one event's data to a fragment; unknown or empty payloads are skipped.
pub fn decode_event_data(data: &str) -> Option<Fragment> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == DONE_MARKER {
        return Some(Fragment::Done);
    }

    let payload = match serde_json::from_str::<EventPayload>(data) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::debug!(error = %error, "skipping undecodable event payload");
            return None;
        }
    };

    match payload.kind.as_deref() {
        Some("chunk") => non_empty(payload.content.or(payload.text)).map(Fragment::Text),
        Some("done") => Some(Fragment::Done),
        Some("error") => Some(Fragment::Error(
            payload
                .error
                .unwrap_or_else(|| "upstream reported an error".to_string()),
        )),
        Some(other) => {
            tracing::debug!(kind = other, "skipping event payload of unhandled type");
            None
        }
        None => {
            if let Some(message) = payload.error {
                return Some(Fragment::Error(message));
            }
            non_empty(payload.text).map(Fragment::Text)
        }
    }
}

#[derive(Debug, Deserialize)]
struct BufferedReply {
    response: Option<String>,
    text: Option<String>,
    error: Option<String>,
}

/// Decodes a single-shot JSON reply into the same fragments a stream would yield.
///
/// Returns `None` when the body carries neither reply text nor an error.
pub fn decode_buffered_reply(body: &str) -> Result<Option<Vec<Fragment>>, serde_json::Error> {
    let reply = serde_json::from_str::<BufferedReply>(body)?;

    if let Some(message) = reply.error {
        return Ok(Some(vec![Fragment::Error(message)]));
    }

    let Some(text) = reply.response.or(reply.text) else {
        return Ok(None);
    };

    let mut fragments = Vec::with_capacity(2);
    if !text.is_empty() {
        fragments.push(Fragment::Text(text));
    }
    fragments.push(Fragment::Done);
    Ok(Some(fragments))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.is_empty())
}

use crate::config::types::{OutputConfig, OversizePolicy, WireFormat};
use crate::source::event::Event;
use chrono::SecondsFormat;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event metadata alone exceeds the {max} byte datagram limit")]
    TooLarge { max: usize },
}

#[derive(Debug, Clone, Copy, Serialize)]
struct Fragment {
    index: u32,
    count: u32,
}

/// Fragment numbers used while sizing chunks; real numbers never render longer
const PLACEHOLDER_FRAGMENT: Fragment = Fragment {
    index: u32::MAX,
    count: u32::MAX,
};

#[derive(Serialize)]
struct WireDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: &'a str,
    host: &'a str,
    #[serde(rename = "type")]
    log_type: &'a str,
    source: Cow<'a, str>,
    file_id: &'a str,
    offset: u64,
    message: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fragment: Option<Fragment>,
}

/// Datagram payloads produced for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub datagrams: Vec<Vec<u8>>,
    /// The message was shortened to fit a datagram
    pub truncated: bool,
}

impl Encoded {
    pub fn is_split(&self) -> bool {
        self.datagrams.len() > 1
    }
}

/// Turns events into self-contained datagram payloads.
#[derive(Debug, Clone)]
pub struct WireEncoder {
    host: String,
    log_type: String,
    format: WireFormat,
    max_bytes: usize,
    on_oversize: OversizePolicy,
}

impl WireEncoder {
    pub fn new(config: &OutputConfig) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self::with_host(config, host)
    }

    pub fn with_host(config: &OutputConfig, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            log_type: config.log_type.clone(),
            format: config.format,
            max_bytes: config.max_datagram_bytes,
            on_oversize: config.on_oversize,
        }
    }

    pub fn encode(&self, event: &Event) -> Result<Encoded, EncodeError> {
        let meta = Meta::new(event);
        let text = event.text();

        let full = self.render(&meta, &text, event.truncated, None)?;
        if full.len() <= self.max_bytes {
            return Ok(Encoded {
                datagrams: vec![full],
                truncated: false,
            });
        }

        match self.on_oversize {
            OversizePolicy::Truncate => {
                let end = self.fit(&meta, &text, true, None)?;
                Ok(Encoded {
                    datagrams: vec![self.render(&meta, &text[..end], true, None)?],
                    truncated: true,
                })
            }
            OversizePolicy::Split => self.split(&meta, &text, event.truncated),
        }
    }

    fn split(&self, meta: &Meta<'_>, text: &str, truncated: bool) -> Result<Encoded, EncodeError> {
        let mut ranges = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let len = self.fit(meta, &text[start..], truncated, Some(PLACEHOLDER_FRAGMENT))?;
            if len == 0 {
                return Err(EncodeError::TooLarge {
                    max: self.max_bytes,
                });
            }
            ranges.push(start..start + len);
            start += len;
        }
        if ranges.is_empty() {
            return Err(EncodeError::TooLarge {
                max: self.max_bytes,
            });
        }

        let count = ranges.len() as u32;
        let datagrams = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let fragment = Fragment {
                    index: index as u32,
                    count,
                };
                self.render(meta, &text[range], truncated, Some(fragment))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Encoded {
            datagrams,
            truncated: false,
        })
    }

    /// Longest prefix of `text`, on a char boundary, whose rendering fits
    fn fit(
        &self,
        meta: &Meta<'_>,
        text: &str,
        truncated: bool,
        fragment: Option<Fragment>,
    ) -> Result<usize, EncodeError> {
        let mut end = text.len();
        loop {
            end = floor_char_boundary(text, end);
            let rendered = self.render(meta, &text[..end], truncated, fragment)?;
            if rendered.len() <= self.max_bytes {
                return Ok(end);
            }
            if end == 0 {
                return Err(EncodeError::TooLarge {
                    max: self.max_bytes,
                });
            }
            // Every input byte renders as at least one output byte
            end = end.saturating_sub(rendered.len() - self.max_bytes);
        }
    }

    fn render(
        &self,
        meta: &Meta<'_>,
        message: &str,
        truncated: bool,
        fragment: Option<Fragment>,
    ) -> Result<Vec<u8>, EncodeError> {
        let document = WireDocument {
            timestamp: &meta.timestamp,
            host: &self.host,
            log_type: &self.log_type,
            source: meta.source.clone(),
            file_id: &meta.file_id,
            offset: meta.offset,
            message,
            truncated,
            fragment,
        };

        let mut out = match self.format {
            WireFormat::Json => Vec::with_capacity(message.len() + 192),
            WireFormat::Udplogbeat => format!("json:{}:", self.log_type).into_bytes(),
        };
        serde_json::to_writer(&mut out, &document)?;
        Ok(out)
    }
}

/// Per-event fields rendered once and reused across size checks
struct Meta<'a> {
    timestamp: String,
    source: Cow<'a, str>,
    file_id: String,
    offset: u64,
}

impl<'a> Meta<'a> {
    fn new(event: &'a Event) -> Self {
        Self {
            timestamp: event.read_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            source: event.source.to_string_lossy(),
            file_id: event.file_id.to_string(),
            offset: event.offset,
        }
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RetryConfig;
    use crate::source::file_id::FileId;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn output(format: WireFormat, max: usize, on_oversize: OversizePolicy) -> OutputConfig {
        OutputConfig {
            host: "127.0.0.1".to_string(),
            port: 5000,
            format,
            log_type: "app".to_string(),
            max_datagram_bytes: max,
            on_oversize,
            retry: RetryConfig::default(),
        }
    }

    fn event(line: &str) -> Event {
        Event {
            source: PathBuf::from("/var/log/a.log"),
            file_id: FileId::new(8, 42),
            offset: 6,
            read_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            line: line.as_bytes().to_vec(),
            truncated: false,
        }
    }

    fn parse(datagram: &[u8]) -> serde_json::Value {
        serde_json::from_slice(datagram).unwrap()
    }

    #[test]
    fn test_json_document_fields() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Json, 1024, OversizePolicy::Truncate), "web-1");
        let encoded = encoder.encode(&event("world")).unwrap();
        assert_eq!(encoded.datagrams.len(), 1);

        let doc = parse(&encoded.datagrams[0]);
        assert_eq!(doc["@timestamp"], "2024-05-01T12:00:00.000Z");
        assert_eq!(doc["host"], "web-1");
        assert_eq!(doc["type"], "app");
        assert_eq!(doc["source"], "/var/log/a.log");
        assert_eq!(doc["file_id"], "8:42");
        assert_eq!(doc["offset"], 6);
        assert_eq!(doc["message"], "world");
        assert!(doc.get("truncated").is_none());
        assert!(doc.get("fragment").is_none());
    }

    #[test]
    fn test_udplogbeat_framing() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Udplogbeat, 1024, OversizePolicy::Truncate), "h");
        let encoded = encoder.encode(&event("hello")).unwrap();
        let payload = &encoded.datagrams[0];

        let prefix = b"json:app:";
        assert!(payload.starts_with(prefix));
        assert_eq!(parse(&payload[prefix.len()..])["message"], "hello");
    }

    #[test]
    fn test_harvester_truncation_flag_is_carried() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Json, 1024, OversizePolicy::Truncate), "h");
        let mut truncated = event("head");
        truncated.truncated = true;
        let doc = parse(&encoder.encode(&truncated).unwrap().datagrams[0]);
        assert_eq!(doc["truncated"], true);
    }

    #[test]
    fn test_oversize_truncate_fits_limit() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Json, 256, OversizePolicy::Truncate), "h");
        let line = "é".repeat(400);
        let encoded = encoder.encode(&event(&line)).unwrap();

        assert!(encoded.truncated);
        assert_eq!(encoded.datagrams.len(), 1);
        assert!(encoded.datagrams[0].len() <= 256);

        let doc = parse(&encoded.datagrams[0]);
        assert_eq!(doc["truncated"], true);
        let message = doc["message"].as_str().unwrap();
        assert!(!message.is_empty());
        assert!(line.starts_with(message));
    }

    #[test]
    fn test_oversize_split_reassembles() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Udplogbeat, 300, OversizePolicy::Split), "h");
        let line: String = (0..600).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let encoded = encoder.encode(&event(&line)).unwrap();

        assert!(encoded.is_split());
        assert!(!encoded.truncated);

        let count = encoded.datagrams.len();
        let mut rebuilt = String::new();
        for (i, datagram) in encoded.datagrams.iter().enumerate() {
            assert!(datagram.len() <= 300);
            let doc = parse(&datagram[b"json:app:".len()..]);
            assert_eq!(doc["fragment"]["index"], i);
            assert_eq!(doc["fragment"]["count"], count);
            rebuilt.push_str(doc["message"].as_str().unwrap());
        }
        assert_eq!(rebuilt, line);
    }

    #[test]
    fn test_escaped_characters_respect_limit() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Json, 300, OversizePolicy::Split), "h");
        let line = "\u{1}\"\\".repeat(100);
        let encoded = encoder.encode(&event(&line)).unwrap();

        let mut rebuilt = String::new();
        for datagram in &encoded.datagrams {
            assert!(datagram.len() <= 300);
            rebuilt.push_str(parse(datagram)["message"].as_str().unwrap());
        }
        assert_eq!(rebuilt, line);
    }

    #[test]
    fn test_metadata_larger_than_limit() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Json, 128, OversizePolicy::Truncate), "h".repeat(200));
        assert!(matches!(
            encoder.encode(&event("x")),
            Err(EncodeError::TooLarge { max: 128 })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let encoder = WireEncoder::with_host(&output(WireFormat::Json, 1024, OversizePolicy::Truncate), "h");
        let mut bad = event("");
        bad.line = vec![b'o', b'k', 0xff];
        let doc = parse(&encoder.encode(&bad).unwrap().datagrams[0]);
        assert_eq!(doc["message"], "ok\u{fffd}");
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps a topic and an event timestamp to a partition path.
//!
//! Time buckets are described with Joda-style patterns such as `yyyy/MM/dd/HH`.
//! A pattern is compiled once at startup; rendering afterwards is pure and
//! cannot fail.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::errors::PatternError;

pub const DEFAULT_TIME_PATTERN: &str = "yyyy/MM/dd/HH";

/// A compiled time-bucket pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePattern {
    source: String,
    strftime: String,
}

impl TimePattern {
    /// Compiles a Joda-style pattern.
    ///
    /// Supported letters are `y` (year), `M` (month), `d` (day of month),
    /// `D` (day of year), `H` (hour), `m` (minute) and `s` (second). Text between
    /// single quotes is copied verbatim and `''` yields a single quote. Every
    /// other non-letter character is a literal. The result must render as
    /// `/`-separated plain names: no empty, `.` or `..` segments.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let chars: Vec<char> = pattern.chars().collect();
        let mut strftime = String::with_capacity(pattern.len() * 2);
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '\'' {
                if chars.get(i + 1) == Some(&'\'') {
                    strftime.push('\'');
                    i += 2;
                    continue;
                }
                let start = i;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(PatternError::UnterminatedQuote(start)),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            strftime.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&lit) => {
                            push_literal(&mut strftime, lit);
                            i += 1;
                        }
                    }
                }
                continue;
            }

            if !c.is_ascii_alphabetic() {
                push_literal(&mut strftime, c);
                i += 1;
                continue;
            }

            let start = i;
            while i < chars.len() && chars[i] == c {
                i += 1;
            }
            let count = i - start;
            let spec = match (c, count) {
                ('y', 2) => "%y",
                ('y', 1 | 3 | 4) => "%Y",
                ('M', 1) => "%-m",
                ('M', 2) => "%m",
                ('M', 3) => "%b",
                ('M', 4) => "%B",
                ('d', 1) => "%-d",
                ('d', 2) => "%d",
                ('D', 3) => "%j",
                ('H', 1) => "%-H",
                ('H', 2) => "%H",
                ('m', 1) => "%-M",
                ('m', 2) => "%M",
                ('s', 1) => "%-S",
                ('s', 2) => "%S",
                ('y' | 'M' | 'd' | 'D' | 'H' | 'm' | 's', _) => {
                    return Err(PatternError::UnsupportedWidth {
                        letter: c,
                        count,
                        offset: start,
                    })
                }
                _ => {
                    return Err(PatternError::UnsupportedLetter {
                        letter: c,
                        offset: start,
                    })
                }
            };
            strftime.push_str(spec);
        }

        let compiled = Self {
            source: pattern.to_string(),
            strftime,
        };
        compiled.check_segments()?;
        Ok(compiled)
    }

    /// Buckets become directories under the topic, so every rendered segment
    /// must be a plain name.
    fn check_segments(&self) -> Result<(), PatternError> {
        let rendered = self.render(DateTime::<Utc>::UNIX_EPOCH);
        match rendered
            .split('/')
            .find(|segment| matches!(*segment, "" | "." | ".."))
        {
            Some(segment) => Err(PatternError::InvalidSegment(segment.to_string())),
            None => Ok(()),
        }
    }

    /// Renders the time bucket for `time` in UTC.
    #[must_use]
    pub fn render(&self, time: DateTime<Utc>) -> String {
        time.format(&self.strftime).to_string()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

impl Default for TimePattern {
    fn default() -> Self {
        Self {
            source: DEFAULT_TIME_PATTERN.to_string(),
            strftime: "%Y/%m/%d/%H".to_string(),
        }
    }
}

/// `topic/time-bucket`: the registry key and the root of the remote object key.
///
/// Topics may themselves contain `/`, so the topic boundary is kept alongside
/// the joined path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    path: String,
    topic_len: usize,
}

impl PartitionKey {
    pub(crate) fn new(topic: &str, bucket: &str) -> Self {
        Self {
            path: format!("{topic}/{bucket}"),
            topic_len: topic.len(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.path[..self.topic_len]
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl AsRef<str> for PartitionKey {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    pattern: TimePattern,
}

impl PathResolver {
    #[must_use]
    pub fn new(pattern: TimePattern) -> Self {
        Self { pattern }
    }

    #[must_use]
    pub fn resolve(&self, topic: &str, time: DateTime<Utc>) -> PartitionKey {
        PartitionKey::new(topic, &self.pattern.render(time))
    }

    #[must_use]
    pub fn pattern(&self) -> &TimePattern {
        &self.pattern
    }
}

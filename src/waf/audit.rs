//! Audit records for scan decisions.
//!
//! Every decision is rendered through a user supplied template made of
//! literal text and `{{.Field}}` placeholders, then written to each configured
//! sink. There is deliberately no expression language: only the named fields
//! below can be substituted.

use super::plugin::RequestDescriptor;
use crate::error::{Result, WafError};
use chrono::{DateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use tracing::{error, info};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*\.([A-Za-z]+)\s*\}\}").unwrap();
}

/// Audited outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    Pass,
    Blocked,
    Dryrun,
}

impl ScanResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Blocked => "blocked",
            Self::Dryrun => "dryrun",
        }
    }

    /// Whether the request may go through.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Blocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditField {
    Date,
    Timestamp,
    Url,
    UrlHostname,
    UrlPath,
    Method,
    Remoteaddr,
    Scanresult,
}

impl AuditField {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Date" => Some(Self::Date),
            "Timestamp" => Some(Self::Timestamp),
            "Url" => Some(Self::Url),
            "UrlHostname" => Some(Self::UrlHostname),
            "UrlPath" => Some(Self::UrlPath),
            "Method" => Some(Self::Method),
            "Remoteaddr" => Some(Self::Remoteaddr),
            "Scanresult" => Some(Self::Scanresult),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(AuditField),
}

/// Field values of one audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub date: String,
    pub timestamp: String,
    pub url: String,
    pub url_hostname: String,
    pub url_path: String,
    pub method: String,
    pub remote_addr: String,
    pub scan_result: ScanResult,
}

impl AuditRecord {
    pub fn new(request: &RequestDescriptor, result: ScanResult, now: DateTime<Utc>) -> Self {
        Self {
            date: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            timestamp: now.timestamp().to_string(),
            url: request.url.to_string(),
            url_hostname: request.url_host(),
            url_path: request.url.path().to_string(),
            method: request.method.clone(),
            remote_addr: request.remote_addr.clone(),
            scan_result: result,
        }
    }

    fn field(&self, field: AuditField) -> &str {
        match field {
            AuditField::Date => &self.date,
            AuditField::Timestamp => &self.timestamp,
            AuditField::Url => &self.url,
            AuditField::UrlHostname => &self.url_hostname,
            AuditField::UrlPath => &self.url_path,
            AuditField::Method => &self.method,
            AuditField::Remoteaddr => &self.remote_addr,
            AuditField::Scanresult => self.scan_result.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditTemplate {
    segments: Vec<Segment>,
}

impl AuditTemplate {
    pub fn parse(format: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(format) {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");

            push_literal(&mut segments, &format[last..whole.start])?;
            let field = AuditField::from_name(name).ok_or_else(|| {
                WafError::Config(format!("unknown output format field '{}'", name))
            })?;
            segments.push(Segment::Field(field));
            last = whole.end;
        }
        push_literal(&mut segments, &format[last..])?;

        Ok(Self { segments })
    }

    pub fn render(&self, record: &AuditRecord) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(record.field(*field)),
            }
        }
        out
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<()> {
    if text.contains("{{") || text.contains("}}") {
        return Err(WafError::Config(format!(
            "malformed output format near '{}'",
            text
        )));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkScope {
    All,
    /// Only blocked decisions.
    Blocked,
}

pub enum SinkTarget {
    /// Structured log through `tracing`.
    Log,
    Stdout,
    /// Append-only file opened once at startup.
    File(Mutex<File>),
}

pub struct AuditSink {
    pub scope: SinkScope,
    pub target: SinkTarget,
}

impl AuditSink {
    /// Parses one `scope:target` entry. A bare target means `all:target`.
    pub fn parse(entry: &str) -> Result<Self> {
        let (scope, target) = if let Some(rest) = entry.strip_prefix("all:") {
            (SinkScope::All, rest)
        } else if let Some(rest) = entry.strip_prefix("blocked:") {
            (SinkScope::Blocked, rest)
        } else {
            (SinkScope::All, entry)
        };

        let target = match target {
            "log" => SinkTarget::Log,
            "stdout" => SinkTarget::Stdout,
            "" => return Err(WafError::Config(format!("empty output target in '{}'", entry))),
            path => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        WafError::Config(format!("not able to open {} for output: {}", path, e))
                    })?;
                SinkTarget::File(Mutex::new(file))
            }
        };

        Ok(Self { scope, target })
    }

    fn accepts(&self, result: ScanResult) -> bool {
        self.scope == SinkScope::All || result == ScanResult::Blocked
    }

    fn write(&self, line: &str, result: ScanResult) {
        match &self.target {
            SinkTarget::Log => {
                info!(target: "fe_waf::audit", scan_result = result.as_str(), "{}", line);
            }
            SinkTarget::Stdout => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{}", line) {
                    error!("Failed to write audit record to stdout: {}", e);
                }
            }
            SinkTarget::File(file) => {
                if let Err(e) = writeln!(file.lock(), "{}", line) {
                    error!("Failed to write audit record: {}", e);
                }
            }
        }
    }
}

/// Template plus sinks, built once at engine construction.
pub struct AuditOutput {
    template: AuditTemplate,
    sinks: Vec<AuditSink>,
}

impl AuditOutput {
    /// `outputs` is a comma separated list of sinks (`all:log`,
    /// `blocked:/var/log/waf.log`, `stdout`, ...).
    pub fn new(outputs: &str, format: &str) -> Result<Self> {
        let template = AuditTemplate::parse(format)?;
        let sinks = outputs
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(AuditSink::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { template, sinks })
    }

    pub fn emit(&self, request: &RequestDescriptor, result: ScanResult) -> AuditRecord {
        let record = AuditRecord::new(request, result, Utc::now());
        let wanted: Vec<&AuditSink> = self.sinks.iter().filter(|s| s.accepts(result)).collect();

        if !wanted.is_empty() {
            let line = self.template.render(&record);
            for sink in wanted {
                sink.write(&line, result);
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;
    use tempfile::NamedTempFile;

    fn request() -> RequestDescriptor {
        RequestDescriptor::new(
            "34.130.155.108",
            Url::parse("http://www.example.com:8080/login?next=/").unwrap(),
            "POST",
        )
    }

    #[test]
    fn test_render_all_fields() {
        let template = AuditTemplate::parse(
            "{{.Date}}|{{.Timestamp}}|{{.Url}}|{{.UrlHostname}}|{{.UrlPath}}|{{.Method}}|{{.Remoteaddr}}|{{ .Scanresult }}",
        )
        .unwrap();
        let now = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = AuditRecord::new(&request(), ScanResult::Dryrun, now);

        assert_eq!(
            template.render(&record),
            "2024-03-01T12:00:00Z|1709294400|http://www.example.com:8080/login?next=/|www.example.com:8080|/login|POST|34.130.155.108|dryrun"
        );
    }

    #[test]
    fn test_literal_only_template() {
        let template = AuditTemplate::parse("scan done").unwrap();
        let record = AuditRecord::new(&request(), ScanResult::Pass, Utc::now());
        assert_eq!(template.render(&record), "scan done");
    }

    #[test]
    fn test_bad_templates_rejected() {
        for format in ["{{.Nope}}", "{{.Url", "{{ Url }}", "{{.Method}} }}", "{{printf \"%s\" .Url}}"] {
            let err = AuditTemplate::parse(format).unwrap_err();
            assert!(matches!(err, WafError::Config(_)), "{} accepted", format);
        }
    }

    #[test]
    fn test_sink_parsing() {
        let sink = AuditSink::parse("blocked:stdout").unwrap();
        assert_eq!(sink.scope, SinkScope::Blocked);
        assert!(matches!(sink.target, SinkTarget::Stdout));

        let sink = AuditSink::parse("log").unwrap();
        assert_eq!(sink.scope, SinkScope::All);
        assert!(matches!(sink.target, SinkTarget::Log));

        assert!(AuditSink::parse("all:").is_err());
        assert!(AuditSink::parse("all:/nonexistent/dir/audit.log").is_err());
    }

    #[test]
    fn test_blocked_sink_skips_other_results() {
        let all = NamedTempFile::new().unwrap();
        let blocked = NamedTempFile::new().unwrap();
        let outputs = format!(
            "all:{},blocked:{}",
            all.path().display(),
            blocked.path().display()
        );
        let output = AuditOutput::new(&outputs, "{{.Remoteaddr}} {{.Scanresult}}").unwrap();

        output.emit(&request(), ScanResult::Pass);
        output.emit(&request(), ScanResult::Dryrun);
        output.emit(&request(), ScanResult::Blocked);

        let all_lines = std::fs::read_to_string(all.path()).unwrap();
        assert_eq!(
            all_lines,
            "34.130.155.108 pass\n34.130.155.108 dryrun\n34.130.155.108 blocked\n"
        );
        let blocked_lines = std::fs::read_to_string(blocked.path()).unwrap();
        assert_eq!(blocked_lines, "34.130.155.108 blocked\n");
    }

    #[test]
    fn test_scan_result_allowed() {
        assert!(ScanResult::Pass.is_allowed());
        assert!(ScanResult::Dryrun.is_allowed());
        assert!(!ScanResult::Blocked.is_allowed());
    }
}

//! Query templating and the GraphQL HTTP transport.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Errors while expanding a query template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unterminated '{{{{' in query template")]
    Unterminated,
    #[error("unknown template directive '{0}'")]
    Directive(String),
    #[error("invalid duration '{0}'")]
    Duration(String),
}

/// Errors from the HTTP transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(reqwest::StatusCode),
}

/// Decoded GraphQL response envelope.
#[derive(Debug, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

/// Expand a query template.
///
/// Supported directives: `{{ .PreviousRun }}` and `{{ .Now }}` insert the
/// given instants, `{{ NOW "<duration>" }}` inserts the current time
/// offset by a Go-style duration (`-24h`, `1h30m`, `300ms`). All times
/// are RFC-3339 UTC at second precision.
pub fn render_query(
    template: &str,
    previous_run: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
        let directive = after[..end].trim();
        out.push_str(&eval_directive(directive, previous_run, now)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_directive(
    directive: &str,
    previous_run: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<String, TemplateError> {
    match directive {
        ".PreviousRun" => return Ok(format_rfc3339(previous_run)),
        ".Now" => return Ok(format_rfc3339(now)),
        _ => {}
    }

    if let Some(arg) = directive.strip_prefix("NOW") {
        let arg = arg
            .trim()
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .ok_or_else(|| TemplateError::Directive(directive.to_string()))?;
        let offset = parse_go_duration(arg)?;
        return Ok(format_rfc3339(now + offset));
    }

    Err(TemplateError::Directive(directive.to_string()))
}

fn format_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a Go `time.ParseDuration` string: an optional sign followed by
/// one or more `<number><unit>` terms, units `ns`, `us`/`µs`, `ms`, `s`,
/// `m`, `h`. Fractional numbers are allowed.
pub fn parse_go_duration(input: &str) -> Result<Duration, TemplateError> {
    let err = || TemplateError::Duration(input.to_string());

    let mut rest = input;
    let mut negative = false;
    if let Some(stripped) = rest.strip_prefix('-') {
        negative = true;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }

    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(err());
    }

    let mut total_ms = 0.0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(err());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| err())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "ns" => 1e-6,
            "us" | "µs" => 1e-3,
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return Err(err()),
        };
        rest = &rest[unit_len..];
        total_ms += value * unit_ms;
    }

    let millis = total_ms.round() as i64;
    Ok(Duration::milliseconds(if negative { -millis } else { millis }))
}

/// The GraphQL transport seam. Production uses [`HttpTransport`]; tests
/// substitute canned responses.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn execute(&self, query: &str) -> Result<Vec<u8>, TransportError>;
}

/// HTTP transport POSTing `query=<text>` form-encoded with a configurable
/// auth header.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    header_name: String,
    token: String,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        header_name: impl Into<String>,
        token: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            header_name: header_name.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl GraphqlTransport for HttpTransport {
    async fn execute(&self, query: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(self.header_name.as_str(), self.token.as_str())
            .form(&[("query", query)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, h, m, s).unwrap()
    }

    #[test]
    fn renders_previous_run_and_now() {
        let rendered = render_query(
            "pipelines(updatedAfter: \"{{ .PreviousRun }}\", updatedBefore: \"{{ .Now }}\")",
            at(10, 0, 0),
            at(10, 5, 0),
        )
        .unwrap();

        assert_eq!(
            rendered,
            "pipelines(updatedAfter: \"2024-06-15T10:00:00Z\", updatedBefore: \"2024-06-15T10:05:00Z\")"
        );
    }

    #[test]
    fn renders_now_with_offset() {
        let rendered =
            render_query("after: \"{{ NOW \"-1h\" }}\"", at(0, 0, 0), at(10, 30, 0)).unwrap();
        assert_eq!(rendered, "after: \"2024-06-15T09:30:00Z\"");
    }

    #[test]
    fn template_without_directives_is_unchanged() {
        let text = "query { projects { nodes { name } } }";
        assert_eq!(
            render_query(text, at(0, 0, 0), at(0, 0, 0)).unwrap(),
            text
        );
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let err = render_query("{{ .Bogus }}", at(0, 0, 0), at(0, 0, 0)).unwrap_err();
        assert!(matches!(err, TemplateError::Directive(_)));
    }

    #[test]
    fn unterminated_braces_are_an_error() {
        let err = render_query("{{ .Now ", at(0, 0, 0), at(0, 0, 0)).unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated));
    }

    #[test]
    fn bad_duration_in_now_is_an_error() {
        let err = render_query("{{ NOW \"-1d\" }}", at(0, 0, 0), at(0, 0, 0)).unwrap_err();
        assert!(matches!(err, TemplateError::Duration(_)));
    }

    #[test]
    fn parses_go_durations() {
        assert_eq!(parse_go_duration("0").unwrap(), Duration::zero());
        assert_eq!(parse_go_duration("300ms").unwrap(), Duration::milliseconds(300));
        assert_eq!(parse_go_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_go_duration("2h45m").unwrap(), Duration::minutes(165));
        assert_eq!(parse_go_duration("-1.5h").unwrap(), Duration::minutes(-90));
        assert_eq!(parse_go_duration("+10m").unwrap(), Duration::minutes(10));
    }

    #[test]
    fn rejects_malformed_durations() {
        for input in ["", "h", "90", "1d", "-", "1hh"] {
            assert!(
                parse_go_duration(input).is_err(),
                "expected error for {input:?}"
            );
        }
    }

    #[test]
    fn decodes_graphql_envelope() {
        let body = r#"{"data": {"projects": []}, "errors": [{"message": "partial"}]}"#;
        let decoded: GraphqlResponse = serde_json::from_str(body).unwrap();
        assert!(decoded.data.is_some());
        assert_eq!(decoded.errors.len(), 1);

        let body = r#"{"data": null}"#;
        let decoded: GraphqlResponse = serde_json::from_str(body).unwrap();
        assert!(decoded.data.is_none());
        assert!(decoded.errors.is_empty());
    }
}

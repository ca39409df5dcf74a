use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use crate::error::ParseError;
use crate::model::{Fields, MetricFamily, MetricType, NormalizedRecord, Sample, SuffixRole, Tags};

lazy_static! {
    static ref METRIC_NAME: Regex = Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap();
    static ref LABEL_NAME: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
}

const QUANTILE_LABEL: &str = "quantile";
const BUCKET_LABEL: &str = "le";

const SUFFIX_SUM: &str = "_sum";
const SUFFIX_COUNT: &str = "_count";
const SUFFIX_BUCKET: &str = "_bucket";

/// Everything read from one exposition body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scrape {
    pub families: Vec<MetricFamily>,
    /// Skipped lines, and possibly one final body-level failure.
    pub errors: Vec<ParseError>,
}

impl Scrape {
    pub fn parse(body: &[u8]) -> Self {
        let mut parser = Parser::default();

        for (idx, raw) in body.split(|b| *b == b'\n').enumerate() {
            let line_no = idx + 1;
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(_) => {
                    parser.errors.push(ParseError::InvalidUtf8 { line: line_no });
                    break;
                }
            };
            parser.line(line_no, line);
        }

        parser.finish()
    }

    /// Flatten families into records, in family order.
    pub fn records(&self) -> Vec<NormalizedRecord> {
        self.families.iter().flat_map(family_records).collect()
    }

    /// True when the body was cut short by a structural failure.
    pub fn is_truncated(&self) -> bool {
        self.errors.iter().any(ParseError::is_fatal)
    }
}

#[derive(Default)]
struct Parser {
    families: Vec<MetricFamily>,
    active: Option<MetricFamily>,
    help: HashMap<String, String>,
    errors: Vec<ParseError>,
}

impl Parser {
    fn line(&mut self, line_no: usize, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(comment) = line.strip_prefix('#') {
            self.comment(comment.trim_start());
            return;
        }

        match parse_sample_line(line_no, line) {
            Ok(parsed) => self.sample(line_no, parsed),
            Err(e) => {
                tracing::debug!("skipping sample: {}", e);
                self.errors.push(e);
            }
        }
    }

    fn comment(&mut self, comment: &str) {
        let mut parts = comment.splitn(3, char::is_whitespace);
        let keyword = parts.next().unwrap_or_default();
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name,
            _ => return,
        };
        let rest = parts.next().unwrap_or_default().trim();

        match keyword {
            "HELP" => {
                match self.active.as_mut() {
                    Some(family) if family.name == name => family.help = Some(rest.to_string()),
                    _ => {
                        self.help.insert(name.to_string(), rest.to_string());
                    }
                }
            }
            "TYPE" => {
                let kind = MetricType::from_kind(rest);
                self.open(name, kind);
            }
            // plain comment
            _ => {}
        }
    }

    fn open(&mut self, name: &str, kind: MetricType) {
        self.flush();
        let mut family = MetricFamily::new(name, kind);
        family.help = self.help.remove(name);
        self.active = Some(family);
    }

    fn flush(&mut self) {
        if let Some(family) = self.active.take() {
            if !family.samples.is_empty() {
                self.families.push(family);
            }
        }
    }

    fn sample(&mut self, line_no: usize, parsed: ParsedLine) {
        let ParsedLine {
            name,
            mut labels,
            value,
            timestamp_ms,
        } = parsed;

        let role = match self.active.as_ref().and_then(|family| classify(family, &name)) {
            Some(role) => role,
            None => {
                // a sample outside any declared family starts an untyped one
                self.open(&name, MetricType::Untyped);
                Role::Value
            }
        };

        let role = match role {
            Role::Value => match self.active.as_ref().map(|f| f.kind) {
                Some(MetricType::Summary) => match labels.remove(QUANTILE_LABEL) {
                    Some(q) => SuffixRole::Quantile(q),
                    None => SuffixRole::Value,
                },
                _ => SuffixRole::Value,
            },
            Role::Sum => SuffixRole::Sum,
            Role::Count => SuffixRole::Count,
            Role::Bucket => match labels.remove(BUCKET_LABEL) {
                Some(le) => SuffixRole::Bucket(le),
                None => {
                    self.errors.push(ParseError::MalformedLabels {
                        line: line_no,
                        reason: format!("bucket sample {} without {} label", name, BUCKET_LABEL),
                    });
                    return;
                }
            },
        };

        if let Some(family) = self.active.as_mut() {
            family.samples.push(Sample {
                labels,
                value,
                timestamp_ms,
                role,
            });
        }
    }

    fn finish(mut self) -> Scrape {
        self.flush();
        Scrape {
            families: self.families,
            errors: self.errors,
        }
    }
}

enum Role {
    Value,
    Sum,
    Count,
    Bucket,
}

/// How `name` relates to `family`, `None` when it belongs to another family.
fn classify(family: &MetricFamily, name: &str) -> Option<Role> {
    if name == family.name {
        return Some(Role::Value);
    }

    let suffix = name.strip_prefix(family.name.as_str())?;
    match (family.kind, suffix) {
        (MetricType::Summary, SUFFIX_SUM) | (MetricType::Histogram, SUFFIX_SUM) => Some(Role::Sum),
        (MetricType::Summary, SUFFIX_COUNT) | (MetricType::Histogram, SUFFIX_COUNT) => {
            Some(Role::Count)
        }
        (MetricType::Histogram, SUFFIX_BUCKET) => Some(Role::Bucket),
        _ => None,
    }
}

#[derive(Debug, PartialEq)]
struct ParsedLine {
    name: String,
    labels: Tags,
    value: f64,
    timestamp_ms: Option<i64>,
}

fn parse_sample_line(line_no: usize, line: &str) -> Result<ParsedLine, ParseError> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or_else(|| line.len());
    let name = &line[..name_end];
    if !METRIC_NAME.is_match(name) {
        return Err(ParseError::InvalidName {
            line: line_no,
            name: name.to_string(),
        });
    }

    let mut rest = &line[name_end..];
    let labels = if let Some(inner) = rest.strip_prefix('{') {
        let (labels, consumed) = parse_labels(line_no, inner)?;
        rest = &inner[consumed..];
        labels
    } else {
        Tags::new()
    };

    let mut tokens = rest.split_whitespace();
    let value_str = tokens.next().ok_or(ParseError::MissingValue { line: line_no })?;
    let value = parse_float(value_str).ok_or_else(|| ParseError::InvalidValue {
        line: line_no,
        value: value_str.to_string(),
    })?;

    let timestamp_ms = match tokens.next() {
        Some(ts) => {
            let invalid = || ParseError::InvalidTimestamp {
                line: line_no,
                timestamp: ts.to_string(),
            };
            let ms = ts.parse::<i64>().map_err(|_| invalid())?;
            if millis_to_datetime(ms).is_none() {
                return Err(invalid());
            }
            Some(ms)
        }
        None => None,
    };

    let trailing: Vec<&str> = tokens.collect();
    if !trailing.is_empty() {
        return Err(ParseError::TrailingData {
            line: line_no,
            data: trailing.join(" "),
        });
    }

    Ok(ParsedLine {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

/// Parse the inside of a `{...}` label set. Returns the labels and the number
/// of bytes consumed, closing brace included.
fn parse_labels(line_no: usize, input: &str) -> Result<(Tags, usize), ParseError> {
    let malformed = |reason: String| ParseError::MalformedLabels {
        line: line_no,
        reason,
    };
    let unterminated = ParseError::UnterminatedLabels { line: line_no };

    let mut labels = Tags::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while let Some((_, c)) = chars.peek() {
            if c.is_whitespace() || *c == ',' {
                chars.next();
            } else {
                break;
            }
        }

        let start = match chars.peek() {
            Some((i, '}')) => return Ok((labels, i + 1)),
            Some((i, _)) => *i,
            None => return Err(unterminated),
        };

        let mut end = start;
        while let Some((i, c)) = chars.peek() {
            if *c == '=' || c.is_whitespace() || *c == '}' || *c == ',' {
                break;
            }
            end = i + c.len_utf8();
            chars.next();
        }
        let key = &input[start..end];
        if !LABEL_NAME.is_match(key) {
            return Err(malformed(format!("invalid label name {:?}", key)));
        }

        while let Some((_, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        match chars.next() {
            Some((_, '=')) => {}
            Some((_, c)) => return Err(malformed(format!("expected '=' after {}, found {:?}", key, c))),
            None => return Err(unterminated),
        }
        while let Some((_, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        match chars.next() {
            Some((_, '"')) => {}
            Some((_, c)) => return Err(malformed(format!("expected '\"' for {}, found {:?}", key, c))),
            None => return Err(unterminated),
        }

        let mut value = String::new();
        loop {
            match chars.next() {
                Some((_, '\\')) => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, c)) => value.push(c),
                    None => return Err(unterminated),
                },
                Some((_, '"')) => break,
                Some((_, c)) => value.push(c),
                None => return Err(unterminated),
            }
        }

        if labels.insert(key.to_string(), value).is_some() {
            return Err(malformed(format!("duplicate label {}", key)));
        }

        while let Some((_, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        match chars.peek() {
            Some((_, ',')) | Some((_, '}')) => {}
            Some((_, c)) => return Err(malformed(format!("unexpected {:?} after label {}", c, key))),
            None => return Err(unterminated),
        }
    }
}

/// Float as written in the exposition format, `+Inf`, `-Inf` and `NaN` included.
pub fn parse_float(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => s.parse::<f64>().ok(),
    }
}

pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn record(
    measurement: &str,
    tags: &Tags,
    fields: Fields,
    timestamp_ms: Option<i64>,
) -> NormalizedRecord {
    NormalizedRecord {
        measurement: measurement.to_string(),
        tags: tags.clone(),
        fields,
        timestamp: timestamp_ms.and_then(millis_to_datetime),
    }
}

fn single_field(name: &str, value: f64) -> Fields {
    let mut fields = Fields::new();
    fields.insert(name.to_string(), value);
    fields
}

#[derive(Default)]
struct Group<'a> {
    points: Vec<&'a Sample>,
    sum: Option<&'a Sample>,
    count: Option<&'a Sample>,
}

fn family_records(family: &MetricFamily) -> Vec<NormalizedRecord> {
    match family.kind {
        MetricType::Gauge | MetricType::Counter | MetricType::Untyped => {
            let field = family.kind.value_field();
            family
                .samples
                .iter()
                .map(|s| {
                    let mut tags = s.labels.clone();
                    tags.remove(QUANTILE_LABEL);
                    tags.remove(BUCKET_LABEL);
                    record(&family.name, &tags, single_field(field, s.value), s.timestamp_ms)
                })
                .collect()
        }
        MetricType::Summary | MetricType::Histogram => distribution_records(family),
    }
}

/// Quantile or bucket records per label group, then one sum/count record.
fn distribution_records(family: &MetricFamily) -> Vec<NormalizedRecord> {
    let mut order: Vec<&Tags> = Vec::new();
    let mut groups: BTreeMap<&Tags, Group> = BTreeMap::new();

    for sample in &family.samples {
        let group = groups.entry(&sample.labels).or_insert_with(|| {
            order.push(&sample.labels);
            Group::default()
        });
        match sample.role {
            SuffixRole::Sum => group.sum = Some(sample),
            SuffixRole::Count => group.count = Some(sample),
            _ => group.points.push(sample),
        }
    }

    let mut records = Vec::new();
    for labels in order {
        let group = &groups[labels];

        for sample in &group.points {
            let field = match &sample.role {
                SuffixRole::Quantile(level) => level.as_str(),
                SuffixRole::Bucket(bound) => bound.as_str(),
                _ => MetricType::Untyped.value_field(),
            };
            records.push(record(
                &family.name,
                labels,
                single_field(field, sample.value),
                sample.timestamp_ms,
            ));
        }

        if group.sum.is_none() && group.count.is_none() {
            continue;
        }
        let mut fields = Fields::new();
        if let Some(sum) = group.sum {
            fields.insert("sum".into(), sum.value);
        }
        if let Some(count) = group.count {
            fields.insert("count".into(), count.value);
        }
        let timestamp_ms = group
            .sum
            .and_then(|s| s.timestamp_ms)
            .or_else(|| group.count.and_then(|s| s.timestamp_ms));
        records.push(record(&family.name, labels, fields, timestamp_ms));
    }

    records
}

/// Parse a body straight into records.
pub fn parse(body: &[u8]) -> (Vec<NormalizedRecord>, Vec<ParseError>) {
    let scrape = Scrape::parse(body);
    let records = scrape.records();
    (records, scrape.errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TEXT_FORMAT: &str = r#"# HELP go_gc_duration_seconds A summary of the GC invocation durations.
# TYPE go_gc_duration_seconds summary
go_gc_duration_seconds{quantile="0"} 0.00010425500000000001
go_gc_duration_seconds{quantile="0.25"} 0.000139108
go_gc_duration_seconds{quantile="0.5"} 0.00015749400000000002
go_gc_duration_seconds{quantile="0.75"} 0.000331463
go_gc_duration_seconds{quantile="1"} 0.000667154
go_gc_duration_seconds_sum 0.0018183950000000002
go_gc_duration_seconds_count 7
# HELP go_goroutines Number of goroutines that currently exist.
# TYPE go_goroutines gauge
go_goroutines 15
# HELP test_metric An untyped metric with a timestamp
# TYPE test_metric untyped
test_metric{label="value"} 1.0 1490802350000
"#;

    const HISTOGRAM: &str = r#"# HELP http_request_duration_seconds A histogram of the request duration.
# TYPE http_request_duration_seconds histogram
http_request_duration_seconds_bucket{code="200",le="0.05"} 24054
http_request_duration_seconds_bucket{code="200",le="0.1"} 33444
http_request_duration_seconds_bucket{code="200",le="+Inf"} 144320
http_request_duration_seconds_sum{code="200"} 53423
http_request_duration_seconds_count{code="200"} 144320
http_request_duration_seconds_bucket{code="500",le="0.05"} 3
http_request_duration_seconds_bucket{code="500",le="+Inf"} 7
http_request_duration_seconds_count{code="500"} 7
"#;

    fn labels(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn summary_yields_quantiles_and_sum_count() {
        let (records, errors) = parse(SAMPLE_TEXT_FORMAT.as_bytes());
        assert!(errors.is_empty(), "{:?}", errors);

        let summary: Vec<_> = records
            .iter()
            .filter(|r| r.measurement == "go_gc_duration_seconds")
            .collect();
        assert_eq!(summary.len(), 6);

        let quantiles: Vec<_> = summary[..5]
            .iter()
            .map(|r| r.fields.keys().next().unwrap().as_str())
            .collect();
        assert_eq!(quantiles, vec!["0", "0.25", "0.5", "0.75", "1"]);
        assert!(summary[..5].iter().all(|r| r.tags.is_empty()));

        let totals = summary[5];
        assert_eq!(totals.fields.len(), 2);
        assert_eq!(totals.fields["sum"], 0.0018183950000000002);
        assert_eq!(totals.fields["count"], 7.0);
    }

    #[test]
    fn single_value_kinds_use_kind_field() {
        let body = "# TYPE up gauge\nup 1\n# TYPE requests counter\nrequests{path=\"/\"} 10\nloose 3\n";
        let (records, errors) = parse(body.as_bytes());
        assert!(errors.is_empty());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].fields["gauge"], 1.0);
        assert_eq!(records[1].fields["counter"], 10.0);
        assert_eq!(records[1].tags, labels(&[("path", "/")]));
        assert_eq!(records[2].measurement, "loose");
        assert_eq!(records[2].fields["value"], 3.0);
    }

    #[test]
    fn single_value_tags_drop_quantile_and_bucket_labels() {
        let body = "# TYPE g gauge\ng{le=\"1\",quantile=\"0.5\",job=\"x\"} 2\nloose{le=\"3\"} 1\n";
        let (records, errors) = parse(body.as_bytes());
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(records[0].tags, labels(&[("job", "x")]));
        assert_eq!(records[0].fields["gauge"], 2.0);
        assert!(records[1].tags.is_empty());
    }

    #[test]
    fn unknown_kind_is_untyped() {
        let scrape = Scrape::parse(b"# TYPE weird gaugeish\nweird 2\n");
        assert_eq!(scrape.families[0].kind, MetricType::Untyped);
        assert_eq!(scrape.records()[0].fields["value"], 2.0);
    }

    #[test]
    fn histogram_groups_by_labels() {
        let (records, errors) = parse(HISTOGRAM.as_bytes());
        assert!(errors.is_empty());
        assert_eq!(records.len(), 7);

        let ok = labels(&[("code", "200")]);
        assert_eq!(records[0].tags, ok);
        assert_eq!(records[0].fields["0.05"], 24054.0);
        assert_eq!(records[1].fields["0.1"], 33444.0);
        assert_eq!(records[2].fields["+Inf"], 144320.0);
        assert_eq!(records[3].fields["sum"], 53423.0);
        assert_eq!(records[3].fields["count"], 144320.0);

        let failed = labels(&[("code", "500")]);
        assert_eq!(records[6].tags, failed);
        assert_eq!(records[6].fields.len(), 1);
        assert_eq!(records[6].fields["count"], 7.0);
    }

    #[test]
    fn bucket_bounds_parse_from_label() {
        let scrape = Scrape::parse(HISTOGRAM.as_bytes());
        let sample = &scrape.families[0].samples[2];
        assert_eq!(sample.role, SuffixRole::Bucket("+Inf".into()));
        assert_eq!(sample.role.param(), Some(f64::INFINITY));
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let (records, _) = parse(SAMPLE_TEXT_FORMAT.as_bytes());
        let test_metric = records.iter().find(|r| r.measurement == "test_metric").unwrap();
        assert_eq!(
            test_metric.timestamp,
            Some(Utc.timestamp_opt(1_490_802_350, 0).unwrap())
        );
        assert_eq!(test_metric.tags, labels(&[("label", "value")]));

        let goroutines = records.iter().find(|r| r.measurement == "go_goroutines").unwrap();
        assert_eq!(goroutines.timestamp, None);
    }

    #[test]
    fn parsing_is_idempotent() {
        let body = format!("{}{}", SAMPLE_TEXT_FORMAT, HISTOGRAM);
        assert_eq!(parse(body.as_bytes()), parse(body.as_bytes()));
    }

    #[test]
    fn bad_lines_are_skipped() {
        let body = "# TYPE a gauge\na 1\na{x=\"1\",y=\"2\"\na{x=\"2\"} nope\na{x=\"3\"} 3 soon\na{x=\"4\"} 4\n";
        let (records, errors) = parse(body.as_bytes());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].tags, labels(&[("x", "4")]));
        assert_eq!(
            errors,
            vec![
                ParseError::UnterminatedLabels { line: 3 },
                ParseError::InvalidValue {
                    line: 4,
                    value: "nope".into()
                },
                ParseError::InvalidTimestamp {
                    line: 5,
                    timestamp: "soon".into()
                },
            ]
        );
    }

    #[test]
    fn label_values_unescape() {
        let line = r#"m{path="C:\\dir",msg="say \"hi\"\n", empty=""} 1"#;
        let parsed = parse_sample_line(1, line).unwrap();
        assert_eq!(
            parsed.labels,
            labels(&[("path", r"C:\dir"), ("msg", "say \"hi\"\n"), ("empty", "")])
        );
    }

    #[test]
    fn label_value_may_hold_braces_and_commas() {
        let parsed = parse_sample_line(1, r#"m{a="x,}y",b="z",} -Inf"#).unwrap();
        assert_eq!(parsed.labels, labels(&[("a", "x,}y"), ("b", "z")]));
        assert_eq!(parsed.value, f64::NEG_INFINITY);
    }

    #[test]
    fn special_values() {
        assert_eq!(parse_float("+Inf"), Some(f64::INFINITY));
        assert!(parse_float("NaN").unwrap().is_nan());
        assert_eq!(parse_float("1e3"), Some(1000.0));
        assert_eq!(parse_float("one"), None);
    }

    #[test]
    fn invalid_utf8_keeps_earlier_families() {
        let mut body = b"# TYPE a gauge\na 1\n# TYPE b gauge\nb 2\n".to_vec();
        body.extend_from_slice(&[0xff, 0xfe, b'\n']);
        body.extend_from_slice(b"c 3\n");

        let scrape = Scrape::parse(&body);
        assert!(scrape.is_truncated());
        let names: Vec<_> = scrape.records().into_iter().map(|r| r.measurement).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn help_is_attached_to_family() {
        let scrape = Scrape::parse(SAMPLE_TEXT_FORMAT.as_bytes());
        assert_eq!(
            scrape.families[1].help.as_deref(),
            Some("Number of goroutines that currently exist.")
        );
    }

    #[test]
    fn empty_body_has_no_records() {
        let scrape = Scrape::parse(b"\n\n# just a comment\n");
        assert!(scrape.families.is_empty());
        assert!(scrape.errors.is_empty());
    }
}

//! Path-based extraction of values and labels from decoded JSON.
//!
//! A value path such as `projects.nodes.*.pipelines.nodes.*.duration`
//! selects the leaves of a GraphQL response, while label paths sharing a
//! prefix with it select the dimension values belonging to the same branch
//! of the document. `*` segments traverse arrays; labels rooted above an
//! array are resolved once and shared across all elements below it.

use serde_json::Value;
use thiserror::Error;

use crate::config::LabelConfig;

/// Errors raised while compiling a value path and its label paths.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("first segment of label '{alias}' does not match value path '{value_path}'")]
    CommonRoot { alias: String, value_path: String },

    #[error("label '{alias}' has more '*' segments than value path '{value_path}'")]
    TooManyStars { alias: String, value_path: String },

    #[error("a '*' in label path '{path}' exceeds the length of value path '{value_path}'")]
    StarBeyondValue { path: String, value_path: String },

    #[error("a '*' in label path '{path}' is misaligned with value path '{value_path}'")]
    StarMisaligned { path: String, value_path: String },

    #[error("label '{alias}' has more segments than value path '{value_path}' with a misplaced '*'")]
    ExtraSegments { alias: String, value_path: String },
}

/// A compiled value path plus its label paths, ready for extraction.
///
/// Labels are kept sorted by (segment count ascending, then per-segment
/// lexicographic order). The extraction algorithm relies on this: a label
/// rooted above an array is resolved before the array is traversed, and
/// diverging sibling paths end up adjacent so branch-off points can be
/// detected by comparing a path with its successor.
#[derive(Debug, Clone)]
pub struct Extractor {
    labels: Vec<LabelConfig>,
    label_segments: Vec<Vec<String>>,
    value_segments: Vec<String>,
    value_path: String,
}

impl Extractor {
    /// Compile and validate a value path with its label definitions.
    pub fn new(
        separator: &str,
        value_path: &str,
        mut labels: Vec<LabelConfig>,
    ) -> Result<Self, PathError> {
        sort_paths(separator, &mut labels);

        let label_segments = labels
            .iter()
            .map(|label| split_path(separator, &label.path))
            .collect();

        let extractor = Extractor {
            labels,
            label_segments,
            value_segments: split_path(separator, value_path),
            value_path: value_path.to_string(),
        };
        extractor.validate()?;
        Ok(extractor)
    }

    /// Label definitions in canonical sort order. Vector label names must
    /// use the aliases in exactly this order.
    pub fn sorted_labels(&self) -> &[LabelConfig] {
        &self.labels
    }

    /// Walk `root` and invoke `emit(value, labels)` once per leaf matched
    /// by the value path. The label slice always has one entry per
    /// configured label, in sorted order; unresolved labels are empty
    /// strings. Suppression of empty values happens downstream.
    pub fn extract<F>(&self, root: &Value, mut emit: F)
    where
        F: FnMut(&str, &[String]),
    {
        let mut paths: Vec<&[String]> = self
            .label_segments
            .iter()
            .map(|segments| segments.as_slice())
            .collect();
        paths.push(&self.value_segments);

        let mut current = vec![String::new(); paths.len()];
        descend(root, &paths, 0, &mut current, &mut emit);
    }

    fn validate(&self) -> Result<(), PathError> {
        let value_stars = count_stars(&self.value_segments);

        for (label, segments) in self.labels.iter().zip(&self.label_segments) {
            // every label shares the value path's root segment
            if segments[0] != self.value_segments[0] {
                return Err(PathError::CommonRoot {
                    alias: label.alias.clone(),
                    value_path: self.value_path.clone(),
                });
            }

            // a label may not traverse more arrays than the value path
            let label_stars = count_stars(segments);
            if label_stars > value_stars {
                return Err(PathError::TooManyStars {
                    alias: label.alias.clone(),
                    value_path: self.value_path.clone(),
                });
            }

            // every label '*' must sit where the value path also
            // has one. Non-star mismatches beyond segment 0 are where a
            // label branches off, which is allowed.
            for (i, segment) in segments.iter().enumerate() {
                if segment != "*" {
                    continue;
                }
                if i >= self.value_segments.len() {
                    return Err(PathError::StarBeyondValue {
                        path: label.path.clone(),
                        value_path: self.value_path.clone(),
                    });
                }
                if self.value_segments[i] != "*" {
                    return Err(PathError::StarMisaligned {
                        path: label.path.clone(),
                        value_path: self.value_path.clone(),
                    });
                }
            }

            // a label longer than the value path must carry as many
            // stars as the value path, otherwise some '*' is misplaced
            if segments.len() > self.value_segments.len() && label_stars < value_stars {
                return Err(PathError::ExtraSegments {
                    alias: label.alias.clone(),
                    value_path: self.value_path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn split_path(separator: &str, path: &str) -> Vec<String> {
    path.split(separator).map(str::to_owned).collect()
}

/// Sort label paths by segment count, then per-segment lexicographically.
fn sort_paths(separator: &str, labels: &mut [LabelConfig]) {
    labels.sort_by(|a, b| {
        let left: Vec<&str> = a.path.split(separator).collect();
        let right: Vec<&str> = b.path.split(separator).collect();
        left.len().cmp(&right.len()).then_with(|| left.cmp(&right))
    });
}

fn count_stars(segments: &[String]) -> usize {
    segments.iter().filter(|segment| *segment == "*").count()
}

/// Recursive descent over the document.
///
/// `paths` is the sorted label paths with the value path appended last;
/// `current[k]` holds path k's resolved text, empty while unresolved. A
/// path is resolved in place as soon as it reaches its final segment or
/// diverges from its successor; only the value path (always last) drives
/// further descent, cloning `current` per element when expanding a `*`.
fn descend<F>(node: &Value, paths: &[&[String]], idx: usize, current: &mut Vec<String>, emit: &mut F)
where
    F: FnMut(&str, &[String]),
{
    let last = paths.len() - 1;

    for k in 0..paths.len() {
        let segments = paths[k];
        if segments.len() <= idx || !current[k].is_empty() {
            continue;
        }

        let segment = &segments[idx];
        let branches = idx == segments.len() - 1 || (k < last && *segment != paths[k + 1][idx]);
        if branches {
            current[k] = resolve_suffix(node, &segments[idx..]);
            if k == last {
                let (labels, value) = current.split_at(last);
                emit(&value[0], labels);
            }
            continue;
        }

        if k == last {
            if segment == "*" {
                if let Value::Array(items) = node {
                    for item in items {
                        let mut forked = current.clone();
                        descend(item, paths, idx + 1, &mut forked, emit);
                    }
                }
            } else if let Value::Object(map) = node {
                if let Some(child) = map.get(segment) {
                    descend(child, paths, idx + 1, current, emit);
                }
            }
        }
    }
}

/// Resolve the remaining segments of a path against a single branch of the
/// tree. Arrays abort the resolution (the path would need a '*' to cross
/// them); missing keys leave the entry empty; a scalar reached early
/// swallows the remaining segments.
fn resolve_suffix(node: &Value, segments: &[String]) -> String {
    let mut value = node;
    for segment in segments {
        match value {
            Value::Object(map) => match map.get(segment) {
                Some(child) => value = child,
                None => return String::new(),
            },
            Value::Array(_) => return String::new(),
            _ => {}
        }
    }
    stringify(value)
}

/// Canonical text for a scalar leaf. Nulls become the empty string, which
/// the apply layer suppresses.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

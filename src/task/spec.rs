//! Parser for task lists such as `decompress,index_fasta(k=v;k=v),cleanup(pattern=*.gz)`.

use std::fmt;

use crate::error::MirrorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub params: TaskParams,
}

/// `k=v` pairs in declaration order. Values may hold `:`-separated lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskParams {
    entries: Vec<(String, String)>,
}

impl TaskParams {
    pub fn parse(text: &str) -> Result<Self, MirrorError> {
        let mut params = Self::default();
        for item in text.split(';').map(str::trim).filter(|item| !item.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| MirrorError::InvalidTaskSpec(format!("parameter without '=': {item}")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(MirrorError::InvalidTaskSpec(format!("empty parameter name: {item}")));
            }
            params.set(key, value.trim());
        }
        Ok(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|value| value.split(':').map(str::trim).filter(|v| !v.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
    }

    /// Replaces an existing value in place, otherwise appends.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| name == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for TaskParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Splits a task list on top-level commas. Commas inside parentheses belong to
/// the parameters.
pub fn parse_specs(text: &str) -> Result<Vec<TaskSpec>, MirrorError> {
    let mut specs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (pos, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| MirrorError::InvalidTaskSpec(format!("unbalanced ')' in {text}")))?;
            }
            ',' if depth == 0 => {
                push_spec(&mut specs, &text[start..pos])?;
                start = pos + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(MirrorError::InvalidTaskSpec(format!("unclosed '(' in {text}")));
    }
    push_spec(&mut specs, &text[start..])?;
    Ok(specs)
}

fn push_spec(specs: &mut Vec<TaskSpec>, item: &str) -> Result<(), MirrorError> {
    let item = item.trim();
    if item.is_empty() {
        return Ok(());
    }
    let (name, params) = match item.split_once('(') {
        Some((name, rest)) => {
            let body = rest
                .strip_suffix(')')
                .ok_or_else(|| MirrorError::InvalidTaskSpec(format!("text after ')' in {item}")))?;
            (name.trim(), TaskParams::parse(body)?)
        }
        None => (item, TaskParams::default()),
    };
    if name.is_empty() {
        return Err(MirrorError::InvalidTaskSpec(format!("missing task name in {item}")));
    }
    specs.push(TaskSpec {
        name: name.to_string(),
        params,
    });
    Ok(())
}

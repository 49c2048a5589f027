//! Placeholder expansion in resource files.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use glob::Pattern;

use crate::archive::{self, Contents, Entry};
use crate::config::ProjectConfig;
use crate::error::TemplateError;

const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Expands `${token}` placeholders.
///
/// Known tokens are substituted. Unknown tokens are left in place for the host
/// to interpret, unless they start with the reserved prefix, in which case the
/// expansion fails. Values may not contain `$` or start with `{`, so no
/// substitution can form a new placeholder and a single pass always produces
/// a fixed point.
#[derive(Debug, Clone)]
pub struct Templater {
    values: BTreeMap<String, String>,
    reserved_prefix: String,
    files: Vec<Pattern>,
}

impl Templater {
    pub fn new(
        values: BTreeMap<String, String>,
        reserved_prefix: impl Into<String>,
        files: &[String],
    ) -> Result<Self, TemplateError> {
        // A `$` anywhere, or a leading `{` after a literal `$`, could form a
        // new placeholder with the surrounding text.
        let unsafe_value = |value: &String| value.contains('$') || value.starts_with('{');
        if let Some((key, _)) = values.iter().find(|(_, value)| unsafe_value(value)) {
            return Err(TemplateError::RecursiveValue(key.clone()));
        }

        let files = files
            .iter()
            .map(|pattern| Pattern::new(pattern))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            values,
            reserved_prefix: reserved_prefix.into(),
            files,
        })
    }

    /// Values for `name`, `version`, `group` and `description`, each also
    /// available beneath the reserved prefix, plus any configured extras.
    pub fn from_config(config: &ProjectConfig) -> Result<Self, TemplateError> {
        let project = &config.project;
        let prefix = &config.templates.reserved_prefix;

        let mut values = BTreeMap::new();
        for (key, value) in [
            ("name", &project.name),
            ("version", &project.version),
            ("group", &project.group),
            ("description", &project.description),
        ] {
            values.insert(key.to_string(), value.clone());
            values.insert(format!("{prefix}{key}"), value.clone());
        }
        values.extend(config.templates.values.clone());

        Self::new(values, prefix.clone(), &config.templates.files)
    }

    pub fn is_template(&self, path: &str) -> bool {
        self.files
            .iter()
            .any(|pattern| pattern.matches_with(path, GLOB_OPTS))
    }

    /// Expands every placeholder in `text`; `file` is only used in errors.
    pub fn expand(&self, file: &Utf8Path, text: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            let (before, after) = rest.split_at(start);
            out.push_str(before);

            let token = after[2..]
                .find(|c| matches!(c, '}' | '\n' | '$' | '{'))
                .filter(|&end| after[2 + end..].starts_with('}'))
                .map(|end| &after[2..2 + end]);

            let Some(token) = token else {
                out.push_str("${");
                rest = &after[2..];
                continue;
            };

            match self.values.get(token) {
                Some(value) => out.push_str(value),
                None if !self.reserved_prefix.is_empty()
                    && token.starts_with(&self.reserved_prefix) =>
                {
                    let offset = text.len() - after.len();
                    return Err(TemplateError::Unresolved {
                        file: file.to_owned(),
                        token: token.to_string(),
                        line: text[..offset].matches('\n').count() + 1,
                    });
                }
                None => {
                    out.push_str("${");
                    out.push_str(token);
                    out.push('}');
                }
            }

            rest = &after[token.len() + 3..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn expand_entry(&self, root: &Utf8Path, entry: Entry) -> Result<Entry, TemplateError> {
        if !self.is_template(&entry.path) {
            return Ok(entry);
        }

        let file = root.join(&entry.path);
        let text = String::from_utf8(entry.data)
            .map_err(|_| TemplateError::NotUtf8(file.clone()))?;
        let expanded = self.expand(&file, &text)?;

        if entry.path.ends_with(".json") {
            serde_json::from_str::<serde_json::Value>(&expanded)
                .map_err(|source| TemplateError::InvalidJson { file, source })?;
        }

        Ok(Entry::new(entry.path, expanded))
    }

    /// Copies `resources` into `out`, expanding templates on the way. `out`
    /// is recreated from scratch. A missing resource directory yields no
    /// resources.
    pub fn process(&self, resources: &Utf8Path, out: &Utf8Path) -> Result<Contents, TemplateError> {
        let contents = archive::read_dir(resources, "resources")?;

        let entries = contents
            .entries
            .into_iter()
            .map(|entry| self.expand_entry(resources, entry))
            .collect::<Result<Vec<_>, _>>()?;

        let io = |path: &Utf8Path| {
            let path = path.to_owned();
            move |source: std::io::Error| TemplateError::Io { path, source }
        };

        if out.exists() {
            fs::remove_dir_all(out).map_err(io(out))?;
        }
        for entry in &entries {
            let path = out.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io(parent))?;
            }
            fs::write(&path, &entry.data).map_err(io(&path))?;
        }

        Ok(Contents::new(contents.origin, entries))
    }
}

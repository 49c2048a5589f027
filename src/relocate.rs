//! Namespace relocation of bundled code.
//!
//! Every bundled class whose name lies beneath a rule's source package is
//! moved beneath the rule's target package, and every mention of such a name
//! is rewritten in all units that end up in the package, project classes
//! included. Names are matched in three shapes: internal names
//! (`com/google/gson/Gson`), dotted names (`com.google.gson.Gson`, as used by
//! reflection strings and service files) and type descriptors
//! (`(Lcom/google/gson/Gson;)V`).
//!
//! Names that already lie beneath a target package are never matched again,
//! which makes relocation a fixed point: running it over its own output
//! changes nothing.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::archive::{Contents, Entry};
use crate::classfile::ClassFile;
use crate::config::{RelocationRule, validate_relocations};
use crate::error::{ClassFileError, RelocationError};

const SERVICES_DIR: &str = "META-INF/services/";
const VERSIONS_DIR: &str = "META-INF/versions/";

/// Characters that may precede an `L` starting an object type in a
/// descriptor or generic signature, primitive type letters included.
const DESCRIPTOR_BOUNDARY: &[u8] = b"()[;<>:+-^*BCDFIJSZ";

#[derive(Debug, Clone)]
struct Rule {
    from: String,
    to: String,
    from_dotted: String,
    to_dotted: String,
}

impl Rule {
    fn prefixes(&self, sep: char) -> (&str, &str) {
        match sep {
            '.' => (&self.from_dotted, &self.to_dotted),
            _ => (&self.from, &self.to),
        }
    }
}

/// Project classes and bundle contents after relocation.
#[derive(Debug, Clone)]
pub struct RelocatedUnits {
    pub project: Contents,
    pub bundle: Vec<Contents>,
    /// Number of bundled entries that were moved to a new path.
    pub moved: usize,
}

/// Result of relocating a single entry.
struct Unit {
    entry: Entry,
    moved: bool,
    class: Option<ClassInfo>,
}

struct ClassInfo {
    original: String,
    name: String,
    references: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Relocator {
    rules: Vec<Rule>,
}

/// Part of `name` after `prefix` when `name` lies strictly beneath it.
fn beneath<'a>(name: &'a str, prefix: &str, sep: char) -> Option<&'a str> {
    let rest = name.strip_prefix(prefix)?;
    (rest.starts_with(sep) && rest.len() > 1).then_some(rest)
}

fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

impl Relocator {
    pub fn new(
        rules: &[RelocationRule],
        host_namespaces: &[String],
    ) -> Result<Self, RelocationError> {
        validate_relocations(rules, host_namespaces)?;

        let rules = rules
            .iter()
            .map(|rule| Rule {
                from: rule.from.replace('.', "/"),
                to: rule.to.replace('.', "/"),
                from_dotted: rule.from.clone(),
                to_dotted: rule.to.clone(),
            })
            .collect();

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `name` already lies beneath one of the target packages.
    fn is_relocated(&self, name: &str, sep: char) -> bool {
        self.rules
            .iter()
            .any(|rule| beneath(name, rule.prefixes(sep).1, sep).is_some())
    }

    /// New name for `name`, using `sep` as package separator. The first rule
    /// whose source contains the name wins.
    fn map_name(&self, name: &str, sep: char) -> Option<String> {
        if self.is_relocated(name, sep) {
            return None;
        }

        self.rules.iter().find_map(|rule| {
            let (from, to) = rule.prefixes(sep);
            beneath(name, from, sep).map(|rest| format!("{to}{rest}"))
        })
    }

    /// Rewrites object types embedded in a descriptor or signature.
    fn map_descriptor(&self, text: &str) -> Option<String> {
        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len() + 32);
        let mut last = 0;

        for (i, _) in text.match_indices('L') {
            if i < last || (i > 0 && !DESCRIPTOR_BOUNDARY.contains(&bytes[i - 1])) {
                continue;
            }

            let rest = &text[i + 1..];
            if self.is_relocated(rest, '/') {
                continue;
            }

            let Some(rule) = self
                .rules
                .iter()
                .find(|rule| beneath(rest, &rule.from, '/').is_some())
            else {
                continue;
            };

            out.push_str(&text[last..=i]);
            out.push_str(&rule.to);
            last = i + 1 + rule.from.len();
        }

        (last > 0).then(|| {
            out.push_str(&text[last..]);
            out
        })
    }

    /// Replacement for a single UTF-8 constant, if it mentions a relocated
    /// name.
    fn map_utf8(&self, text: &str) -> Option<String> {
        self.map_name(text, '/')
            .or_else(|| self.map_name(text, '.'))
            .or_else(|| text.contains(';').then(|| self.map_descriptor(text)).flatten())
    }

    /// New archive path of a bundled entry.
    fn map_path(&self, path: &str) -> Option<String> {
        if let Some(service) = path.strip_prefix(SERVICES_DIR) {
            return self
                .map_name(service, '.')
                .map(|service| format!("{SERVICES_DIR}{service}"));
        }

        if let Some(rest) = path.strip_prefix(VERSIONS_DIR)
            && let Some((version, inner)) = rest.split_once('/')
        {
            return self
                .map_name(inner, '/')
                .map(|inner| format!("{VERSIONS_DIR}{version}/{inner}"));
        }

        self.map_name(path, '/')
    }

    /// Rewrites the provider names listed in a service file.
    fn map_services(&self, data: &[u8]) -> Option<Vec<u8>> {
        let text = std::str::from_utf8(data).ok()?;
        let mut changed = false;

        let lines: Vec<String> = text
            .split('\n')
            .map(|line| {
                let (body, comment) = match line.find('#') {
                    Some(at) => line.split_at(at),
                    None => (line, ""),
                };
                let provider = body.trim();
                match self.map_name(provider, '.') {
                    Some(mapped) => {
                        changed = true;
                        format!("{}{comment}", body.replacen(provider, &mapped, 1))
                    }
                    None => line.to_string(),
                }
            })
            .collect();

        changed.then(|| lines.join("\n").into_bytes())
    }

    fn relocate_class(
        &self,
        origin: &str,
        entry: &Entry,
        bundled: bool,
    ) -> Result<Unit, RelocationError> {
        let decode = |source: ClassFileError| RelocationError::Decode {
            unit: format!("{origin}!{}", entry.path),
            source,
        };

        let mut class = ClassFile::parse(&entry.data).map_err(decode)?;
        let original = class.name().map_err(decode)?;

        if !bundled && let Some(target) = self.map_name(&original, '/') {
            return Err(RelocationError::ProjectCollision {
                original: dotted(&original),
                target: dotted(&target),
            });
        }

        let changed = class
            .rewrite_utf8(|text| self.map_utf8(text))
            .map_err(decode)?;

        let name = class.name().map_err(decode)?;
        let references = class.class_references().map_err(decode)?;

        let path = match bundled {
            true => self.map_path(&entry.path),
            false => None,
        };
        let moved = path.is_some();
        let data = match changed {
            true => class.to_bytes(),
            false => entry.data.clone(),
        };

        Ok(Unit {
            entry: Entry::new(path.unwrap_or_else(|| entry.path.clone()), data),
            moved,
            class: Some(ClassInfo {
                original,
                name,
                references,
            }),
        })
    }

    fn relocate_resource(&self, entry: &Entry) -> Unit {
        let path = self.map_path(&entry.path);
        let data = match entry.path.starts_with(SERVICES_DIR) {
            true => self.map_services(&entry.data),
            false => None,
        };

        Unit {
            moved: path.is_some(),
            entry: Entry::new(
                path.unwrap_or_else(|| entry.path.clone()),
                data.unwrap_or_else(|| entry.data.clone()),
            ),
            class: None,
        }
    }

    fn relocate_contents(
        &self,
        contents: &Contents,
        bundled: bool,
    ) -> Result<Vec<Unit>, RelocationError> {
        contents
            .entries
            .par_iter()
            .map(|entry| match entry.is_class() {
                true => self.relocate_class(&contents.origin, entry, bundled),
                false if bundled => Ok(self.relocate_resource(entry)),
                false => Ok(Unit {
                    entry: entry.clone(),
                    moved: false,
                    class: None,
                }),
            })
            .collect()
    }

    /// Relocates `bundle` and rewrites the references inside `project`.
    ///
    /// Fails when a relocated class would take the name of a project class,
    /// when a project class itself lies beneath a relocated package, or when
    /// any unit refers to a relocated name that no unit provides.
    pub fn relocate(
        &self,
        project: &Contents,
        bundle: &[Contents],
    ) -> Result<RelocatedUnits, RelocationError> {
        let project_units = self.relocate_contents(project, false)?;
        let bundle_units = bundle
            .iter()
            .map(|contents| self.relocate_contents(contents, true))
            .collect::<Result<Vec<_>, _>>()?;

        let project_names: HashSet<&str> = project_units
            .iter()
            .filter_map(|unit| unit.class.as_ref())
            .map(|class| class.name.as_str())
            .collect();

        let bundled_classes = bundle_units
            .iter()
            .flatten()
            .filter_map(|unit| unit.class.as_ref());

        for class in bundled_classes.clone() {
            if class.name != class.original && project_names.contains(class.name.as_str()) {
                return Err(RelocationError::ProjectCollision {
                    original: dotted(&class.original),
                    target: dotted(&class.name),
                });
            }
        }

        let present: HashSet<&str> = project_names
            .iter()
            .copied()
            .chain(bundled_classes.map(|class| class.name.as_str()))
            .collect();

        let all_classes = project_units
            .iter()
            .chain(bundle_units.iter().flatten())
            .filter_map(|unit| unit.class.as_ref());

        for class in all_classes {
            let missing = class.references.iter().find(|reference| {
                self.is_relocated(reference, '/') && !present.contains(reference.as_str())
            });

            if let Some(missing) = missing {
                return Err(RelocationError::Dangling {
                    original: dotted(&class.original),
                    target: dotted(&class.name),
                    missing: dotted(missing),
                });
            }
        }

        let moved = bundle_units.iter().flatten().filter(|unit| unit.moved).count();
        tracing::debug!(moved, rules = self.rules.len(), "Relocated bundled entries");

        let into_contents = |origin: &str, units: Vec<Unit>| {
            Contents::new(origin, units.into_iter().map(|unit| unit.entry).collect())
        };

        Ok(RelocatedUnits {
            project: into_contents(&project.origin, project_units),
            bundle: bundle
                .iter()
                .zip(bundle_units)
                .map(|(contents, units)| into_contents(&contents.origin, units))
                .collect(),
            moved,
        })
    }
}

//! Name matching and exclusion.

use std::path::Path;

use filekit_core::FsError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::{Regex, RegexBuilder};

/// Compiled form of a name pattern.
#[derive(Debug, Clone)]
enum NamePattern {
    /// `*` / `?` wildcard, anchored, case-insensitive.
    Wildcard(Regex),
    /// `*.{jpg,png}`: files whose extension is listed.
    Extensions(Vec<String>),
    /// Case-insensitive substring.
    Substring(String),
    Regex(Regex),
}

/// Decides whether an entry name is wanted.
#[derive(Debug, Clone, Default)]
pub struct NameMatcher {
    extensions: Vec<String>,
    pattern: Option<NamePattern>,
}

impl NameMatcher {
    /// Match everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// Build a matcher from an extension allow-list and an optional pattern.
    ///
    /// With `use_regex` the pattern is a regular expression honoring
    /// `case_sensitive`; otherwise it is interpreted as a brace extension list,
    /// a wildcard, or a plain substring, always case-insensitively.
    pub fn new(
        extensions: &[String],
        pattern: Option<&str>,
        use_regex: bool,
        case_sensitive: bool,
    ) -> Result<Self, FsError> {
        let extensions = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        let pattern = match pattern.map(str::trim).filter(|p| !p.is_empty()) {
            None => None,
            Some(p) if use_regex => Some(NamePattern::Regex(
                RegexBuilder::new(p)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| FsError::invalid_pattern(p, e))?,
            )),
            Some(p) => Some(compile_glob_like(p)?),
        };

        Ok(Self {
            extensions,
            pattern,
        })
    }

    /// Whether `name` passes. The extension allow-list only applies to files.
    pub fn matches(&self, name: &str, is_directory: bool) -> bool {
        if !is_directory && !self.extensions.is_empty() {
            match extension_of(name) {
                Some(ext) if self.extensions.iter().any(|e| *e == ext) => {}
                _ => return false,
            }
        }

        match &self.pattern {
            None => true,
            Some(NamePattern::Wildcard(re)) | Some(NamePattern::Regex(re)) => re.is_match(name),
            Some(NamePattern::Extensions(list)) => {
                !is_directory
                    && extension_of(name).is_some_and(|ext| list.iter().any(|e| *e == ext))
            }
            Some(NamePattern::Substring(needle)) => name.to_lowercase().contains(needle),
        }
    }

    /// True when no constraint is configured.
    pub fn is_unrestricted(&self) -> bool {
        self.extensions.is_empty() && self.pattern.is_none()
    }
}

fn compile_glob_like(pattern: &str) -> Result<NamePattern, FsError> {
    if let Some(list) = pattern
        .strip_prefix("*.{")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        let extensions = list
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        return Ok(NamePattern::Extensions(extensions));
    }

    if pattern.contains(['*', '?']) {
        let body = regex::escape(pattern)
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        let re = RegexBuilder::new(&format!("^{body}$"))
            .case_insensitive(true)
            .build()
            .map_err(|e| FsError::invalid_pattern(pattern, e))?;
        return Ok(NamePattern::Wildcard(re));
    }

    Ok(NamePattern::Substring(pattern.to_lowercase()))
}

/// Lowercased extension of a file name, without the dot.
fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

/// Glob-based exclusion list.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    set: GlobSet,
    empty: bool,
}

impl Default for ExcludeSet {
    fn default() -> Self {
        Self {
            set: GlobSet::empty(),
            empty: true,
        }
    }
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Result<Self, FsError> {
        let mut builder = GlobSetBuilder::new();
        let mut count = 0;
        for pattern in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let glob = Glob::new(pattern).map_err(|e| FsError::invalid_pattern(pattern, e))?;
            builder.add(glob);
            count += 1;
        }
        let set = builder
            .build()
            .map_err(|e| FsError::invalid_pattern(patterns.join(", "), e))?;
        Ok(Self {
            set,
            empty: count == 0,
        })
    }

    /// Check the full path and the bare name against every pattern.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.empty {
            return false;
        }
        self.set.is_match(path) || path.file_name().is_some_and(|name| self.set.is_match(name))
    }
}

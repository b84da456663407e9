//! Rename rules and name validation.

use chrono::{DateTime, Local};
use filekit_core::FsError;
use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::conflict::split_extension;

/// Letter case applied by [`RenameRule::Case`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CaseMode {
    Upper,
    Lower,
    /// First letter of each space-separated word upper, the rest lower.
    Title,
}

/// How to derive a new name from an old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RenameRule {
    /// Replace every occurrence of `search` with `replace`.
    Replace {
        search: String,
        replace: String,
        #[serde(default)]
        use_regex: bool,
        #[serde(default)]
        case_insensitive: bool,
    },
    Prefix {
        prefix: String,
    },
    Suffix {
        suffix: String,
        /// Insert before the extension (`a_v2.txt`) rather than after it.
        #[serde(default = "default_true")]
        before_extension: bool,
    },
    /// Substitute `{name}`, `{ext}`, `{date}`, `{time}` and `{parent}`.
    Template {
        template: String,
    },
    /// `base_name` followed by `start + index`, zero-padded to `padding` digits.
    Sequence {
        base_name: String,
        #[serde(default = "default_start")]
        start: u64,
        #[serde(default)]
        padding: usize,
        #[serde(default = "default_true")]
        keep_extension: bool,
    },
    Case {
        case: CaseMode,
        #[serde(default)]
        include_extension: bool,
    },
    Regex {
        pattern: String,
        replacement: String,
        #[serde(default = "default_true")]
        global: bool,
        #[serde(default)]
        case_insensitive: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_start() -> u64 {
    1
}

/// What a rule is applied to.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub name: &'a str,
    /// Name of the containing directory.
    pub parent: &'a str,
    /// Position of the entry within its batch.
    pub index: usize,
    pub now: DateTime<Local>,
}

#[derive(Debug, Clone)]
enum Compiled {
    Substitute {
        regex: Regex,
        replacement: String,
        expand: bool,
        global: bool,
    },
    Plain,
}

/// A rule with its pattern compiled, ready to apply to many names.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: RenameRule,
    compiled: Compiled,
}

impl RenameRule {
    /// Compile any pattern the rule carries.
    pub fn compile(&self) -> Result<CompiledRule, FsError> {
        let compiled = match self {
            Self::Replace {
                search,
                replace,
                use_regex,
                case_insensitive,
            } => {
                let pattern = if *use_regex {
                    search.clone()
                } else {
                    regex::escape(search)
                };
                Compiled::Substitute {
                    regex: build_regex(&pattern, *case_insensitive)?,
                    replacement: if *use_regex {
                        normalize_replacement(replace)
                    } else {
                        replace.clone()
                    },
                    expand: *use_regex,
                    global: true,
                }
            }
            Self::Regex {
                pattern,
                replacement,
                global,
                case_insensitive,
            } => Compiled::Substitute {
                regex: build_regex(pattern, *case_insensitive)?,
                replacement: normalize_replacement(replacement),
                expand: true,
                global: *global,
            },
            _ => Compiled::Plain,
        };

        Ok(CompiledRule {
            rule: self.clone(),
            compiled,
        })
    }
}

fn build_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, FsError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| FsError::invalid_pattern(pattern, e))
}

/// Rewrite `$1` as `${1}` so a following letter never joins the group name.
fn normalize_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len() + 4);
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                out.push_str("$$");
                chars.next();
            }
            Some(d) if d.is_ascii_digit() => {
                out.push_str("${");
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    out.push(d);
                    chars.next();
                }
                out.push('}');
            }
            _ => out.push('$'),
        }
    }
    out
}

impl CompiledRule {
    /// Compute the new name for `input`.
    pub fn apply(&self, input: &RuleInput<'_>) -> String {
        let name = input.name;
        let (stem, extension) = split_extension(name);
        let with_ext = |base: String| match extension {
            Some(ext) => format!("{base}.{ext}"),
            None => base,
        };

        if let Compiled::Substitute {
            regex,
            replacement,
            expand,
            global,
        } = &self.compiled
        {
            if regex.as_str().is_empty() {
                return name.to_string();
            }
            let replaced = match (*expand, *global) {
                (true, true) => regex.replace_all(name, replacement.as_str()),
                (true, false) => regex.replace(name, replacement.as_str()),
                (false, true) => regex.replace_all(name, NoExpand(replacement.as_str())),
                (false, false) => regex.replace(name, NoExpand(replacement.as_str())),
            };
            return replaced.into_owned();
        }

        match &self.rule {
            RenameRule::Prefix { prefix } => format!("{prefix}{name}"),
            RenameRule::Suffix {
                suffix,
                before_extension,
            } => {
                if *before_extension {
                    with_ext(format!("{stem}{suffix}"))
                } else {
                    format!("{name}{suffix}")
                }
            }
            RenameRule::Template { template } => template
                .replace("{name}", stem)
                .replace("{ext}", extension.unwrap_or(""))
                .replace("{date}", &input.now.format("%Y-%m-%d").to_string())
                .replace("{time}", &input.now.format("%H-%M-%S").to_string())
                .replace("{parent}", input.parent),
            RenameRule::Sequence {
                base_name,
                start,
                padding,
                keep_extension,
            } => {
                let number = start.saturating_add(input.index as u64);
                let base = format!("{base_name}{number:0padding$}", padding = *padding);
                if *keep_extension {
                    with_ext(base)
                } else {
                    base
                }
            }
            RenameRule::Case {
                case,
                include_extension,
            } => {
                if *include_extension {
                    convert_case(name, *case)
                } else {
                    with_ext(convert_case(stem, *case))
                }
            }
            RenameRule::Replace { .. } | RenameRule::Regex { .. } => name.to_string(),
        }
    }
}

fn convert_case(text: &str, case: CaseMode) -> String {
    match case {
        CaseMode::Upper => text.to_uppercase(),
        CaseMode::Lower => text.to_lowercase(),
        CaseMode::Title => text
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

const RESERVED_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a filename for cross-platform compatibility.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }

    // Check for . and .. which are reserved
    if name == "." || name == ".." {
        return Err("'.' and '..' are reserved names".into());
    }

    if name.len() > 255 {
        return Err("Name is too long (max 255 bytes)".into());
    }

    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c) || c.is_control()) {
        return Err(format!("Name cannot contain {c:?}"));
    }

    if name.starts_with(' ') || name.ends_with(' ') {
        return Err("Name cannot start or end with spaces".into());
    }

    if name.ends_with('.') {
        return Err("Name cannot end with a dot".into());
    }

    #[cfg(target_os = "windows")]
    {
        let reserved = [
            "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
            "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
        ];
        let upper_name = name.to_uppercase();
        let base_name = upper_name.split('.').next().unwrap_or("");
        if reserved.contains(&base_name) {
            return Err("Reserved filename".into());
        }
    }

    Ok(())
}

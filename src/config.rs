use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::descriptor::internal_name;
use crate::error::ShakeError;
use crate::rta::DispatchMode;

/// `key=value` pairs in `java.util.Properties` text format.
#[derive(Clone, Debug, Default)]
pub(crate) struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub(crate) fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let mut logical = line.to_string();
            while ends_with_continuation(&logical) {
                logical.pop();
                match lines.next() {
                    Some(next) => logical.push_str(next.trim_start()),
                    None => break,
                }
            }
            let (key, value) = split_entry(&logical);
            values.insert(unescape(key), unescape(value));
        }
        Self { values }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        self.get(key).map(|value| parse_bool(key, value)).transpose()
    }
}

/// Odd number of trailing backslashes.
fn ends_with_continuation(line: &str) -> bool {
    line.bytes().rev().take_while(|byte| *byte == b'\\').count() % 2 == 1
}

/// Key ends at the first unescaped `=`, `:` or whitespace.
fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    let mut key_end = line.len();
    for (index, ch) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '=' || ch == ':' || ch.is_whitespace() {
            key_end = index;
            break;
        }
    }
    let key = &line[..key_end];
    let mut rest = line[key_end..].trim_start();
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start();
    }
    (key, rest)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => out.push_str(&hex),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => anyhow::bail!("invalid boolean for {key}: {other}"),
    }
}

fn split_class_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|name| !name.is_empty())
}

/// Values given on the command line; they win over the properties file.
#[derive(Clone, Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) input: Option<PathBuf>,
    pub(crate) output: Option<PathBuf>,
    pub(crate) main_class: Option<String>,
    pub(crate) keep: Vec<String>,
    pub(crate) classes_only: bool,
    pub(crate) dispatch: Option<DispatchMode>,
    pub(crate) no_reflection_strings: bool,
    pub(crate) classpath: Vec<PathBuf>,
}

/// Validated run configuration. Class names are in internal form.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) input: PathBuf,
    pub(crate) output: PathBuf,
    pub(crate) main_class: String,
    pub(crate) keep_classes: Vec<String>,
    pub(crate) classes_only: bool,
    pub(crate) dispatch: DispatchMode,
    pub(crate) reflection_strings: bool,
    pub(crate) classpath: Vec<PathBuf>,
}

impl Settings {
    pub(crate) fn resolve(properties: &Properties, overrides: Overrides) -> Result<Self> {
        let input = overrides
            .input
            .or_else(|| properties.get("inputJar").map(PathBuf::from))
            .ok_or(ShakeError::MissingSetting("inputJar"))?;
        let output = overrides
            .output
            .or_else(|| properties.get("outputJar").map(PathBuf::from))
            .ok_or(ShakeError::MissingSetting("outputJar"))?;
        let main_class = overrides
            .main_class
            .as_deref()
            .or_else(|| properties.get("mainMethodClass"))
            .map(internal_name)
            .filter(|name| !name.is_empty())
            .ok_or(ShakeError::MissingSetting("mainMethodClass"))?;

        let is_jar = output
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("jar"));
        if !is_jar {
            return Err(ShakeError::MalformedOutputTarget(output).into());
        }

        let mut keep_classes: Vec<String> = properties
            .get("keepClasses")
            .map(|value| split_class_list(value).map(internal_name).collect())
            .unwrap_or_default();
        for value in &overrides.keep {
            keep_classes.extend(split_class_list(value).map(internal_name));
        }
        keep_classes.dedup();

        let classes_only =
            overrides.classes_only || properties.flag("noUnusedMethodRemoval")?.unwrap_or(false);
        let dispatch = match overrides.dispatch {
            Some(dispatch) => dispatch,
            None => match properties.get("dispatch") {
                Some(value) => value
                    .parse()
                    .map_err(|err: String| anyhow::anyhow!("invalid dispatch: {err}"))?,
                None => DispatchMode::default(),
            },
        };
        let reflection_strings =
            !overrides.no_reflection_strings && properties.flag("reflectionStrings")?.unwrap_or(true);

        Ok(Self {
            input,
            output,
            main_class,
            keep_classes,
            classes_only,
            dispatch,
            reflection_strings,
            classpath: overrides.classpath,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"# shaker settings
inputJar = build/app.jar
outputJar: build/app-min.jar
mainMethodClass=com.example.Main
keepClasses = com.example.Plugin, \
    com.example.Other
! legacy comment
noUnusedMethodRemoval=true
";

    #[test]
    fn parse_handles_separators_comments_and_continuations() {
        let properties = Properties::parse(SAMPLE);

        assert_eq!(properties.get("inputJar"), Some("build/app.jar"));
        assert_eq!(properties.get("outputJar"), Some("build/app-min.jar"));
        assert_eq!(properties.get("mainMethodClass"), Some("com.example.Main"));
        assert_eq!(
            properties.get("keepClasses"),
            Some("com.example.Plugin, com.example.Other")
        );
        assert_eq!(properties.get("noUnusedMethodRemoval"), Some("true"));
        assert_eq!(properties.get("legacy"), None);
    }

    #[test]
    fn parse_unescapes_keys_and_values() {
        let properties = Properties::parse("path\\ name=a\\tb\\u0041\nempty\n");

        assert_eq!(properties.get("path name"), Some("a\tbA"));
        assert_eq!(properties.get("empty"), Some(""));
    }

    #[test]
    fn resolve_reads_file_values_in_internal_form() {
        let settings = Settings::resolve(&Properties::parse(SAMPLE), Overrides::default()).expect("settings");

        assert_eq!(settings.input, PathBuf::from("build/app.jar"));
        assert_eq!(settings.main_class, "com/example/Main");
        assert_eq!(settings.keep_classes, vec!["com/example/Plugin", "com/example/Other"]);
        assert!(settings.classes_only);
        assert_eq!(settings.dispatch, DispatchMode::Rta);
        assert!(settings.reflection_strings);
    }

    #[test]
    fn command_line_overrides_file() {
        let overrides = Overrides {
            output: Some(PathBuf::from("out/shaken.jar")),
            main_class: Some("com/example/Cli".to_string()),
            keep: vec!["com.example.Extra".to_string()],
            dispatch: Some(DispatchMode::ChaPrune),
            no_reflection_strings: true,
            ..Overrides::default()
        };
        let settings = Settings::resolve(&Properties::parse(SAMPLE), overrides).expect("settings");

        assert_eq!(settings.output, PathBuf::from("out/shaken.jar"));
        assert_eq!(settings.main_class, "com/example/Cli");
        assert_eq!(settings.keep_classes.last().map(String::as_str), Some("com/example/Extra"));
        assert_eq!(settings.dispatch, DispatchMode::ChaPrune);
        assert!(!settings.reflection_strings);
    }

    #[test]
    fn resolve_rejects_missing_and_malformed_settings() {
        let error = Settings::resolve(&Properties::parse("outputJar=a.jar\n"), Overrides::default())
            .expect_err("missing input");
        assert!(matches!(
            error.downcast_ref::<ShakeError>(),
            Some(ShakeError::MissingSetting("inputJar"))
        ));

        let error = Settings::resolve(
            &Properties::parse("inputJar=a.jar\noutputJar=b.zip\nmainMethodClass=a.Main\n"),
            Overrides::default(),
        )
        .expect_err("bad output");
        assert!(matches!(
            error.downcast_ref::<ShakeError>(),
            Some(ShakeError::MalformedOutputTarget(_))
        ));

        let error = Settings::resolve(
            &Properties::parse("inputJar=a.jar\noutputJar=b.jar\nmainMethodClass=a.Main\ndispatch=fast\n"),
            Overrides::default(),
        )
        .expect_err("bad dispatch");
        assert!(error.to_string().contains("invalid dispatch"));
    }
}

//! Directives embedded in cell source.
//!
//! Two families are recognised, one per line:
//!
//! ```text
//! %use kandy, lets-plot@8a2e9b1(api=4.0.0), @file[libs/local.json](x=1)
//! %useLatestDescriptors -off
//! @file:DependsOn("org.jetbrains.kotlinx:kandy:0.5.0")
//! @file:Repository("https://repo.maven.apache.org/maven2/")
//! @file:CompilerArgs("-opt-in=kotlin.RequiresOptIn")
//! ```
//!
//! Directive lines are blanked in the remaining source so that diagnostics
//! reported by the evaluator keep their line numbers.

use std::path::PathBuf;

use url::Url;

use crate::ResolutionError;

const FILE_ANNOTATION: &str = "@file:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Use(Vec<LibraryReference>),
    UseLatestDescriptors(bool),
    DependsOn(String),
    Repository(String),
    CompilerArgs(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibrarySource {
    /// Looked up by name, optionally pinned to a ref of the descriptors repository.
    Named {
        name: String,
        git_ref: Option<String>,
    },
    File(PathBuf),
    Url(Url),
}

impl LibrarySource {
    pub fn display_name(&self) -> String {
        match self {
            LibrarySource::Named { name, .. } => name.clone(),
            LibrarySource::File(path) => path.display().to_string(),
            LibrarySource::Url(url) => url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: Option<String>,
    pub value: String,
}

impl Argument {
    pub fn positional(value: impl Into<String>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryReference {
    pub source: LibrarySource,
    pub arguments: Vec<Argument>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCell {
    pub directives: Vec<Directive>,
    pub code: String,
}

impl ParsedCell {
    pub fn has_code(&self) -> bool {
        !self.code.trim().is_empty()
    }
}

pub fn parse_cell(code: &str) -> Result<ParsedCell, ResolutionError> {
    let mut directives = Vec::new();
    let mut remaining = Vec::new();

    for line in code.lines() {
        let trimmed = line.trim();

        if let Some(magic) = trimmed.strip_prefix('%') {
            directives.push(parse_magic(magic)?);
            remaining.push("");
        } else if let Some(annotation) = trimmed.strip_prefix(FILE_ANNOTATION) {
            match parse_annotation(trimmed, annotation)? {
                Some(found) => {
                    directives.extend(found);
                    remaining.push("");
                }
                None => remaining.push(line),
            }
        } else {
            remaining.push(line);
        }
    }

    Ok(ParsedCell {
        directives,
        code: remaining.join("\n"),
    })
}

fn syntax(directive: &str, reason: impl Into<String>) -> ResolutionError {
    ResolutionError::Syntax {
        directive: directive.to_string(),
        reason: reason.into(),
    }
}

fn parse_magic(text: &str) -> Result<Directive, ResolutionError> {
    let (name, rest) = match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim()),
        None => (text, ""),
    };

    match name {
        "use" => parse_use(rest).map(Directive::Use),
        "useLatestDescriptors" => match rest {
            "" | "-on" | "on" => Ok(Directive::UseLatestDescriptors(true)),
            "-off" | "off" => Ok(Directive::UseLatestDescriptors(false)),
            other => Err(syntax(
                text,
                format!("expected `-on` or `-off`, found `{other}`"),
            )),
        },
        other => Err(ResolutionError::UnknownMagic(other.to_string())),
    }
}

fn parse_use(text: &str) -> Result<Vec<LibraryReference>, ResolutionError> {
    if text.is_empty() {
        return Err(syntax("%use", "expected at least one library"));
    }

    split_top_level(text, ',')
        .map_err(|reason| syntax(text, reason))?
        .into_iter()
        .map(parse_reference)
        .collect()
}

fn parse_reference(text: &str) -> Result<LibraryReference, ResolutionError> {
    if text.is_empty() {
        return Err(syntax(text, "empty library reference"));
    }

    let (head, arguments) = split_arguments(text).map_err(|reason| syntax(text, reason))?;
    let arguments = parse_arguments(arguments).map_err(|reason| syntax(text, reason))?;

    let source = if let Some(locator) = head.strip_prefix('@') {
        if let Some(path) = bracketed(locator, "file") {
            LibrarySource::File(PathBuf::from(path))
        } else if let Some(url) = bracketed(locator, "url") {
            Url::parse(url)
                .map(LibrarySource::Url)
                .map_err(|e| syntax(text, e.to_string()))?
        } else if locator.is_empty() {
            return Err(syntax(text, "missing location after `@`"));
        } else {
            source_from_locator(locator)
        }
    } else {
        let (name, git_ref) = match head.split_once('@') {
            Some((name, git_ref)) => (name.trim(), Some(git_ref.trim())),
            None => (head, None),
        };

        if !is_library_name(name) {
            return Err(syntax(text, format!("`{name}` is not a valid library name")));
        }
        if git_ref.is_some_and(str::is_empty) {
            return Err(syntax(text, "empty ref after `@`"));
        }

        LibrarySource::Named {
            name: name.to_string(),
            git_ref: git_ref.map(str::to_string),
        }
    };

    Ok(LibraryReference { source, arguments })
}

fn source_from_locator(locator: &str) -> LibrarySource {
    match Url::parse(locator) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => LibrarySource::Url(url),
        _ => LibrarySource::File(PathBuf::from(locator)),
    }
}

fn bracketed<'a>(locator: &'a str, keyword: &str) -> Option<&'a str> {
    locator
        .strip_prefix(keyword)?
        .strip_prefix('[')?
        .strip_suffix(']')
        .map(str::trim)
}

fn is_library_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Splits `head(args)` into `head` and `args`. A `(` inside `[...]` belongs to the head.
fn split_arguments(text: &str) -> Result<(&str, &str), &'static str> {
    let mut depth = 0usize;
    let mut open = None;

    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '(' if depth == 0 => {
                open = Some(i);
                break;
            }
            _ => {}
        }
    }

    let Some(open) = open else {
        return Ok((text.trim(), ""));
    };

    let inner = text[open + 1..]
        .strip_suffix(')')
        .ok_or("arguments must end with `)`")?;

    Ok((text[..open].trim(), inner))
}

fn parse_arguments(text: &str) -> Result<Vec<Argument>, String> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    split_top_level(text, ',')?
        .into_iter()
        .map(|item| {
            if item.is_empty() {
                return Err("empty argument".to_string());
            }

            match item.split_once('=') {
                Some((name, value)) if !name.trim_start().starts_with('"') => {
                    let name = name.trim();
                    if !is_identifier(name) {
                        return Err(format!("`{name}` is not a valid parameter name"));
                    }
                    Ok(Argument::named(name, unquote(value)))
                }
                _ => Ok(Argument::positional(unquote(item))),
            }
        })
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    match value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

fn split_top_level(text: &str, separator: char) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '(' | '[' if !in_quotes => depth += 1,
            ')' | ']' if !in_quotes => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced brackets".to_string());
                }
            }
            c if c == separator && depth == 0 && !in_quotes => {
                parts.push(text[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if depth != 0 || in_quotes {
        return Err("unbalanced brackets or quotes".to_string());
    }

    parts.push(text[start..].trim());
    Ok(parts)
}

/// `None` when the annotation is not one of ours and must stay in the source.
fn parse_annotation(line: &str, text: &str) -> Result<Option<Vec<Directive>>, ResolutionError> {
    let Some(open) = text.find('(') else {
        return Ok(None);
    };

    let name = text[..open].trim();
    if !matches!(name, "DependsOn" | "Repository" | "CompilerArgs") {
        return Ok(None);
    }

    let inner = text[open + 1..]
        .trim_end()
        .strip_suffix(')')
        .ok_or_else(|| syntax(line, "annotation must end with `)`"))?;

    let values = split_top_level(inner, ',')
        .map_err(|reason| syntax(line, reason))?
        .into_iter()
        .map(|value| {
            let is_quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
            if is_quoted {
                Ok(unquote(value))
            } else {
                Err(syntax(line, format!("expected a string literal, found `{value}`")))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if name == "CompilerArgs" {
        return Ok(Some(vec![Directive::CompilerArgs(values)]));
    }

    if values.iter().any(String::is_empty) {
        return Err(syntax(line, "expected a non-empty value"));
    }

    let directives = values
        .into_iter()
        .map(|value| match name {
            "DependsOn" => Directive::DependsOn(value),
            _ => Directive::Repository(value),
        })
        .collect();

    Ok(Some(directives))
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn named(name: &str, git_ref: Option<&str>) -> LibrarySource {
        LibrarySource::Named {
            name: name.to_string(),
            git_ref: git_ref.map(str::to_string),
        }
    }

    #[googletest::test]
    fn plain_code_passes_through_untouched() {
        let cell = parse_cell("val x = 1\nx % 2").unwrap();

        expect_that!(cell.directives, empty());
        expect_that!(cell.code, eq("val x = 1\nx % 2"));
    }

    #[googletest::test]
    fn use_magic_is_removed_from_the_code() {
        let cell = parse_cell("%use some-lib(param=42)\nx").unwrap();

        expect_that!(cell.code, eq("\nx"));
        expect_that!(
            cell.directives,
            elements_are![eq(Directive::Use(vec![LibraryReference {
                source: named("some-lib", None),
                arguments: vec![Argument::named("param", "42")],
            }]))]
        );
    }

    #[googletest::test]
    fn use_magic_accepts_several_libraries_with_refs_and_positional_arguments() {
        let cell = parse_cell("%use krangl(0.16.2), lets-plot@cfcf825(api=2.0.1, \"a,b\")").unwrap();

        let Directive::Use(references) = &cell.directives[0] else {
            panic!("expected %use, got {:?}", cell.directives);
        };
        expect_that!(references.len(), eq(2));
        expect_that!(references[0].source, eq(named("krangl", None)));
        expect_that!(references[0].arguments, elements_are![eq(Argument::positional("0.16.2"))]);
        expect_that!(references[1].source, eq(named("lets-plot", Some("cfcf825"))));
        expect_that!(
            references[1].arguments,
            elements_are![eq(Argument::named("api", "2.0.1")), eq(Argument::positional("a,b"))]
        );
    }

    #[googletest::test]
    fn explicit_file_url_and_bare_locators_are_recognised() {
        let cell = parse_cell(
            "%use @file[src/test-init.json](name=x, value=42)\n\
             %use @url[https://example.com/lib.json]\n\
             %use @libs/local.json(name=z)\n\
             %use @https://example.com/other.json",
        )
        .unwrap();

        let sources: Vec<LibrarySource> = cell
            .directives
            .iter()
            .map(|directive| match directive {
                Directive::Use(references) => references[0].source.clone(),
                other => panic!("unexpected directive {other:?}"),
            })
            .collect();

        expect_that!(
            sources,
            elements_are![
                eq(LibrarySource::File(PathBuf::from("src/test-init.json"))),
                eq(LibrarySource::Url(Url::parse("https://example.com/lib.json").unwrap())),
                eq(LibrarySource::File(PathBuf::from("libs/local.json"))),
                eq(LibrarySource::Url(Url::parse("https://example.com/other.json").unwrap())),
            ]
        );
    }

    #[googletest::test]
    fn use_latest_descriptors_toggles() {
        let cell = parse_cell("%useLatestDescriptors\n%useLatestDescriptors -off").unwrap();

        expect_that!(
            cell.directives,
            elements_are![
                eq(Directive::UseLatestDescriptors(true)),
                eq(Directive::UseLatestDescriptors(false))
            ]
        );
        expect_that!(
            parse_cell("%useLatestDescriptors maybe"),
            pat!(Err(pat!(ResolutionError::Syntax { directive: anything(), reason: anything() })))
        );
    }

    #[googletest::test]
    fn file_annotations_become_directives() {
        let cell = parse_cell(
            "@file:Repository(\"https://repo.osgeo.org/repository/release/\")\n\
             @file:DependsOn(\"org.geotools:gt-shapefile:[23,)\")\n\
             @file:CompilerArgs(\"-Xopt-in=kotlin.RequiresOptIn\", \"-jvm-target=11\")\n\
             @file:Suppress(\"UNUSED\")\n\
             val a = 1",
        )
        .unwrap();

        expect_that!(
            cell.directives,
            elements_are![
                eq(Directive::Repository(
                    "https://repo.osgeo.org/repository/release/".to_string()
                )),
                eq(Directive::DependsOn("org.geotools:gt-shapefile:[23,)".to_string())),
                eq(Directive::CompilerArgs(vec![
                    "-Xopt-in=kotlin.RequiresOptIn".to_string(),
                    "-jvm-target=11".to_string()
                ])),
            ]
        );
        expect_that!(cell.code, eq("\n\n\n@file:Suppress(\"UNUSED\")\nval a = 1"));
    }

    #[googletest::test]
    fn malformed_directives_are_rejected() {
        expect_that!(parse_cell("%use"), pat!(Err(pat!(ResolutionError::Syntax { directive: anything(), reason: anything() }))));
        expect_that!(parse_cell("%use lib(x=1"), pat!(Err(pat!(ResolutionError::Syntax { directive: anything(), reason: anything() }))));
        expect_that!(parse_cell("%use bad name"), pat!(Err(pat!(ResolutionError::Syntax { directive: anything(), reason: anything() }))));
        expect_that!(parse_cell("%use lib@"), pat!(Err(pat!(ResolutionError::Syntax { directive: anything(), reason: anything() }))));
        expect_that!(
            parse_cell("@file:DependsOn(notAString)"),
            pat!(Err(pat!(ResolutionError::Syntax { directive: anything(), reason: anything() })))
        );
        expect_that!(parse_cell("%trackExecution"), pat!(Err(pat!(ResolutionError::UnknownMagic(anything())))));
    }

    #[googletest::test]
    fn cell_with_only_directives_has_no_code() {
        let cell = parse_cell("%use lib\n   \n").unwrap();

        expect_that!(cell.has_code(), eq(false));
    }
}

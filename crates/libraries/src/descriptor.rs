use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::{directive::Argument, ResolutionError};

/// A library descriptor as stored in `<name>.json`.
///
/// Every string field may reference parameters as `$name` or `${name}`;
/// they are bound by [`LibraryDescriptor::bind`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDescriptor {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "properties")]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default)]
    pub shutdown: Vec<String>,
    #[serde(default, alias = "compilerArgs")]
    pub compiler_arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// Properties come either as an object (`{"v": "1.0"}`) or as a list of
/// `{"name", "value"}` pairs. Declaration order matters for positional arguments.
fn properties<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Property>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Properties {
        Object(Map<String, Value>),
        List(Vec<Property>),
    }

    Ok(match Properties::deserialize(deserializer)? {
        Properties::Object(map) => map
            .into_iter()
            .map(|(name, value)| Property {
                name,
                value: match value {
                    Value::String(value) => value,
                    other => other.to_string(),
                },
            })
            .collect(),
        Properties::List(list) => list,
    })
}

impl LibraryDescriptor {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Binds `arguments` to the declared properties and substitutes them.
    ///
    /// Positional arguments fill properties in declaration order; named
    /// arguments override by name.
    pub fn bind(&self, library: &str, arguments: &[Argument]) -> Result<LibraryDescriptor, ResolutionError> {
        let mut values: Vec<(String, String)> = self
            .properties
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();

        let mut position = 0;
        for argument in arguments {
            let slot = match &argument.name {
                Some(name) => values.iter().position(|(n, _)| n == name).ok_or_else(|| {
                    ResolutionError::Arguments {
                        library: library.to_string(),
                        reason: format!("unknown parameter `{name}`"),
                    }
                })?,
                None => {
                    let slot = position;
                    position += 1;
                    if slot >= values.len() {
                        return Err(ResolutionError::Arguments {
                            library: library.to_string(),
                            reason: format!(
                                "expected at most {} positional argument(s)",
                                values.len()
                            ),
                        });
                    }
                    slot
                }
            };
            values[slot].1 = argument.value.clone();
        }

        let apply = |lines: &[String]| -> Vec<String> {
            lines.iter().map(|line| substitute(line, &values)).collect()
        };

        Ok(LibraryDescriptor {
            description: self.description.as_deref().map(|d| substitute(d, &values)),
            link: self.link.as_deref().map(|l| substitute(l, &values)),
            properties: values
                .iter()
                .map(|(name, value)| Property {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            repositories: apply(&self.repositories),
            dependencies: apply(&self.dependencies),
            imports: apply(&self.imports),
            init: apply(&self.init),
            shutdown: apply(&self.shutdown),
            compiler_arguments: apply(&self.compiler_arguments),
        })
    }
}

/// Replaces `$name` and `${name}` for known names; anything else is left verbatim.
fn substitute(text: &str, values: &[(String, String)]) -> String {
    let lookup = |name: &str| {
        values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(dollar) = rest.find('$') {
        output.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(close) = braced.find('}') {
                if let Some(value) = lookup(&braced[..close]) {
                    output.push_str(value);
                    rest = &braced[close + 1..];
                    continue;
                }
            }
        } else {
            let end = after
                .char_indices()
                .find(|&(i, c)| !(c == '_' || c.is_alphanumeric()) || (i == 0 && c.is_numeric()))
                .map_or(after.len(), |(i, _)| i);
            if let Some(value) = lookup(&after[..end]).filter(|_| end > 0) {
                output.push_str(value);
                rest = &after[end..];
                continue;
            }
        }

        output.push('$');
        rest = after;
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[googletest::test]
    fn descriptor_fields_are_read_from_json() {
        let descriptor = LibraryDescriptor::parse(
            r#"{
                "description": "Data frames",
                "properties": { "v": "0.16.2", "flag": true },
                "repositories": ["https://jitpack.io"],
                "dependencies": ["com.example:frames:$v"],
                "imports": ["com.example.frames.*"],
                "init": ["val version = \"$v\""],
                "compilerArgs": ["-Xcontext-receivers"]
            }"#,
        )
        .unwrap();

        expect_that!(descriptor.description.as_deref(), eq(Some("Data frames")));
        expect_that!(
            descriptor.properties,
            elements_are![
                eq(Property { name: "v".to_string(), value: "0.16.2".to_string() }),
                eq(Property { name: "flag".to_string(), value: "true".to_string() }),
            ]
        );
        expect_that!(descriptor.compiler_arguments, elements_are![eq("-Xcontext-receivers")]);
        expect_that!(descriptor.shutdown, empty());
    }

    #[googletest::test]
    fn properties_may_be_listed_as_pairs() {
        let descriptor = LibraryDescriptor::parse(
            r#"{ "properties": [ { "name": "api", "value": "1.0" } ] }"#,
        )
        .unwrap();

        expect_that!(descriptor.properties.len(), eq(1));
        expect_that!(descriptor.properties[0].name, eq("api"));
    }

    #[googletest::test]
    fn named_and_positional_arguments_are_substituted() {
        let descriptor = LibraryDescriptor::parse(
            r#"{
                "properties": { "name": "x", "value": "0" },
                "init": ["val $name = $value", "val copy = ${name}s"]
            }"#,
        )
        .unwrap();

        let bound = descriptor
            .bind("test-init", &[Argument::positional("y"), Argument::named("value", "42")])
            .unwrap();

        expect_that!(bound.init, elements_are![eq("val y = 42"), eq("val copy = ys")]);
    }

    #[googletest::test]
    fn defaults_apply_when_arguments_are_missing() {
        let descriptor =
            LibraryDescriptor::parse(r#"{ "properties": { "v": "1.2" }, "dependencies": ["g:a:$v"] }"#)
                .unwrap();

        let bound = descriptor.bind("lib", &[]).unwrap();

        expect_that!(bound.dependencies, elements_are![eq("g:a:1.2")]);
    }

    #[googletest::test]
    fn unknown_or_surplus_arguments_are_rejected() {
        let descriptor = LibraryDescriptor::parse(r#"{ "properties": { "v": "1" } }"#).unwrap();

        expect_that!(
            descriptor.bind("lib", &[Argument::named("nope", "1")]),
            pat!(Err(pat!(ResolutionError::Arguments { library: eq("lib"), reason: anything() })))
        );
        expect_that!(
            descriptor.bind("lib", &[Argument::positional("1"), Argument::positional("2")]),
            pat!(Err(pat!(ResolutionError::Arguments { library: eq("lib"), reason: anything() })))
        );
    }

    #[googletest::test]
    fn unknown_references_and_lone_dollars_are_kept() {
        let values = vec![("a".to_string(), "1".to_string())];

        expect_that!(substitute("$a $b ${c} $ $1 ${a}", &values), eq("1 $b ${c} $ $1 1"));
        expect_that!(substitute("price: 5$", &values), eq("price: 5$"));
    }
}

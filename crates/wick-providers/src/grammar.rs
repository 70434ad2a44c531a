//! Compile JSON schemas and regular expressions into GBNF grammars for
//! constrained decoding.
//!
//! Every value rule consumes its own trailing whitespace, so object and array
//! rules only need whitespace after punctuation.

use anyhow::Result;
use regex_syntax::hir::{Class, Hir, HirKind};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt::Write as _;

const WS_RULE: &str = r#"[ \t\n]*"#;
const STRING_RULE: &str = r#""\"" ( [^"\\\x7F\x00-\x1F] | "\\" ( ["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] ) )* "\"" ws"#;
const NUMBER_RULE: &str = r#""-"? ( [0-9] | [1-9] [0-9]* ) ( "." [0-9]+ )? ( [eE] [-+]? [0-9]+ )? ws"#;
const INTEGER_RULE: &str = r#""-"? ( [0-9] | [1-9] [0-9]* ) ws"#;
const BOOLEAN_RULE: &str = r#"( "true" | "false" ) ws"#;
const NULL_RULE: &str = r#""null" ws"#;
const VALUE_RULE: &str = "object | array | string | number | boolean | null";
const OBJECT_RULE: &str = r#""{" ws ( string ":" ws value ( "," ws string ":" ws value )* )? "}" ws"#;
const ARRAY_RULE: &str = r#""[" ws ( value ( "," ws value )* )? "]" ws"#;

/// Largest counted repetition expanded from a regex
const MAX_REPEAT: u32 = 256;

/// Repeated sub-expressions longer than this become a named rule instead of
/// being copied, so nested repetitions grow linearly.
const INLINE_REPEAT_LEN: usize = 64;

#[derive(Default)]
struct GrammarBuilder {
    rules: Vec<(String, String)>,
    names: HashSet<String>,
}

impl GrammarBuilder {
    fn add_rule(&mut self, name: &str, body: String) -> String {
        let base = sanitize(name);
        let mut candidate = base.clone();
        let mut n = 1;
        while self.names.contains(&candidate) {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        self.names.insert(candidate.clone());
        self.rules.push((candidate.clone(), body));
        candidate
    }

    /// Add one of the shared JSON primitive rules (and what it refers to), once
    fn primitive(&mut self, name: &str) -> String {
        if self.names.contains(name) {
            return name.to_string();
        }
        if name == "ws" {
            return self.add_rule("ws", WS_RULE.to_string());
        }
        self.primitive("ws");

        let (body, deps): (&str, &[&str]) = match name {
            "string" => (STRING_RULE, &[]),
            "number" => (NUMBER_RULE, &[]),
            "integer" => (INTEGER_RULE, &[]),
            "boolean" => (BOOLEAN_RULE, &[]),
            "null" => (NULL_RULE, &[]),
            "value" => (
                VALUE_RULE,
                &["object", "array", "string", "number", "boolean", "null"],
            ),
            "object" => (OBJECT_RULE, &["string", "value"]),
            "array" => (ARRAY_RULE, &["value"]),
            _ => unreachable!("unknown primitive {}", name),
        };
        let rule = self.add_rule(name, body.to_string());
        for dep in deps {
            self.primitive(dep);
        }
        rule
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (name, body) in &self.rules {
            let _ = writeln!(out, "{} ::= {}", name, body);
        }
        out
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "rule".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Quote `text` as a GBNF string literal.
fn literal(text: &str) -> String {
    let mut out = String::from("\"");
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7F => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Escape a character for use inside a GBNF `[...]` class.
fn class_char(c: char) -> String {
    match c {
        ']' | '[' | '\\' | '-' | '^' => format!("\\{}", c),
        '\n' => "\\n".to_string(),
        '\r' => "\\r".to_string(),
        '\t' => "\\t".to_string(),
        c if (c as u32) < 0x20 || c as u32 == 0x7F => format!("\\x{:02X}", c as u32),
        c if (c as u32) > 0xFFFF => format!("\\U{:08X}", c as u32),
        c => c.to_string(),
    }
}

/// Compile a JSON schema into a GBNF grammar whose root is `root`.
pub fn schema_to_gbnf(schema: &Value) -> Result<String> {
    if !schema.is_object() && !schema.is_boolean() {
        anyhow::bail!("JSON schema must be an object, got: {}", schema);
    }
    let mut builder = GrammarBuilder::default();
    builder.names.insert("root".to_string());
    let body = schema_rule(&mut builder, schema, "root")?;
    builder.rules.insert(0, ("root".to_string(), body));
    Ok(builder.render())
}

/// Return a rule body matching `schema`. Nested schemas get their own rules.
fn schema_rule(builder: &mut GrammarBuilder, schema: &Value, name: &str) -> Result<String> {
    let obj = match schema {
        Value::Bool(true) => return Ok(builder.primitive("value")),
        Value::Bool(false) => anyhow::bail!("Schema 'false' at '{}' accepts no value", name),
        Value::Object(obj) => obj,
        other => anyhow::bail!("Invalid schema at '{}': {}", name, other),
    };

    if let Some(reference) = obj.get("$ref") {
        anyhow::bail!("Unsupported schema keyword $ref ({}) at '{}'", reference, name);
    }

    if let Some(value) = obj.get("const") {
        builder.primitive("ws");
        return Ok(format!("{} ws", literal(&serde_json::to_string(value)?)));
    }

    if let Some(values) = obj.get("enum") {
        let values = values
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("'enum' at '{}' must be an array", name))?;
        if values.is_empty() {
            anyhow::bail!("'enum' at '{}' has no values", name);
        }
        builder.primitive("ws");
        let alternatives = values
            .iter()
            .map(|v| Ok(literal(&serde_json::to_string(v)?)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(format!("( {} ) ws", alternatives.join(" | ")));
    }

    for keyword in ["anyOf", "oneOf"] {
        if let Some(options) = obj.get(keyword) {
            let options = options
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("'{}' at '{}' must be an array", keyword, name))?;
            let mut alternatives = Vec::with_capacity(options.len());
            for (i, option) in options.iter().enumerate() {
                let sub_name = format!("{}-{}", name, i);
                let body = schema_rule(builder, option, &sub_name)?;
                alternatives.push(builder.add_rule(&sub_name, body));
            }
            return Ok(alternatives.join(" | "));
        }
    }

    match obj.get("type") {
        Some(Value::String(ty)) => typed_rule(builder, obj, ty, name),
        Some(Value::Array(types)) => {
            let mut alternatives = Vec::with_capacity(types.len());
            for ty in types {
                let ty = ty
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("Invalid type list at '{}'", name))?;
                let sub_name = format!("{}-{}", name, ty);
                let body = typed_rule(builder, obj, ty, &sub_name)?;
                alternatives.push(builder.add_rule(&sub_name, body));
            }
            Ok(alternatives.join(" | "))
        }
        Some(other) => anyhow::bail!("Invalid 'type' at '{}': {}", name, other),
        None if obj.contains_key("properties") => typed_rule(builder, obj, "object", name),
        None => Ok(builder.primitive("value")),
    }
}

fn typed_rule(
    builder: &mut GrammarBuilder,
    obj: &Map<String, Value>,
    ty: &str,
    name: &str,
) -> Result<String> {
    match ty {
        "string" => Ok(builder.primitive("string")),
        "number" => Ok(builder.primitive("number")),
        "integer" => Ok(builder.primitive("integer")),
        "boolean" => Ok(builder.primitive("boolean")),
        "null" => Ok(builder.primitive("null")),
        "array" => match obj.get("items") {
            Some(items) => {
                let item_name = format!("{}-item", name);
                let body = schema_rule(builder, items, &item_name)?;
                let item = builder.add_rule(&item_name, body);
                Ok(format!(
                    "\"[\" ws ( {item} ( \",\" ws {item} )* )? \"]\" ws",
                    item = item
                ))
            }
            None => Ok(builder.primitive("array")),
        },
        "object" => object_rule(builder, obj, name),
        other => anyhow::bail!("Unsupported schema type '{}' at '{}'", other, name),
    }
}

fn object_rule(builder: &mut GrammarBuilder, obj: &Map<String, Value>, name: &str) -> Result<String> {
    let Some(properties) = obj.get("properties").and_then(Value::as_object) else {
        return Ok(builder.primitive("object"));
    };
    if properties.is_empty() {
        return Ok(builder.primitive("object"));
    }
    builder.primitive("ws");

    let required: Vec<&str> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut required_pairs = Vec::new();
    let mut optional_pairs = Vec::new();
    for (key, prop_schema) in properties {
        let prop_name = format!("{}-{}", name, key);
        let body = schema_rule(builder, prop_schema, &prop_name)?;
        let value_rule = builder.add_rule(&prop_name, body);
        let pair = format!(
            "{} ws \":\" ws {}",
            literal(&serde_json::to_string(key)?),
            value_rule
        );
        if required.contains(&key.as_str()) {
            required_pairs.push(pair);
        } else {
            optional_pairs.push(pair);
        }
    }

    let mut body = String::from("\"{\" ws ");
    if required_pairs.is_empty() {
        let kv = builder.add_rule(&format!("{}-kv", name), optional_pairs.join(" | "));
        let _ = write!(body, "( {kv} ( \",\" ws {kv} )* )? ", kv = kv);
    } else {
        body.push_str(&required_pairs.join(" \",\" ws "));
        body.push(' ');
        for pair in &optional_pairs {
            let _ = write!(body, "( \",\" ws {} )? ", pair);
        }
    }
    body.push_str("\"}\" ws");
    Ok(body)
}

/// Compile a regular expression into a GBNF grammar matching the whole output.
///
/// Anchors are accepted and ignored since the grammar always spans the full
/// generation. Word boundaries and other look-arounds are rejected.
pub fn regex_to_gbnf(pattern: &str) -> Result<String> {
    let hir = regex_syntax::Parser::new()
        .parse(pattern)
        .map_err(|e| anyhow::anyhow!("Invalid regex '{}': {}", pattern, e))?;
    let mut builder = GrammarBuilder::default();
    let body = hir_rule(&mut builder, &hir)?;
    Ok(format!("root ::= {}\n{}", body, builder.render()))
}

fn hir_rule(builder: &mut GrammarBuilder, hir: &Hir) -> Result<String> {
    match hir.kind() {
        HirKind::Empty => Ok("\"\"".to_string()),
        HirKind::Literal(lit) => {
            let text = std::str::from_utf8(&lit.0)
                .map_err(|_| anyhow::anyhow!("Regex literal is not valid UTF-8"))?;
            Ok(literal(text))
        }
        HirKind::Class(Class::Unicode(class)) => {
            let mut out = String::from("[");
            for range in class.ranges() {
                let (start, end) = (range.start(), range.end());
                let start = if start == '\0' { '\u{1}' } else { start };
                if start > end {
                    continue;
                }
                if start == end {
                    out.push_str(&class_char(start));
                } else {
                    let _ = write!(out, "{}-{}", class_char(start), class_char(end));
                }
            }
            out.push(']');
            Ok(out)
        }
        HirKind::Class(Class::Bytes(class)) => {
            let mut out = String::from("[");
            for range in class.ranges() {
                if range.end() > 0x7F {
                    anyhow::bail!("Byte classes outside ASCII are not supported");
                }
                let start = char::from(range.start().max(1));
                let end = char::from(range.end());
                if start == end {
                    out.push_str(&class_char(start));
                } else {
                    let _ = write!(out, "{}-{}", class_char(start), class_char(end));
                }
            }
            out.push(']');
            Ok(out)
        }
        HirKind::Look(look) => {
            use regex_syntax::hir::Look;
            match look {
                Look::Start | Look::End | Look::StartLF | Look::EndLF | Look::StartCRLF
                | Look::EndCRLF => Ok("\"\"".to_string()),
                other => anyhow::bail!("Unsupported regex assertion {:?}", other),
            }
        }
        HirKind::Repetition(rep) => {
            let max = rep.max.unwrap_or(rep.min);
            if rep.min > MAX_REPEAT || max > MAX_REPEAT {
                anyhow::bail!("Regex repetition exceeds {} occurrences", MAX_REPEAT);
            }
            let inner = hir_rule(builder, &rep.sub)?;
            let sub = if inner.len() > INLINE_REPEAT_LEN {
                builder.add_rule("rep", inner)
            } else {
                format!("( {} )", inner)
            };
            let mut parts: Vec<String> = std::iter::repeat(sub.clone())
                .take(rep.min as usize)
                .collect();
            match rep.max {
                None => parts.push(format!("{}*", sub)),
                Some(max) => {
                    parts.extend(std::iter::repeat(format!("{}?", sub)).take((max - rep.min) as usize))
                }
            }
            if parts.is_empty() {
                return Ok("\"\"".to_string());
            }
            Ok(parts.join(" "))
        }
        HirKind::Capture(capture) => Ok(format!("( {} )", hir_rule(builder, &capture.sub)?)),
        HirKind::Concat(items) => {
            let parts = items
                .iter()
                .map(|item| hir_rule(builder, item))
                .collect::<Result<Vec<_>>>()?;
            Ok(parts.join(" "))
        }
        HirKind::Alternation(items) => {
            let parts = items
                .iter()
                .map(|item| hir_rule(builder, item))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("( {} )", parts.join(" | ")))
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("Unsupported regex construct {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_property_becomes_alternatives() {
        let grammar = schema_to_gbnf(&json!({
            "type": "object",
            "properties": {
                "color": {"type": "string", "enum": ["red", "green"]}
            },
            "required": ["color"]
        }))
        .unwrap();

        assert!(grammar.starts_with("root ::= \"{\" ws \"\\\"color\\\"\" ws \":\" ws root-color"));
        assert!(grammar.contains("root-color ::= ( \"\\\"red\\\"\" | \"\\\"green\\\"\" ) ws"));
        assert!(grammar.contains("ws ::= [ \\t\\n]*"));
    }

    #[test]
    fn test_optional_properties_follow_required() {
        let grammar = schema_to_gbnf(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            },
            "required": ["name"]
        }))
        .unwrap();

        let root = grammar.lines().next().unwrap();
        let name_pos = root.find("root-name").unwrap();
        let age_pos = root.find("( \",\" ws \"\\\"age\\\"\"").unwrap();
        assert!(name_pos < age_pos);
        assert!(grammar.contains("integer ::="));
        assert!(grammar.contains("string ::="));
    }

    #[test]
    fn test_all_optional_properties() {
        let grammar = schema_to_gbnf(&json!({
            "properties": {"a": {"type": "boolean"}, "b": {"type": "null"}}
        }))
        .unwrap();
        assert!(grammar.contains("root-kv ::="));
        assert!(grammar.contains("boolean ::="));
    }

    #[test]
    fn test_arrays_and_unions() {
        let grammar = schema_to_gbnf(&json!({
            "type": "array",
            "items": {"anyOf": [{"type": "number"}, {"type": "string"}]}
        }))
        .unwrap();
        assert!(grammar.contains("root-item ::= root-item-0 | root-item-1"));
        assert!(grammar.contains("number ::="));
    }

    #[test]
    fn test_untyped_schema_accepts_any_value() {
        let grammar = schema_to_gbnf(&json!({})).unwrap();
        assert!(grammar.starts_with("root ::= value\n"));
        for rule in ["object ::=", "array ::=", "string ::=", "number ::=", "boolean ::=", "null ::="] {
            assert!(grammar.contains(rule), "missing {}", rule);
        }
    }

    #[test]
    fn test_rejects_unsupported_schemas() {
        assert!(schema_to_gbnf(&json!("string")).is_err());
        assert!(schema_to_gbnf(&json!({"$ref": "#/defs/x"})).is_err());
        assert!(schema_to_gbnf(&json!({"type": "date"})).is_err());
        assert!(schema_to_gbnf(&json!({"enum": []})).is_err());
    }

    #[test]
    fn test_regex_literal_and_class() {
        let grammar = regex_to_gbnf("id-[0-9]+").unwrap();
        assert_eq!(grammar, "root ::= \"id-\" ( [0-9] ) ( [0-9] )*\n");
    }

    #[test]
    fn test_regex_counted_repetition_and_alternation() {
        let grammar = regex_to_gbnf("^(yes|no)[a-c]{1,2}$").unwrap();
        assert_eq!(
            grammar,
            "root ::= \"\" ( ( \"yes\" | \"no\" ) ) ( [a-c] ) ( [a-c] )? \"\"\n"
        );
    }

    #[test]
    fn test_nested_repetition_grows_linearly() {
        let grammar = regex_to_gbnf("(?:(?:(?:a{200}){200}){200})").unwrap();

        assert!(grammar.len() < 16 * 1024, "grammar is {} bytes", grammar.len());
        assert!(grammar.starts_with("root ::= rep-1 rep-1 "));
        assert!(grammar.contains("\nrep ::= ( \"a\" ) ( \"a\" )"));
        assert!(grammar.contains("\nrep-1 ::= rep rep "));
    }

    #[test]
    fn test_large_class_repetition_is_shared() {
        let grammar = regex_to_gbnf(r"\w{1,50}").unwrap();
        let class_copies = grammar.matches('[').count();
        assert_eq!(class_copies, 1);
        assert!(grammar.starts_with("root ::= rep rep? "));
    }

    #[test]
    fn test_regex_escapes_quotes() {
        let grammar = regex_to_gbnf("\"[\\]x]").unwrap();
        assert_eq!(grammar, "root ::= \"\\\"\" [\\]x]\n");
    }

    #[test]
    fn test_regex_rejects_word_boundaries_and_bad_patterns() {
        assert!(regex_to_gbnf(r"\bword\b").is_err());
        assert!(regex_to_gbnf("(unclosed").is_err());
        assert!(regex_to_gbnf("a{1000}").is_err());
    }
}

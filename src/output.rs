//! Reply rendering for the terminal and for `--json`.

use colored::Colorize;
use resplink_client::ReplyValue;
use resplink_protocol::{BigNumber, Double, MapReply, SetReply};
use serde_json::{Map, Value};

/// Renders a reply the way interactive RESP tools usually do.
pub fn render(value: &ReplyValue) -> String {
    let mut out = String::new();
    render_into(value, 0, &mut out);
    out
}

fn render_into(value: &ReplyValue, indent: usize, out: &mut String) {
    match value {
        ReplyValue::Null => out.push_str(&"(nil)".dimmed().to_string()),
        ReplyValue::Boolean(b) => out.push_str(&format!("({})", b)),
        ReplyValue::Integer(n) => out.push_str(&format!("(integer) {}", n)),
        ReplyValue::BigNumber(_) => out.push_str(&format!("(big number) {}", value)),
        ReplyValue::Double(_) => out.push_str(&format!("(double) {}", value)),
        ReplyValue::SimpleString(blob) | ReplyValue::VerbatimString { text: blob, .. } => {
            out.push_str(&blob.to_text())
        }
        ReplyValue::BlobString(blob) => out.push_str(&format!("{:?}", blob.to_text())),
        ReplyValue::Error(err) => out.push_str(&format!("(error) {}", err).red().to_string()),
        ReplyValue::Array(items) | ReplyValue::Push(items) => {
            render_list(items.iter(), indent, out)
        }
        ReplyValue::Set(SetReply::Sequence(items)) => render_list(items.iter(), indent, out),
        ReplyValue::Set(SetReply::Unique(set)) => render_list(set.iter(), indent, out),
        ReplyValue::Map(MapReply::Keyed(map)) => render_map(
            map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            indent,
            out,
        ),
        ReplyValue::Map(MapReply::Associative(map)) => render_map(
            map.iter().map(|(k, v)| (k.key_text(), v)).collect(),
            indent,
            out,
        ),
        ReplyValue::Map(MapReply::Flat(items)) => render_list(items.iter(), indent, out),
    }
}

fn render_list<'a>(
    items: impl ExactSizeIterator<Item = &'a ReplyValue>,
    indent: usize,
    out: &mut String,
) {
    if items.len() == 0 {
        out.push_str(&"(empty array)".dimmed().to_string());
        return;
    }
    let width = items.len().to_string().len();
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push('\n');
            out.push_str(&" ".repeat(indent));
        }
        let label = format!("{:>width$}) ", i + 1, width = width);
        out.push_str(&label);
        render_into(item, indent + label.len(), out);
    }
}

fn render_map(entries: Vec<(String, &ReplyValue)>, indent: usize, out: &mut String) {
    if entries.is_empty() {
        out.push_str(&"(empty map)".dimmed().to_string());
        return;
    }
    let width = entries.len().to_string().len();
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push('\n');
            out.push_str(&" ".repeat(indent));
        }
        let label = format!("{:>width$}# {} => ", i + 1, key.cyan(), width = width);
        out.push_str(&label);
        let nested = indent + width + 2;
        render_into(value, nested, out);
    }
}

/// Converts a reply to JSON. Errors become `{"error": message}`.
pub fn to_json(value: &ReplyValue) -> Value {
    match value {
        ReplyValue::Null => Value::Null,
        ReplyValue::Boolean(b) => Value::Bool(*b),
        ReplyValue::Integer(n) => Value::from(*n),
        ReplyValue::BigNumber(BigNumber::Native(n)) => Value::String(n.to_string()),
        ReplyValue::BigNumber(BigNumber::Text(text)) => Value::String(text.clone()),
        ReplyValue::Double(Double::Native(d)) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(d.to_string())),
        ReplyValue::Double(Double::Text(text)) => Value::String(text.clone()),
        ReplyValue::SimpleString(blob)
        | ReplyValue::BlobString(blob)
        | ReplyValue::VerbatimString { text: blob, .. } => Value::String(blob.to_text().into_owned()),
        ReplyValue::Error(err) => {
            let mut object = Map::new();
            object.insert("error".to_string(), Value::String(err.message.clone()));
            Value::Object(object)
        }
        ReplyValue::Array(items) | ReplyValue::Push(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        ReplyValue::Set(SetReply::Sequence(items)) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        ReplyValue::Set(SetReply::Unique(set)) => Value::Array(set.iter().map(to_json).collect()),
        ReplyValue::Map(MapReply::Keyed(map)) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
        ReplyValue::Map(MapReply::Associative(map)) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.key_text(), to_json(v)))
                .collect(),
        ),
        ReplyValue::Map(MapReply::Flat(items)) => Value::Object(
            items
                .chunks(2)
                .map(|pair| {
                    let value = pair.get(1).map(to_json).unwrap_or(Value::Null);
                    (pair[0].key_text(), value)
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_scalars() {
        colored::control::set_override(false);
        assert_eq!(render(&ReplyValue::Integer(7)), "(integer) 7");
        assert_eq!(render(&ReplyValue::simple("OK")), "OK");
        assert_eq!(render(&ReplyValue::text("hi")), "\"hi\"");
        assert_eq!(render(&ReplyValue::Null), "(nil)");
    }

    #[test]
    fn test_render_nested_array() {
        colored::control::set_override(false);
        let value = ReplyValue::Array(vec![
            ReplyValue::text("a"),
            ReplyValue::Array(vec![ReplyValue::Integer(1), ReplyValue::Integer(2)]),
        ]);
        assert_eq!(render(&value), "1) \"a\"\n2) 1) (integer) 1\n   2) (integer) 2");
    }

    #[test]
    fn test_json_conversion() {
        let value = ReplyValue::Array(vec![
            ReplyValue::Integer(1),
            ReplyValue::Null,
            ReplyValue::Map(MapReply::Flat(vec![
                ReplyValue::text("k"),
                ReplyValue::text("v"),
            ])),
        ]);
        assert_eq!(to_json(&value), json!([1, null, {"k": "v"}]));
    }
}

use std::path::Path;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use toml::Value;
use toml::map::{Entry, Map};

/// Merge `addition` into `target`, later files winning.
///
/// Tables merge recursively, `key+ = [..]` appends to an existing array, and
/// `"null"` or `[]` removes an inherited key.
pub fn merge_tables(
    target: &mut Map<String, Value>,
    addition: Map<String, Value>,
    source_path: Option<&Path>,
) -> Result<()> {
    for (raw_key, value) in addition {
        if let Some(key) = raw_key.strip_suffix('+') {
            append_array(target, key, value, source_path)?;
            continue;
        }

        match (target.entry(raw_key), value) {
            (Entry::Occupied(mut occ), Value::Table(table)) => {
                if let Value::Table(existing) = occ.get_mut() {
                    merge_tables(existing, table, source_path)?;
                } else {
                    occ.insert(Value::Table(table));
                }
            }
            (Entry::Occupied(occ), other) if clears_key(&other) => {
                occ.remove();
            }
            (Entry::Occupied(mut occ), other) => {
                occ.insert(other);
            }
            (Entry::Vacant(_), other) if clears_key(&other) => {}
            (Entry::Vacant(vac), other) => {
                vac.insert(other);
            }
        }
    }

    Ok(())
}

fn append_array(
    target: &mut Map<String, Value>,
    key: &str,
    value: Value,
    source: Option<&Path>,
) -> Result<()> {
    let Value::Array(items) = value else {
        let origin = source.map_or_else(
            || "while merging configuration".to_string(),
            |path| format!("while merging {}", path.display()),
        );
        return Err(eyre!("value for '{key}+' must be an array").wrap_err(origin));
    };
    match target.entry(key.to_string()) {
        Entry::Occupied(mut occ) => {
            let Value::Array(existing) = occ.get_mut() else {
                return Err(eyre!("cannot append to non-array key '{key}'"));
            };
            existing.extend(items);
        }
        Entry::Vacant(vac) => {
            vac.insert(Value::Array(items));
        }
    }
    Ok(())
}

fn clears_key(value: &Value) -> bool {
    match value {
        Value::String(s) => s.eq_ignore_ascii_case("null"),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> Map<String, Value> {
        toml::from_str::<Value>(text)
            .expect("parse toml")
            .as_table()
            .cloned()
            .expect("table")
    }

    #[test]
    fn later_sections_override_and_merge() {
        let mut merged = table("[backend]\ncommand = \"a\"\nmodel = \"flux-dev\"\n");
        merge_tables(&mut merged, table("[backend]\nmodel = \"flux-pro\"\n"), None)
            .expect("merge");
        let backend = merged["backend"].as_table().expect("backend table");
        assert_eq!(backend["command"].as_str(), Some("a"));
        assert_eq!(backend["model"].as_str(), Some("flux-pro"));
    }

    #[test]
    fn plus_suffix_appends_and_null_clears() {
        let mut merged = table("tags = [\"a\"]\n[viewer]\ncommand = \"feh\"\n");
        merge_tables(
            &mut merged,
            table("\"tags+\" = [\"b\"]\n[viewer]\ncommand = \"null\"\n"),
            None,
        )
        .expect("merge");
        let tags: Vec<_> = merged["tags"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert!(
            !merged["viewer"]
                .as_table()
                .expect("viewer")
                .contains_key("command")
        );
    }

    #[test]
    fn appending_a_scalar_is_an_error() {
        let mut merged = Map::new();
        let err = merge_tables(&mut merged, table("\"tags+\" = \"x\"\n"), None)
            .expect_err("scalar append");
        assert!(format!("{err:?}").contains("must be an array"));
    }
}

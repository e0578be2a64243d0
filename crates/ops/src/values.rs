//! Release values: `a.b[0].c=v` overrides, YAML documents and deep merging.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value as Json};
use tracing::info;

use charter_core::{Error, ReleaseSpec};
use charter_persist::ArchiveFetcher;

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Key(String),
    Index(usize),
}

/// Split on `sep` outside braces, honouring `\` escapes (the escape is kept).
fn split_top(s: &str, sep: char) -> Vec<String> {
    let (mut out, mut cur, mut depth, mut esc) = (Vec::new(), String::new(), 0usize, false);
    for ch in s.chars() {
        if esc {
            cur.push(ch);
            esc = false;
            continue;
        }
        match ch {
            '\\' => {
                cur.push(ch);
                esc = true;
            }
            '{' => {
                depth += 1;
                cur.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                cur.push(ch);
            }
            c if c == sep && depth == 0 => out.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
    }
    out.push(cur);
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn typed(raw: &str) -> Json {
    let s = unescape(raw);
    match s.as_str() {
        "true" => Json::Bool(true),
        "false" => Json::Bool(false),
        "null" => Json::Null,
        _ => match s.parse::<i64>() {
            Ok(n) if !(s.len() > 1 && s.starts_with('0')) => Json::from(n),
            _ => Json::String(s),
        },
    }
}

/// Largest list index a dotted key may address.
pub const MAX_INDEX: usize = 65536;

fn parse_key(key: &str) -> Result<Vec<Seg>> {
    let mut segs = Vec::new();
    let (mut cur, mut chars) = (String::new(), key.chars().peekable());
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            '.' => {
                if !cur.is_empty() {
                    segs.push(Seg::Key(std::mem::take(&mut cur)));
                }
            }
            '[' => {
                if !cur.is_empty() {
                    segs.push(Seg::Key(std::mem::take(&mut cur)));
                }
                let mut idx = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    idx.push(d);
                }
                let i = idx.trim().parse::<usize>().map_err(|_| anyhow!("invalid list index {:?} in key {:?}", idx, key))?;
                if i > MAX_INDEX {
                    return Err(anyhow!("list index {} in key {:?} exceeds the maximum of {}", i, key, MAX_INDEX));
                }
                segs.push(Seg::Index(i));
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        segs.push(Seg::Key(cur));
    }
    match segs.first() {
        Some(Seg::Key(_)) => Ok(segs),
        _ => Err(anyhow!("key {:?} must start with a name", key)),
    }
}

fn set_path(slot: &mut Json, segs: &[Seg], value: Json) {
    let Some((head, rest)) = segs.split_first() else {
        *slot = value;
        return;
    };
    match head {
        Seg::Key(k) => {
            if !slot.is_object() {
                *slot = Json::Object(Map::new());
            }
            if let Json::Object(m) = slot {
                set_path(m.entry(k.clone()).or_insert(Json::Null), rest, value);
            }
        }
        Seg::Index(i) => {
            if !slot.is_array() {
                *slot = Json::Array(Vec::new());
            }
            if let Json::Array(a) = slot {
                if a.len() <= *i {
                    a.resize(*i + 1, Json::Null);
                }
                set_path(&mut a[*i], rest, value);
            }
        }
    }
}

fn apply_parts(expr: &str, root: &mut Json) -> Result<()> {
    for part in split_top(expr, ',') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=').ok_or_else(|| anyhow!("key {:?} has no value", part))?;
        let segs = parse_key(k)?;
        let value = match v.strip_prefix('{').and_then(|x| x.strip_suffix('}')) {
            Some(inner) if inner.is_empty() => Json::Array(vec![]),
            Some(inner) => Json::Array(split_top(inner, ',').iter().map(|s| typed(s)).collect()),
            None => typed(v),
        };
        set_path(root, &segs, value);
    }
    Ok(())
}

/// Apply one `key=value[,key=value...]` expression onto `dest`.
///
/// Parts before a malformed one are kept.
pub fn parse_into(expr: &str, dest: &mut Map<String, Json>) -> Result<()> {
    let mut root = Json::Object(std::mem::take(dest));
    let result = apply_parts(expr, &mut root);
    if let Json::Object(m) = root {
        *dest = m;
    }
    result
}

/// Nested maps merge key by key; anything else in `b` replaces `a`.
pub fn deep_merge(a: Map<String, Json>, b: Map<String, Json>) -> Map<String, Json> {
    let mut out = a;
    for (k, v) in b {
        match (out.remove(&k), v) {
            (Some(Json::Object(av)), Json::Object(bv)) => {
                out.insert(k, Json::Object(deep_merge(av, bv)));
            }
            (_, v) => {
                out.insert(k, v);
            }
        }
    }
    out
}

/// Parse a YAML values document; an empty document is an empty map.
pub fn yaml_map(text: &str) -> Result<Map<String, Json>> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    let v: serde_yaml::Value = serde_yaml::from_str(text).context("parsing values yaml")?;
    match serde_json::to_value(v).context("converting values yaml")? {
        Json::Object(m) => Ok(m),
        Json::Null => Ok(Map::new()),
        other => Err(Error::Validation(format!("values yaml must be a mapping, got {}", kind_name(&other))).into()),
    }
}

fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Array(_) => "a list",
        Json::String(_) => "a string",
        Json::Number(_) => "a number",
        Json::Bool(_) => "a bool",
        _ => "a scalar",
    }
}

/// Final values for a spec: inline YAML, then overrides, then the remote document.
pub async fn resolve_values(spec: &ReleaseSpec, fetcher: &dyn ArchiveFetcher, work_dir: &Path) -> Result<Map<String, Json>> {
    let base = yaml_map(spec.value_yaml.as_deref().unwrap_or("")).map_err(|e| anyhow!(Error::Validation(format!("ValueYaml: {:#}", e))))?;
    let mut overrides = Map::new();
    for (k, v) in spec.values.iter().flatten() {
        parse_into(&format!("{}={}", k, v), &mut overrides)
            .map_err(|e| anyhow!(Error::Validation(format!("Values: {:#}", e))))?;
    }
    let merged = deep_merge(base, overrides);
    let Some(url) = spec.value_override_url.as_deref().filter(|u| !u.is_empty()) else {
        return Ok(merged);
    };
    let dest = work_dir.join("values-override.yaml");
    fetcher.fetch(url, &dest).await.with_context(|| format!("fetching values from {}", url))?;
    let text = tokio::fs::read_to_string(&dest).await.with_context(|| format!("reading {}", dest.display()))?;
    let remote = yaml_map(&text).with_context(|| format!("values document {}", url))?;
    info!(url = %url, keys = remote.len(), "values: override document merged");
    Ok(deep_merge(merged, remote))
}

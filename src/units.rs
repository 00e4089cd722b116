//! Unit enumeration: materialising the full input set for a run.
//!
//! Three strategies:
//! - `direct` — one unit per item in the source list.
//! - `permutation` — every ordered arrangement of distinct items over the
//!   configured positions, all positions drawing from one list.
//! - `cross_product` — the cartesian product over per-position item
//!   lists.
//!
//! Unit ids are stable: item ids joined with `__` in position order
//! (e.g. `gruff_blacksmith__angry__rumors`), so downstream analysis can
//! split them back apart. `repeat: N` clones the enumeration with
//! `_repetition_id` 0..N-1 and a per-repetition `_repetition_seed`;
//! repetition clones get a `__rN` id suffix. `max_units` caps the final
//! list (0 yields an empty run).

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value as JsonValue, json};

use crate::config::{ItemsConfig, ProcessingConfig, Strategy};

/// Generate the run's units. `config_dir` anchors the items source path.
pub fn generate_units(processing: &ProcessingConfig, config_dir: &Path) -> Result<Vec<JsonValue>> {
    let items_data = load_items(&processing.items, config_dir)?;

    let base_units = match processing.strategy {
        Strategy::Direct => direct_units(processing, &items_data)?,
        Strategy::Permutation => permutation_units(processing, &items_data)?,
        Strategy::CrossProduct => cross_product_units(processing, &items_data)?,
    };

    let repeat = processing.repeat.unwrap_or(1).max(1);
    let mut units = Vec::with_capacity(base_units.len() * repeat as usize);
    for repetition in 0..repeat {
        for unit in &base_units {
            let mut clone = unit.clone();
            let object = clone
                .as_object_mut()
                .expect("generated units are always objects");
            if repeat > 1 {
                let base_id = object
                    .get("unit_id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                object.insert("unit_id".into(), json!(format!("{base_id}__r{repetition}")));
            }
            object.insert("_repetition_id".into(), json!(repetition));
            object.insert(
                "_repetition_seed".into(),
                json!(processing.seed.wrapping_add(u64::from(repetition))),
            );
            units.push(clone);
        }
    }

    if let Some(max_units) = processing.max_units {
        units.truncate(max_units as usize);
    }
    Ok(units)
}

/// Partition units into chunks of `chunk_size`, named `chunk_NNN`.
pub fn partition_chunks(units: &[JsonValue], chunk_size: usize) -> Vec<(String, Vec<JsonValue>)> {
    let chunk_size = chunk_size.max(1);
    units
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, slice)| (format!("chunk_{index:03}"), slice.to_vec()))
        .collect()
}

fn load_items(items: &ItemsConfig, config_dir: &Path) -> Result<JsonValue> {
    let Some(source) = &items.source else {
        bail!("'processing.items.source' is required to generate units");
    };
    let path = config_dir.join(source);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read items file: {}", path.display()))?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse items YAML: {}", path.display()))?;
    serde_json::to_value(yaml).context("Items file is not JSON-representable")
}

fn item_list<'a>(items_data: &'a JsonValue, key: &str) -> Result<&'a Vec<JsonValue>> {
    items_data
        .get(key)
        .and_then(JsonValue::as_array)
        .with_context(|| format!("Items file has no list under key '{key}'"))
}

fn item_id(item: &JsonValue, index: usize) -> String {
    item.get("id")
        .and_then(JsonValue::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("item_{index:03}"))
}

fn direct_units(processing: &ProcessingConfig, items_data: &JsonValue) -> Result<Vec<JsonValue>> {
    let key = processing
        .items
        .key
        .as_deref()
        .context("'processing.items.key' is required for the direct strategy")?;
    let list = item_list(items_data, key)?;

    let mut units = Vec::with_capacity(list.len());
    for (index, item) in list.iter().enumerate() {
        let mut object = item.as_object().cloned().unwrap_or_else(|| {
            let mut wrapper = Map::new();
            wrapper.insert("value".into(), item.clone());
            wrapper
        });
        object.insert("unit_id".into(), json!(item_id(item, index)));
        units.push(JsonValue::Object(object));
    }
    Ok(units)
}

fn permutation_units(
    processing: &ProcessingConfig,
    items_data: &JsonValue,
) -> Result<Vec<JsonValue>> {
    let key = processing
        .items
        .key
        .as_deref()
        .context("'processing.items.key' is required for the permutation strategy")?;
    let list = item_list(items_data, key)?;
    let positions: Vec<&str> = processing.positions.iter().map(|p| p.name()).collect();
    if positions.is_empty() {
        bail!("'processing.positions' is required for the permutation strategy");
    }
    if positions.len() > list.len() {
        bail!(
            "permutation needs at least {} items under '{key}', found {}",
            positions.len(),
            list.len()
        );
    }

    let mut units = Vec::new();
    let mut selection = Vec::with_capacity(positions.len());
    permute(list, &positions, &mut selection, &mut units);
    Ok(units)
}

fn permute(
    list: &[JsonValue],
    positions: &[&str],
    selection: &mut Vec<usize>,
    units: &mut Vec<JsonValue>,
) {
    if selection.len() == positions.len() {
        let mut object = Map::new();
        let mut id_parts = Vec::with_capacity(positions.len());
        for (position, &index) in positions.iter().zip(selection.iter()) {
            object.insert((*position).to_string(), list[index].clone());
            id_parts.push(item_id(&list[index], index));
        }
        object.insert("unit_id".into(), json!(id_parts.join("__")));
        units.push(JsonValue::Object(object));
        return;
    }
    for index in 0..list.len() {
        if selection.contains(&index) {
            continue;
        }
        selection.push(index);
        permute(list, positions, selection, units);
        selection.pop();
    }
}

fn cross_product_units(
    processing: &ProcessingConfig,
    items_data: &JsonValue,
) -> Result<Vec<JsonValue>> {
    let mut lists = Vec::with_capacity(processing.positions.len());
    for position in &processing.positions {
        let key = position.source_key().with_context(|| {
            format!(
                "Position '{}' needs a 'source_key' under the cross_product strategy",
                position.name()
            )
        })?;
        lists.push((position.name(), item_list(items_data, key)?));
    }
    if lists.is_empty() {
        bail!("'processing.positions' is required for the cross_product strategy");
    }

    let mut units = Vec::new();
    let mut indices = vec![0usize; lists.len()];
    loop {
        let mut object = Map::new();
        let mut id_parts = Vec::with_capacity(lists.len());
        for (slot, (name, list)) in lists.iter().enumerate() {
            let item = &list[indices[slot]];
            object.insert((*name).to_string(), item.clone());
            id_parts.push(item_id(item, indices[slot]));
        }
        object.insert("unit_id".into(), json!(id_parts.join("__")));
        units.push(JsonValue::Object(object));

        // odometer increment, rightmost position fastest
        let mut slot = lists.len();
        loop {
            if slot == 0 {
                return Ok(units);
            }
            slot -= 1;
            indices[slot] += 1;
            if indices[slot] < lists.get(slot).map_or(0, |(_, l)| l.len()) {
                break;
            }
            indices[slot] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PositionConfig;
    use tempfile::tempdir;

    fn write_items(dir: &Path, content: &str) {
        std::fs::write(dir.join("items.yaml"), content).unwrap();
    }

    fn processing(strategy: Strategy, positions: Vec<PositionConfig>, key: Option<&str>) -> ProcessingConfig {
        ProcessingConfig {
            strategy,
            chunk_size: 10,
            positions,
            items: ItemsConfig {
                source: Some("items.yaml".into()),
                key: key.map(String::from),
            },
            repeat: None,
            max_units: None,
            seed: 0,
            resume_coverage_threshold: 0.9,
        }
    }

    #[test]
    fn direct_strategy_one_unit_per_item() {
        let dir = tempdir().unwrap();
        write_items(
            dir.path(),
            "topics:\n  - id: alpha\n    text: A\n  - id: beta\n    text: B\n",
        );
        let units = generate_units(
            &processing(Strategy::Direct, vec![], Some("topics")),
            dir.path(),
        )
        .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0]["unit_id"], "alpha");
        assert_eq!(units[0]["text"], "A");
        assert_eq!(units[1]["unit_id"], "beta");
    }

    #[test]
    fn cross_product_strategy_joins_ids() {
        let dir = tempdir().unwrap();
        write_items(
            dir.path(),
            concat!(
                "npcs:\n  - id: smith\n    name: Smith\n  - id: mara\n    name: Mara\n",
                "moods:\n  - id: angry\n  - id: calm\n",
            ),
        );
        let positions = vec![
            PositionConfig::Sourced { name: "npc".into(), source_key: "npcs".into() },
            PositionConfig::Sourced { name: "mood".into(), source_key: "moods".into() },
        ];
        let units = generate_units(
            &processing(Strategy::CrossProduct, positions, Some("npcs")),
            dir.path(),
        )
        .unwrap();
        assert_eq!(units.len(), 4);
        assert_eq!(units[0]["unit_id"], "smith__angry");
        assert_eq!(units[0]["npc"]["name"], "Smith");
        assert_eq!(units[3]["unit_id"], "mara__calm");
    }

    #[test]
    fn permutation_strategy_distinct_ordered_arrangements() {
        let dir = tempdir().unwrap();
        write_items(
            dir.path(),
            "players:\n  - id: a\n  - id: b\n  - id: c\n",
        );
        let positions = vec![
            PositionConfig::Name("first".into()),
            PositionConfig::Name("second".into()),
        ];
        let units = generate_units(
            &processing(Strategy::Permutation, positions, Some("players")),
            dir.path(),
        )
        .unwrap();
        // 3 P 2 = 6 arrangements, no repeats of the same item
        assert_eq!(units.len(), 6);
        let ids: Vec<&str> = units.iter().map(|u| u["unit_id"].as_str().unwrap()).collect();
        assert!(ids.contains(&"a__b"));
        assert!(ids.contains(&"b__a"));
        assert!(!ids.contains(&"a__a"));
    }

    #[test]
    fn repeat_clones_with_repetition_fields() {
        let dir = tempdir().unwrap();
        write_items(dir.path(), "topics:\n  - id: alpha\n");
        let mut processing = processing(Strategy::Direct, vec![], Some("topics"));
        processing.repeat = Some(3);
        processing.seed = 100;

        let units = generate_units(&processing, dir.path()).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0]["unit_id"], "alpha__r0");
        assert_eq!(units[2]["unit_id"], "alpha__r2");
        assert_eq!(units[1]["_repetition_id"], 1);
        assert_eq!(units[1]["_repetition_seed"], 101);
    }

    #[test]
    fn max_units_caps_enumeration() {
        let dir = tempdir().unwrap();
        write_items(dir.path(), "topics:\n  - id: a\n  - id: b\n  - id: c\n");
        let mut processing = processing(Strategy::Direct, vec![], Some("topics"));
        processing.max_units = Some(2);
        assert_eq!(generate_units(&processing, dir.path()).unwrap().len(), 2);

        processing.max_units = Some(0);
        assert!(generate_units(&processing, dir.path()).unwrap().is_empty());
    }

    #[test]
    fn partition_chunks_names_and_sizes() {
        let units: Vec<JsonValue> = (0..5).map(|i| json!({"unit_id": format!("u{i}")})).collect();
        let chunks = partition_chunks(&units, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0, "chunk_000");
        assert_eq!(chunks[0].1.len(), 2);
        assert_eq!(chunks[2].0, "chunk_002");
        assert_eq!(chunks[2].1.len(), 1);
    }

    #[test]
    fn chunk_size_one_yields_singleton_chunks() {
        let units: Vec<JsonValue> = (0..3).map(|i| json!({"unit_id": format!("u{i}")})).collect();
        let chunks = partition_chunks(&units, 1);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|(_, units)| units.len() == 1));
    }

    #[test]
    fn missing_items_key_is_an_error() {
        let dir = tempdir().unwrap();
        write_items(dir.path(), "topics:\n  - id: a\n");
        let result = generate_units(
            &processing(Strategy::Direct, vec![], Some("missing")),
            dir.path(),
        );
        assert!(result.is_err());
    }
}

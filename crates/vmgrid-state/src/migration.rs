//! Schema migrations for the configuration document.
//!
//! Each step is a pure function over the JSON value that takes the
//! document from version `from` to `from + 1`. [`migrate`] applies the
//! chain in order and bumps `version` after each step, so a step never
//! runs twice on the same document. [`load_and_migrate`] re-checks the
//! version under the document lock and commits the result atomically.

use serde_json::{Map, Value, json};
use tracing::info;
use vmgrid_core::id::{IdKind, generate_id};

use crate::document::{ConfigDocument, VERSION_KEY, read_version};
use crate::error::{StateError, StateResult};
use crate::types::ClusterConfig;

pub const CURRENT_VERSION: u32 = 22;
pub const OLDEST_SUPPORTED_VERSION: u32 = 17;

/// One schema step.
pub struct Migration {
    pub from: u32,
    pub description: &'static str,
    pub apply: fn(Value) -> StateResult<Value>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 17,
        description: "hard disks become id-keyed hard drives",
        apply: v17_hard_drive_ids,
    },
    Migration {
        from: 18,
        description: "groups keyed by id",
        apply: v18_group_ids,
    },
    Migration {
        from: 19,
        description: "users gain a type and global permissions",
        apply: v19_user_types,
    },
    Migration {
        from: 20,
        description: "vm lock and autostart become enums",
        apply: v20_vm_enums,
    },
    Migration {
        from: 21,
        description: "node fingerprints and drbd enable flag",
        apply: v21_fingerprints,
    },
];

/// Check that `version` can be migrated by this build.
pub fn check_supported(version: u32) -> StateResult<()> {
    if version < OLDEST_SUPPORTED_VERSION {
        return Err(StateError::IntermediateUpgradeRequired {
            found: version,
            oldest: OLDEST_SUPPORTED_VERSION,
        });
    }
    if version > CURRENT_VERSION {
        return Err(StateError::TooNew {
            found: version,
            current: CURRENT_VERSION,
        });
    }
    Ok(())
}

/// Run every pending step on `doc`.
pub fn migrate(mut doc: Value) -> StateResult<Value> {
    let mut version = read_version(&doc)?;
    check_supported(version)?;

    while version < CURRENT_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|m| m.from == version)
            .ok_or_else(|| StateError::Migration {
                from: version,
                reason: "no migrator registered".into(),
            })?;
        doc = (step.apply)(doc)?;
        version += 1;
        object(&mut doc, version - 1)?.insert(VERSION_KEY.to_string(), json!(version));
        info!(from = version - 1, to = version, step = step.description, "configuration migrated");
    }
    Ok(doc)
}

/// Bring the document on disk to [`CURRENT_VERSION`] and decode it.
pub fn load_and_migrate(doc: &ConfigDocument) -> StateResult<ClusterConfig> {
    let found = doc.version()?;
    check_supported(found)?;

    if found < CURRENT_VERSION {
        let reason = format!("migrate v{found} -> v{CURRENT_VERSION}");
        doc.update(&reason, |value| {
            let migrated = migrate(std::mem::take(value))?;
            *value = migrated;
            Ok(())
        })?;
    }

    let value = doc.get()?;
    serde_json::from_value(value).map_err(|e| StateError::Deserialize(e.to_string()))
}

// ── Helpers ────────────────────────────────────────────────────────

fn object(doc: &mut Value, from: u32) -> StateResult<&mut Map<String, Value>> {
    doc.as_object_mut().ok_or_else(|| StateError::Migration {
        from,
        reason: "document root is not an object".into(),
    })
}

fn take_map(root: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match root.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn entries_mut(root: &mut Map<String, Value>, key: &str) -> Vec<(String, Value)> {
    take_map(root, key).into_iter().collect()
}

// ── Steps ──────────────────────────────────────────────────────────

/// `hard_disks` keyed by volume name become `hard_drives` keyed by `hd-`
/// id, one id per VM attachment. Each VM's list of disk names becomes an
/// `{index: id}` map.
fn v17_hard_drive_ids(mut doc: Value) -> StateResult<Value> {
    let root = object(&mut doc, 17)?;
    let disks = take_map(root, "hard_disks");
    let mut drives = Map::new();
    let mut attached = std::collections::BTreeSet::new();

    let mut vms = take_map(root, "virtual_machines");
    for (_, vm) in vms.iter_mut() {
        let Some(vm) = vm.as_object_mut() else { continue };
        let names = match vm.remove("hard_disks") {
            Some(Value::Array(names)) => names,
            _ => Vec::new(),
        };
        let mut map = Map::new();
        for (index, name) in names.iter().enumerate() {
            let Some(name) = name.as_str() else { continue };
            let Some(disk) = disks.get(name) else {
                return Err(StateError::Migration {
                    from: 17,
                    reason: format!("vm references unknown hard disk '{name}'"),
                });
            };
            let id = generate_id(IdKind::HardDrive, name);
            let mut entry = disk.clone();
            if let Some(e) = entry.as_object_mut() {
                e.insert("base_volume".into(), json!(name));
            }
            drives.insert(id.clone(), entry);
            map.insert(index.to_string(), json!(id));
            attached.insert(name.to_string());
        }
        vm.insert("hard_drives".into(), Value::Object(map));
    }

    for (name, disk) in disks {
        if attached.contains(&name) {
            continue;
        }
        let mut entry = disk;
        if let Some(e) = entry.as_object_mut() {
            e.insert("base_volume".into(), json!(name));
        }
        drives.insert(generate_id(IdKind::HardDrive, &name), entry);
    }

    root.insert("virtual_machines".into(), Value::Object(vms));
    root.insert("hard_drives".into(), Value::Object(drives));
    Ok(doc)
}

fn v18_group_ids(mut doc: Value) -> StateResult<Value> {
    let root = object(&mut doc, 18)?;
    let mut groups = Map::new();
    for (name, mut group) in entries_mut(root, "groups") {
        if let Some(g) = group.as_object_mut() {
            g.insert("name".into(), json!(name));
        }
        groups.insert(generate_id(IdKind::Group, &name), group);
    }
    root.insert("groups".into(), Value::Object(groups));
    Ok(doc)
}

fn v19_user_types(mut doc: Value) -> StateResult<Value> {
    let root = object(&mut doc, 19)?;
    let mut users = take_map(root, "users");
    for (_, user) in users.iter_mut() {
        let Some(u) = user.as_object_mut() else { continue };
        u.entry("user_type").or_insert_with(|| json!("LOCAL"));
        let legacy = u.remove("permissions").unwrap_or_else(|| json!([]));
        u.entry("global_permissions").or_insert(legacy);
    }
    root.insert("users".into(), Value::Object(users));
    Ok(doc)
}

fn v20_vm_enums(mut doc: Value) -> StateResult<Value> {
    let root = object(&mut doc, 20)?;
    let mut vms = take_map(root, "virtual_machines");
    for (_, vm) in vms.iter_mut() {
        let Some(v) = vm.as_object_mut() else { continue };

        let locked = match v.get("lock") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "LOCKED",
            _ => false,
        };
        v.insert("lock".into(), json!(if locked { "LOCKED" } else { "UNLOCKED" }));

        let autostart = match v.get("autostart") {
            Some(Value::Bool(true)) => "ON_BOOT",
            Some(Value::String(s)) if s == "ON_BOOT" || s == "ON_POLL" => s.as_str(),
            _ => "NONE",
        }
        .to_string();
        v.insert("autostart".into(), json!(autostart));

        if let Some(node) = v.remove("node") {
            v.entry("current_node").or_insert(node);
        }
        v.entry("watchdog").or_insert_with(|| {
            json!({"enabled": false, "interval_secs": 30, "reset_fail_count": 3, "boot_wait_secs": 300})
        });
    }
    root.insert("virtual_machines".into(), Value::Object(vms));
    Ok(doc)
}

fn v21_fingerprints(mut doc: Value) -> StateResult<Value> {
    let root = object(&mut doc, 21)?;
    let mut cluster = take_map(root, "cluster");
    let mut nodes = take_map(&mut cluster, "nodes");
    for (_, node) in nodes.iter_mut() {
        if let Some(n) = node.as_object_mut() {
            n.entry("fingerprint").or_insert_with(|| json!(""));
        }
    }
    cluster.insert("nodes".into(), Value::Object(nodes));
    root.insert("cluster".into(), Value::Object(cluster));

    let mut drbd = take_map(root, "drbd");
    let enabled = drbd.get("secret").is_some_and(|s| !s.is_null());
    drbd.entry("enabled").or_insert(json!(enabled));
    root.insert("drbd".into(), Value::Object(drbd));
    Ok(doc)
}

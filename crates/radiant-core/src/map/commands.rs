//! Console commands for map files, layers and selection groups.

use std::path::PathBuf;
use std::sync::Arc;

use super::manager::Map;
use crate::command::{ArgSpec, ArgType, Argument, CommandSystem};
use crate::math::Vector3;
use crate::undo::UndoableCommand;

const OPTIONAL_PATH: &[ArgSpec] = &[ArgSpec::optional(ArgType::String)];

/// First argument as a path, or whatever the map's file selector returns.
fn path_argument(map: &Map, args: &[Argument], title: &str, open: bool, extension: &str) -> Option<PathBuf> {
    match args.first() {
        Some(arg) => Some(PathBuf::from(arg.as_string())),
        None => map.select_file(title, open, extension),
    }
}

fn layer_argument(args: &[Argument]) -> Option<i32> {
    args.first()
        .and_then(Argument::as_int)
        .and_then(|id| i32::try_from(id).ok())
}

/// Command body running `apply` with the layer id given as first argument.
fn layer_command(
    map: &Arc<Map>,
    label: &'static str,
    apply: fn(&Map, i32),
) -> impl Fn(&[Argument]) + Send + Sync + 'static {
    let map = map.clone();
    move |args: &[Argument]| {
        let Some(id) = layer_argument(args) else {
            tracing::warn!("[layers] {}: invalid layer id", label);
            return;
        };
        apply(&map, id);
    }
}

/// Registers the map, layer and selection group commands.
pub fn register_map_commands(commands: &CommandSystem, map: &Arc<Map>) {
    register_file_commands(commands, map);
    register_layer_commands(commands, map);
    register_group_commands(commands, map);
}

fn register_file_commands(commands: &CommandSystem, map: &Arc<Map>) {
    let m = map.clone();
    commands.add_command("NewMap", &[], move |_| m.new_map());

    let m = map.clone();
    commands.add_command("OpenMap", OPTIONAL_PATH, move |args| {
        let Some(path) = path_argument(&m, args, "Open map", true, "map") else {
            return;
        };
        if let Err(e) = m.load(&path) {
            tracing::error!("[map] Failure loading {}: {}", path.display(), e);
        }
    });

    let m = map.clone();
    commands.add_command("ImportMap", OPTIONAL_PATH, move |args| {
        let Some(path) = path_argument(&m, args, "Import map", true, "map") else {
            return;
        };
        if let Err(e) = m.import(&path) {
            tracing::error!("[map] Failure importing {}: {}", path.display(), e);
        }
    });

    let m = map.clone();
    commands.add_command("SaveMap", &[], move |_| {
        let result = if m.is_unnamed() {
            let Some(path) = m.select_file("Save map", false, "map") else {
                return;
            };
            m.save_as(&path)
        } else {
            m.save()
        };
        if let Err(e) = result {
            tracing::error!("[map] Failure saving map: {}", e);
        }
    });

    let m = map.clone();
    commands.add_command("SaveMapAs", OPTIONAL_PATH, move |args| {
        let Some(path) = path_argument(&m, args, "Save map", false, "map") else {
            return;
        };
        if let Err(e) = m.save_as(&path) {
            tracing::error!("[map] Failure saving {}: {}", path.display(), e);
        }
    });

    let m = map.clone();
    commands.add_command("SaveMapCopyAs", OPTIONAL_PATH, move |args| {
        let Some(path) = path_argument(&m, args, "Save copy as", false, "map") else {
            return;
        };
        if let Err(e) = m.save_copy_as(&path) {
            tracing::error!("[map] Failure saving copy to {}: {}", path.display(), e);
        }
    });

    let m = map.clone();
    commands.add_command("SaveSelected", OPTIONAL_PATH, move |args| {
        let Some(path) = path_argument(&m, args, "Export selection", false, "map") else {
            return;
        };
        if let Err(e) = m.save_selected(&path) {
            tracing::error!("[map] Failure exporting selection to {}: {}", path.display(), e);
        }
    });

    let m = map.clone();
    commands.add_command(
        "LoadPrefab",
        &[ArgSpec::optional(ArgType::String), ArgSpec::optional(ArgType::Vector3)],
        move |args| {
            let Some(path) = path_argument(&m, args, "Insert prefab", true, "pfb") else {
                return;
            };
            let position = args
                .get(1)
                .and_then(Argument::as_vector3)
                .unwrap_or(Vector3::new(0.0, 0.0, 0.0));
            if let Err(e) = m.load_prefab_at(&path, position) {
                tracing::error!("[map] Failure inserting prefab {}: {}", path.display(), e);
            }
        },
    );

    let m = map.clone();
    commands.add_command("SaveSelectedAsPrefab", OPTIONAL_PATH, move |args| {
        let Some(path) = path_argument(&m, args, "Save selected as prefab", false, "pfb") else {
            return;
        };
        if let Err(e) = m.save_selected_as_prefab(&path) {
            tracing::error!("[map] Failure saving prefab {}: {}", path.display(), e);
        }
    });
}

fn register_layer_commands(commands: &CommandSystem, map: &Arc<Map>) {
    let m = map.clone();
    commands.add_command("CreateLayer", &[ArgSpec::required(ArgType::String)], move |args| {
        let name = args.first().map(Argument::as_string).unwrap_or_default();
        match m.root().layers().create_layer(&name) {
            Some(id) => tracing::info!("[layers] Created layer {} with id {}", name, id),
            None => tracing::warn!("[layers] Could not create layer {}", name),
        }
    });

    let id_arg = &[ArgSpec::required(ArgType::Int)];

    commands.add_command(
        "AddSelectionToLayer",
        id_arg,
        layer_command(map, "AddSelectionToLayer", |m, id| {
            let root = m.root();
            let _command = UndoableCommand::new(root.undo(), "addSelectionToLayer");
            root.layers().add_selection_to_layer(id);
        }),
    );
    commands.add_command(
        "MoveSelectionToLayer",
        id_arg,
        layer_command(map, "MoveSelectionToLayer", |m, id| {
            let root = m.root();
            let _command = UndoableCommand::new(root.undo(), "moveSelectionToLayer");
            root.layers().move_selection_to_layer(id);
        }),
    );
    commands.add_command(
        "RemoveSelectionFromLayer",
        id_arg,
        layer_command(map, "RemoveSelectionFromLayer", |m, id| {
            let root = m.root();
            let _command = UndoableCommand::new(root.undo(), "removeSelectionFromLayer");
            root.layers().remove_selection_from_layer(id);
        }),
    );
    commands.add_command(
        "ShowLayer",
        id_arg,
        layer_command(map, "ShowLayer", |m, id| m.root().layers().set_layer_visibility(id, true)),
    );
    commands.add_command(
        "HideLayer",
        id_arg,
        layer_command(map, "HideLayer", |m, id| m.root().layers().set_layer_visibility(id, false)),
    );
}

fn register_group_commands(commands: &CommandSystem, map: &Arc<Map>) {
    let m = map.clone();
    commands.add_command("GroupSelected", &[], move |_| {
        let root = m.root();
        let _command = UndoableCommand::new(root.undo(), "GroupSelected");
        if !root.groups().group_selected() {
            tracing::warn!("[groups] Cannot group the current selection");
        }
    });

    let m = map.clone();
    commands.add_command("UngroupSelected", &[], move |_| {
        let root = m.root();
        let _command = UndoableCommand::new(root.undo(), "UngroupSelected");
        root.groups().ungroup_selected();
    });

    let m = map.clone();
    commands.add_command("DeleteAllSelectionGroups", &[], move |_| {
        let root = m.root();
        let _command = UndoableCommand::new(root.undo(), "DeleteAllSelectionGroups");
        root.groups().delete_all_selection_groups();
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::config::Registry;
    use crate::decl::DeclarationManager;
    use crate::eclass::EntityClassManager;
    use crate::scene::{Brush, Node, NodeData};
    use crate::vfs::VirtualFileSystem;

    fn setup_commands() -> (CommandSystem, Arc<Map>) {
        let classes = EntityClassManager::new(DeclarationManager::new(Arc::new(VirtualFileSystem::new())));
        classes.initialise();
        let map = Map::new(classes, Arc::new(Registry::new()));
        map.new_map();
        let commands = CommandSystem::new();
        register_map_commands(&commands, &map);
        (commands, map)
    }

    fn setup_brush(map: &Map, x: f64) -> Arc<Node> {
        let brush = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(x, 0.0, 0.0),
            Vector3::new(x + 8.0, 8.0, 8.0),
            "textures/a",
        )));
        map.find_or_insert_worldspawn().add_child_node(brush.clone());
        brush
    }

    #[test]
    fn test_layer_hide_show_sweep() {
        let (commands, map) = setup_commands();
        let brush = setup_brush(&map, 0.0);
        commands.execute("CreateLayer \"One\"; CreateLayer Two").unwrap();
        map.root().selection().set_selected(&brush, true);
        commands.execute("MoveSelectionToLayer 2").unwrap();
        assert_eq!(brush.layers(), BTreeSet::from([2]));

        commands.execute("HideLayer 2").unwrap();
        assert!(brush.is_filtered());
        commands.execute("ShowLayer 2").unwrap();
        assert!(brush.is_visible());
    }

    #[test]
    fn test_layer_commands_reject_bad_arguments() {
        let (commands, map) = setup_commands();
        let brush = setup_brush(&map, 0.0);
        map.root().selection().set_selected(&brush, true);
        assert!(commands.execute("MoveSelectionToLayer abc").is_err());
        assert!(commands.execute("HideLayer").is_err());
        assert_eq!(brush.layers(), BTreeSet::from([0]));
    }

    #[test]
    fn test_group_commands() {
        let (commands, map) = setup_commands();
        let a = setup_brush(&map, 0.0);
        let b = setup_brush(&map, 16.0);
        let root = map.root();
        root.selection().set_selected(&a, true);
        root.selection().set_selected(&b, true);

        commands.execute("GroupSelected").unwrap();
        assert_eq!(root.groups().group_count(), 1);
        assert_eq!(a.most_recent_group(), Some(1));

        commands.execute("DeleteAllSelectionGroups").unwrap();
        assert_eq!(root.groups().group_count(), 0);
        assert!(b.groups().is_empty());
    }

    #[test]
    fn test_file_commands_with_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, map) = setup_commands();
        let brush = setup_brush(&map, 0.0);
        map.root().selection().set_selected(&brush, true);

        let prefab = dir.path().join("piece.pfb");
        commands
            .execute(&format!("SaveSelectedAsPrefab \"{}\"", prefab.display()))
            .unwrap();
        assert!(prefab.exists());

        commands.execute("NewMap").unwrap();
        assert_eq!(map.root().primitive_count(), 0);
        commands
            .execute(&format!("LoadPrefab \"{}\" \"32 0 0\"", prefab.display()))
            .unwrap();
        assert_eq!(map.root().primitive_count(), 1);
        let selected = map.root().selection().selected_nodes();
        assert!(selected[0].bounds().unwrap().origin().is_near(Vector3::new(36.0, 4.0, 4.0), 1e-6));

        let saved = dir.path().join("level.map");
        commands.execute(&format!("SaveMapAs \"{}\"", saved.display())).unwrap();
        assert!(saved.exists());
        commands.execute("NewMap").unwrap();
        commands.execute(&format!("OpenMap \"{}\"", saved.display())).unwrap();
        assert_eq!(map.name(), "level.map");
        assert_eq!(map.root().primitive_count(), 1);
    }

    #[test]
    fn test_save_without_path_or_selector_does_nothing() {
        let (commands, map) = setup_commands();
        commands.execute("SaveMap").unwrap();
        assert!(map.is_unnamed());
    }
}
